use crate::error::IncidentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl FromStr for Severity {
    type Err = IncidentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(IncidentError::Validation(format!("invalid severity '{other}'"))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Mitigating,
    Resolved,
    Monitoring,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Identified => "identified",
            IncidentStatus::Mitigating => "mitigating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Monitoring => "monitoring",
        }
    }

    /// Position on the investigating -> identified -> mitigating -> resolved
    /// track. `Monitoring` is a side state and has no rank.
    pub fn progress_rank(&self) -> Option<u8> {
        match self {
            IncidentStatus::Investigating => Some(0),
            IncidentStatus::Identified => Some(1),
            IncidentStatus::Mitigating => Some(2),
            IncidentStatus::Resolved => Some(3),
            IncidentStatus::Monitoring => None,
        }
    }

    /// True when `next` is strictly further along the forward track.
    pub fn advances_to(&self, next: IncidentStatus) -> bool {
        match (self.progress_rank(), next.progress_rank()) {
            (Some(current), Some(next)) => next > current,
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Monitoring)
    }
}

impl FromStr for IncidentStatus {
    type Err = IncidentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "investigating" => Ok(IncidentStatus::Investigating),
            "identified" => Ok(IncidentStatus::Identified),
            "mitigating" => Ok(IncidentStatus::Mitigating),
            "resolved" => Ok(IncidentStatus::Resolved),
            "monitoring" => Ok(IncidentStatus::Monitoring),
            other => Err(IncidentError::Validation(format!("invalid status '{other}'"))),
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Detection,
    Analysis,
    Action,
    Update,
    Resolution,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Detection => "detection",
            EventKind::Analysis => "analysis",
            EventKind::Action => "action",
            EventKind::Update => "update",
            EventKind::Resolution => "resolution",
        }
    }
}

impl FromStr for EventKind {
    type Err = IncidentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "detection" => Ok(EventKind::Detection),
            "analysis" => Ok(EventKind::Analysis),
            "action" => Ok(EventKind::Action),
            "update" => Ok(EventKind::Update),
            "resolution" => Ok(EventKind::Resolution),
            other => Err(IncidentError::InvalidState(format!("unknown event kind '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = IncidentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(IncidentError::InvalidState(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
        }
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub description: String,
    pub payload: Option<serde_json::Value>,
}

impl TimelineEvent {
    pub fn new(kind: EventKind, description: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind,
            description: description.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Full state of one incident. `timeline` and `history` only ever grow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub affected_systems: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub root_cause: Option<String>,
    pub remediation_steps: Option<Vec<String>>,
    pub logs: Option<String>,
    pub metrics: Option<String>,
    pub timeline: Vec<TimelineEvent>,
    pub history: Vec<Message>,
}

impl IncidentRecord {
    /// Whole minutes since the incident started, never negative.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_time).num_minutes().max(0)
    }
}

/// Row shape for incident listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub id: String,
    pub title: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub start_time: DateTime<Utc>,
}
