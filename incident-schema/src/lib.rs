use serde::{Deserialize, Serialize};

pub const INCIDENT_SCHEMA_V1: &str = "incident.v1";

pub const SEVERITIES: [&str; 4] = ["critical", "high", "medium", "low"];
pub const STATUSES: [&str; 5] = [
    "investigating",
    "identified",
    "mitigating",
    "resolved",
    "monitoring",
];

fn default_schema() -> String {
    INCIDENT_SCHEMA_V1.into()
}

/// Canonical create-incident payload as accepted from the router.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewIncidentV1 {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub affected_systems: Vec<String>,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub metrics: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageV1 {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateV1 {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub remediation_steps: Option<Vec<String>>,
}

pub fn validate_new_incident_v1(incident: &NewIncidentV1) -> Result<(), String> {
    if incident.schema != INCIDENT_SCHEMA_V1 {
        return Err(format!("unsupported schema '{}'", incident.schema));
    }
    if incident.description.trim().is_empty() {
        return Err("description is required".into());
    }
    if incident.severity.trim().is_empty() {
        return Err("severity is required".into());
    }
    let severity = incident.severity.to_lowercase();
    if !SEVERITIES.contains(&severity.as_str()) {
        return Err(format!("invalid severity '{}'", incident.severity));
    }
    if incident
        .affected_systems
        .iter()
        .any(|system| system.trim().is_empty())
    {
        return Err("affected systems must not contain blank entries".into());
    }
    Ok(())
}

pub fn validate_chat_message_v1(incident_id: &str, message: &ChatMessageV1) -> Result<(), String> {
    if incident_id.trim().is_empty() {
        return Err("incident id is required".into());
    }
    if message.message.trim().is_empty() {
        return Err("message is required".into());
    }
    Ok(())
}

pub fn validate_status_update_v1(update: &StatusUpdateV1) -> Result<(), String> {
    if let Some(status) = update.status.as_deref() {
        let status = status.to_lowercase();
        if !STATUSES.contains(&status.as_str()) {
            return Err(format!("invalid status '{status}'"));
        }
    }
    if update.status.is_none() && update.root_cause.is_none() && update.remediation_steps.is_none()
    {
        return Err("status update carries no fields".into());
    }
    Ok(())
}
