//! System-context assembly for every model call made on behalf of an incident.
//!
//! The context is rebuilt on each call: status, root cause and age all move
//! between turns, so nothing here is cached.

use crate::record::IncidentRecord;
use chrono::{DateTime, Utc};

pub const PERSONA: &str = "You are an incident response copilot working alongside on-call engineers.

For every incident, reason through this framework:
1. Identify: what is failing and how it presents.
2. Impact: who and what is affected, and how badly.
3. Root cause: the most likely underlying cause, with the evidence for it.
4. Remediation: concrete mitigation first, then the durable fix.
5. Prevention: monitoring, tests or process changes that stop a repeat.

Guidelines:
- Be concise. Lead with the next action an engineer should take.
- Say \"root cause\" explicitly when you have identified one.
- Prefer reversible, low-risk actions and call out anything destructive.
- Never invent log lines, metrics or command output you have not been given.
- Ask for the specific data you need when the evidence is insufficient.";

pub const REMEDIATION_SEPARATOR: &str = "; ";

/// Builds the context string using the current wall clock for incident age.
pub fn build(record: &IncidentRecord) -> String {
    build_at(record, Utc::now())
}

/// Deterministic form of [`build`]: identical inputs give identical output.
pub fn build_at(record: &IncidentRecord, now: DateTime<Utc>) -> String {
    let mut lines = vec![
        "Current incident:".to_string(),
        format!("- Incident ID: {}", record.id),
        format!("- Title: {}", record.title),
        format!("- Status: {}", record.status),
        format!("- Severity: {}", record.severity),
        format!("- Description: {}", record.description),
    ];
    if !record.affected_systems.is_empty() {
        lines.push(format!(
            "- Affected systems: {}",
            record.affected_systems.join(", ")
        ));
    }
    if let Some(root_cause) = record.root_cause.as_deref() {
        lines.push(format!("- Known root cause: {root_cause}"));
    }
    if let Some(steps) = record.remediation_steps.as_ref() {
        lines.push(format!(
            "- Remediation steps: {}",
            steps.join(REMEDIATION_SEPARATOR)
        ));
    }
    lines.push(format!(
        "- Incident age: {} minutes",
        record.age_minutes(now)
    ));

    format!("{PERSONA}\n\n{}", lines.join("\n"))
}
