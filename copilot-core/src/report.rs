//! On-demand incident reports.
//!
//! Markdown reports spend one inference call on an executive summary and
//! render everything else deterministically from the stored record. JSON
//! reports never call the model.

use crate::actors::IncidentActors;
use crate::config::ReportConfig;
use crate::error::{IncidentError, Result};
use crate::llm::{ChatMessage, Inference, InferenceParams};
use crate::pipeline::{AnalysisSummary, PipelineStep};
use crate::record::{IncidentRecord, Role};
use crate::store::IncidentStore;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

const SUMMARY_WRITER: &str = "You write executive summaries of production incidents for engineering leadership. \
Write 2-3 short paragraphs in plain prose: what happened, the impact, and the current state of the response. \
Do not use headings or bullet points.";

const ROOT_CAUSE_PLACEHOLDER: &str = "_Root cause has not been determined yet._";
const REMEDIATION_PLACEHOLDER: &str = "_No remediation steps have been recorded yet._";

const RECOMMENDATIONS: &[&str] = &[
    "Hold a blameless post-incident review within five business days.",
    "Convert the remediation steps above into tracked action items with owners.",
    "Add or tune alerting so this failure mode is detected before users report it.",
    "Update the relevant runbooks with the diagnosis and mitigation used here.",
    "Verify that rollback procedures for the affected systems are documented and tested.",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
}

impl FromStr for ReportFormat {
    type Err = IncidentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(IncidentError::Validation(format!(
                "unknown report format '{other}' (expected markdown or json)"
            ))),
        }
    }
}

/// Structured report: the full record plus the pipeline's summary when the
/// analysis has completed. Unset optional fields serialize as `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub incident: IncidentRecord,
    pub analysis: Option<AnalysisSummary>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    Markdown(String),
    Json(IncidentReport),
}

impl Report {
    pub fn content_type(&self) -> &'static str {
        match self {
            Report::Markdown(_) => "text/markdown; charset=utf-8",
            Report::Json(_) => "application/json",
        }
    }
}

#[derive(Clone)]
pub struct ReportCompiler {
    store: IncidentStore,
    actors: IncidentActors,
    inference: Arc<dyn Inference>,
    settings: ReportConfig,
}

impl ReportCompiler {
    pub fn new(
        store: IncidentStore,
        actors: IncidentActors,
        inference: Arc<dyn Inference>,
        settings: ReportConfig,
    ) -> Self {
        Self {
            store,
            actors,
            inference,
            settings,
        }
    }

    pub async fn generate(&self, incident_id: &str, format: ReportFormat) -> Result<Report> {
        // Record and analysis come from one snapshot taken under the lane.
        let (record, analysis) = {
            let _lane = self.actors.record(incident_id).await;
            let id = incident_id.to_string();
            self.store
                .blocking(move |store| store.get_with_step(&id, PipelineStep::Summary.name()))
                .await?
        };

        match format {
            ReportFormat::Json => {
                let analysis = analysis.map(serde_json::from_value).transpose()?;
                Ok(Report::Json(IncidentReport {
                    incident: record,
                    analysis,
                }))
            }
            ReportFormat::Markdown => {
                let params = InferenceParams::new(self.settings.temperature, self.settings.max_tokens);
                let prompt = summary_prompt(&record, &self.settings);
                let summary = self.inference.infer(&prompt, params).await.map_err(|err| {
                    tracing::warn!(incident_id, error = %err, "executive summary failed; no report produced");
                    err
                })?;
                tracing::info!(incident_id, "markdown report generated");
                Ok(Report::Markdown(render_markdown(&record, summary.trim(), Utc::now())))
            }
        }
    }
}

/// Condensed view of the record for the executive summary call: metadata and
/// the first few conversation entries, each truncated.
pub fn summary_prompt(record: &IncidentRecord, settings: &ReportConfig) -> Vec<ChatMessage> {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Incident: {} ({})", record.title, record.id);
    let _ = writeln!(prompt, "Severity: {}", record.severity);
    let _ = writeln!(prompt, "Status: {}", record.status);
    let _ = writeln!(prompt, "Description: {}", record.description);
    if !record.affected_systems.is_empty() {
        let _ = writeln!(prompt, "Affected systems: {}", record.affected_systems.join(", "));
    }
    if let Some(root_cause) = &record.root_cause {
        let _ = writeln!(prompt, "Root cause: {}", truncate(root_cause, settings.entry_chars));
    }

    let excerpt: Vec<_> = record.history.iter().take(settings.history_entries).collect();
    if !excerpt.is_empty() {
        prompt.push_str("\nConversation excerpt:\n");
        for message in excerpt {
            let _ = writeln!(
                prompt,
                "{}: {}",
                message.role.as_str(),
                truncate(&message.content, settings.entry_chars)
            );
        }
    }
    prompt.push_str("\nWrite the executive summary.");

    vec![ChatMessage::system(SUMMARY_WRITER), ChatMessage::user(prompt)]
}

pub fn render_markdown(record: &IncidentRecord, executive_summary: &str, generated_at: DateTime<Utc>) -> String {
    let mut doc = String::new();

    let _ = writeln!(doc, "# Incident Report: {}\n", record.title);
    let _ = writeln!(doc, "- **Incident ID:** {}", record.id);
    let _ = writeln!(doc, "- **Severity:** {}", record.severity);
    let _ = writeln!(doc, "- **Status:** {}", record.status);
    let _ = writeln!(doc, "- **Generated:** {}\n", timestamp(generated_at));

    doc.push_str("## Executive Summary\n\n");
    doc.push_str(executive_summary);
    doc.push_str("\n\n");

    doc.push_str("## Incident Details\n\n| Field | Value |\n|---|---|\n");
    let affected = if record.affected_systems.is_empty() {
        "None recorded".to_string()
    } else {
        record.affected_systems.join(", ")
    };
    let end = record.end_time.map(timestamp).unwrap_or_else(|| "Ongoing".into());
    let duration_end = record.end_time.unwrap_or(generated_at);
    let rows = [
        ("Title", record.title.clone()),
        ("Description", record.description.clone()),
        ("Severity", record.severity.to_string()),
        ("Status", record.status.to_string()),
        ("Start time", timestamp(record.start_time)),
        ("End time", end),
        ("Duration", format!("{} minutes", minutes_between(record.start_time, duration_end))),
        ("Affected systems", affected),
    ];
    for (field, value) in rows {
        let _ = writeln!(doc, "| {field} | {} |", table_cell(&value));
    }
    doc.push('\n');

    doc.push_str("## Timeline\n\n");
    if record.timeline.is_empty() {
        doc.push_str("_No timeline events recorded._\n");
    }
    for event in &record.timeline {
        let _ = writeln!(
            doc,
            "- **+{} min** [{}] {}",
            minutes_between(record.start_time, event.timestamp),
            event.kind.as_str(),
            event.description
        );
    }
    doc.push('\n');

    doc.push_str("## Root Cause\n\n");
    doc.push_str(record.root_cause.as_deref().unwrap_or(ROOT_CAUSE_PLACEHOLDER));
    doc.push_str("\n\n");

    doc.push_str("## Remediation\n\n");
    match record.remediation_steps.as_deref() {
        Some(steps) if !steps.is_empty() => {
            for (i, step) in steps.iter().enumerate() {
                let _ = writeln!(doc, "{}. {step}", i + 1);
            }
        }
        _ => {
            doc.push_str(REMEDIATION_PLACEHOLDER);
            doc.push('\n');
        }
    }
    doc.push('\n');

    doc.push_str("## Conversation Log\n\n");
    if record.history.is_empty() {
        doc.push_str("_No conversation recorded._\n\n");
    }
    for message in &record.history {
        let speaker = match message.role {
            Role::User => "Responder",
            Role::Assistant => "Copilot",
        };
        let _ = writeln!(doc, "**{speaker}** ({}):\n\n{}\n", timestamp(message.timestamp), message.content);
    }

    doc.push_str("## Recommendations\n\n");
    for item in RECOMMENDATIONS {
        let _ = writeln!(doc, "- {item}");
    }

    doc
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn minutes_between(start: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    (at - start).num_minutes().max(0)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn table_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}
