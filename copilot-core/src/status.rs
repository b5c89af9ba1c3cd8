use crate::actors::IncidentActors;
use crate::error::Result;
use crate::record::{EventKind, IncidentRecord, IncidentStatus, TimelineEvent};
use crate::store::{IncidentStore, RecordUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fields of an explicit status update. `None` leaves the field untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusFields {
    pub status: Option<IncidentStatus>,
    pub root_cause: Option<String>,
    pub remediation_steps: Option<Vec<String>>,
}

impl StatusFields {
    pub fn status(status: IncidentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Computes the write for an explicit update against `record`. Each field
/// whose value actually changes gets one timeline event; resolving stamps
/// `end_time` when it is still unset.
pub fn plan(record: &IncidentRecord, fields: &StatusFields, now: DateTime<Utc>) -> RecordUpdate {
    let mut update = RecordUpdate::default();

    if let Some(status) = fields.status {
        if status != record.status {
            update.status = Some(status);
            update.events.push(
                TimelineEvent::new(
                    EventKind::Update,
                    format!("Status changed from {} to {}", record.status, status),
                    now,
                )
                .with_payload(serde_json::json!({
                    "from": record.status,
                    "to": status,
                })),
            );
        }
        if status == IncidentStatus::Resolved && record.end_time.is_none() {
            update.end_time = Some(now.max(record.start_time));
        }
    }

    if let Some(root_cause) = fields.root_cause.as_ref() {
        if record.root_cause.as_ref() != Some(root_cause) {
            update.root_cause = Some(root_cause.clone());
            update.events.push(TimelineEvent::new(
                EventKind::Analysis,
                format!("Root cause recorded: {}", first_line(root_cause)),
                now,
            ));
        }
    }

    if let Some(steps) = fields.remediation_steps.as_ref() {
        if record.remediation_steps.as_ref() != Some(steps) {
            update.remediation_steps = Some(steps.clone());
            update.events.push(
                TimelineEvent::new(
                    EventKind::Action,
                    format!("Remediation plan recorded ({} steps)", steps.len()),
                    now,
                )
                .with_payload(serde_json::json!({ "steps": steps })),
            );
        }
    }

    update
}

/// Applies an explicit update under the incident's record lane and returns
/// the resulting record.
pub async fn update_status(
    store: &IncidentStore,
    actors: &IncidentActors,
    incident_id: &str,
    fields: &StatusFields,
) -> Result<IncidentRecord> {
    let _lane = actors.record(incident_id).await;
    let id = incident_id.to_string();
    let fields = fields.clone();
    store
        .blocking(move |store| {
            let record = store.get(&id)?;
            let update = plan(&record, &fields, Utc::now());
            if update.is_empty() {
                return Ok(record);
            }

            store.apply(&id, &update)?;
            tracing::info!(
                incident_id = %id,
                status = ?update.status,
                events = update.events.len(),
                "incident status updated"
            );
            store.get(&id)
        })
        .await
}

fn first_line(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() > 120 {
        let cut: String = line.chars().take(120).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
