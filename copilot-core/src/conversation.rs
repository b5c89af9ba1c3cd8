use crate::actors::IncidentActors;
use crate::classifier::{self, StatusClassifier};
use crate::config::ChatConfig;
use crate::context;
use crate::error::{IncidentError, Result};
use crate::llm::{ChatMessage, Inference, InferenceParams};
use crate::record::{EventKind, IncidentRecord, Message, Role, TimelineEvent};
use crate::store::{IncidentStore, RecordUpdate};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub assistant_text: String,
    pub record: IncidentRecord,
}

/// Turn-taking over one incident's conversation.
///
/// A turn is only written once the model has answered: the user message,
/// the assistant reply, the audit event and any status transitions land in
/// one store transaction. A failed model call leaves the record untouched.
#[derive(Clone)]
pub struct ConversationEngine {
    store: IncidentStore,
    actors: IncidentActors,
    inference: Arc<dyn Inference>,
    classifier: Arc<dyn StatusClassifier>,
    settings: ChatConfig,
}

impl ConversationEngine {
    pub fn new(
        store: IncidentStore,
        actors: IncidentActors,
        inference: Arc<dyn Inference>,
        classifier: Arc<dyn StatusClassifier>,
        settings: ChatConfig,
    ) -> Self {
        Self {
            store,
            actors,
            inference,
            classifier,
            settings,
        }
    }

    pub async fn post_message(&self, incident_id: &str, text: &str) -> Result<TurnOutcome> {
        if incident_id.trim().is_empty() {
            return Err(IncidentError::Validation("incident id is required".into()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(IncidentError::Validation("message is required".into()));
        }

        let _turn = self.actors.turn(incident_id).await;
        let snapshot = self.store.get(incident_id)?;
        let user_message = Message::user(text, Utc::now());

        let messages = prompt_messages(&snapshot, &user_message);
        let params = InferenceParams::new(self.settings.temperature, self.settings.max_tokens);
        let assistant_text = match self.inference.infer(&messages, params).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(incident_id, error = %err, "chat turn failed; nothing recorded");
                return Err(err);
            }
        };

        let record = {
            let _lane = self.actors.record(incident_id).await;
            let engine = self.clone();
            let id = incident_id.to_string();
            let reply = assistant_text.clone();
            self.store
                .blocking(move |store| {
                    // Re-read: the pipeline may have written while the model was busy.
                    let current = store.get(&id)?;
                    let update = engine.turn_update(&current, user_message, &reply);
                    store.apply(&id, &update)?;
                    if let Some(status) = update.status {
                        tracing::info!(incident_id = %id, from = %current.status, to = %status, "status advanced by chat");
                    }
                    store.get(&id)
                })
                .await?
        };

        Ok(TurnOutcome {
            assistant_text,
            record,
        })
    }

    fn turn_update(
        &self,
        current: &IncidentRecord,
        user_message: Message,
        assistant_text: &str,
    ) -> RecordUpdate {
        let now = Utc::now();
        let audit = TimelineEvent::new(EventKind::Update, "Conversation turn", now).with_payload(
            serde_json::json!({
                "user": user_message.content,
                "assistant": assistant_text,
            }),
        );
        let mut update = RecordUpdate::default()
            .message(user_message)
            .message(Message::assistant(assistant_text, now))
            .event(audit);

        for transition in classifier::transitions(self.classifier.as_ref(), assistant_text, current.status) {
            update.status = Some(transition.to);
            update.events.push(
                TimelineEvent::new(
                    transition.event_kind(),
                    format!(
                        "Status advanced from {} to {} based on assistant analysis",
                        transition.from, transition.to
                    ),
                    now,
                )
                .with_payload(serde_json::json!({
                    "from": transition.from,
                    "to": transition.to,
                })),
            );
        }

        update
    }
}

/// `[system: context] + history + new user message`. The context reflects the
/// record as it stood before this turn.
fn prompt_messages(snapshot: &IncidentRecord, user_message: &Message) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(snapshot.history.len() + 2);
    messages.push(ChatMessage::system(context::build(snapshot)));
    for message in &snapshot.history {
        messages.push(match message.role {
            Role::User => ChatMessage::user(message.content.clone()),
            Role::Assistant => ChatMessage::assistant(message.content.clone()),
        });
    }
    messages.push(ChatMessage::user(user_message.content.clone()));
    messages
}
