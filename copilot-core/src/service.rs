//! Router-facing operations. Wires the store, the per-incident lanes and the
//! inference ports into the conversation engine, the analysis pipeline and
//! the report compiler.

use crate::actors::IncidentActors;
use crate::classifier::{KeywordClassifier, StatusClassifier};
use crate::config::{ChatConfig, CopilotConfig};
use crate::conversation::{ConversationEngine, TurnOutcome};
use crate::error::{IncidentError, Result};
use crate::llm::{Inference, Transcriber};
use crate::pipeline::{AnalysisPipeline, AnalysisSummary};
use crate::record::{
    EventKind, IncidentRecord, IncidentStatus, IncidentSummary, Severity, TimelineEvent,
};
use crate::report::{Report, ReportCompiler, ReportFormat};
use crate::status::{self, StatusFields};
use crate::store::{IncidentStore, PipelineRun};
use chrono::Utc;
use incident_schema::{
    validate_chat_message_v1, validate_new_incident_v1, validate_status_update_v1, ChatMessageV1,
    NewIncidentV1, StatusUpdateV1,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

const TITLE_CHARS: usize = 80;

#[derive(Clone)]
pub struct IncidentService {
    store: IncidentStore,
    actors: IncidentActors,
    inference: Arc<dyn Inference>,
    transcriber: Option<Arc<dyn Transcriber>>,
    chat: ChatConfig,
    conversation: ConversationEngine,
    pipeline: AnalysisPipeline,
    reports: ReportCompiler,
}

impl IncidentService {
    pub fn new(
        config: &CopilotConfig,
        store: IncidentStore,
        inference: Arc<dyn Inference>,
        transcriber: Option<Arc<dyn Transcriber>>,
    ) -> Self {
        let actors = IncidentActors::new();
        let conversation = ConversationEngine::new(
            store.clone(),
            actors.clone(),
            inference.clone(),
            Arc::new(KeywordClassifier::default()),
            config.chat.clone(),
        );
        let pipeline = AnalysisPipeline::new(
            store.clone(),
            actors.clone(),
            inference.clone(),
            config.pipeline.clone(),
        );
        let reports = ReportCompiler::new(
            store.clone(),
            actors.clone(),
            inference.clone(),
            config.report.clone(),
        );
        Self {
            store,
            actors,
            inference,
            transcriber,
            chat: config.chat.clone(),
            conversation,
            pipeline,
            reports,
        }
    }

    /// Replaces the keyword heuristic used after each chat turn.
    pub fn with_classifier(mut self, classifier: Arc<dyn StatusClassifier>) -> Self {
        self.conversation = ConversationEngine::new(
            self.store.clone(),
            self.actors.clone(),
            self.inference.clone(),
            classifier,
            self.chat.clone(),
        );
        self
    }

    /// Creates the incident and starts its analysis in the background.
    pub async fn create_incident(&self, request: NewIncidentV1) -> Result<String> {
        let (incident_id, _analysis) = self.create_incident_tracked(request).await?;
        Ok(incident_id)
    }

    /// Like [`create_incident`](Self::create_incident), also returning the
    /// handle of the spawned analysis.
    pub async fn create_incident_tracked(
        &self,
        request: NewIncidentV1,
    ) -> Result<(String, JoinHandle<Result<AnalysisSummary>>)> {
        validate_new_incident_v1(&request).map_err(IncidentError::Validation)?;
        let severity: Severity = request.severity.parse()?;

        let now = Utc::now();
        let id = format!("inc-{}", uuid::Uuid::new_v4().simple());
        let title = request
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| default_title(&request.description));

        let mut affected_systems: Vec<String> = Vec::new();
        for system in &request.affected_systems {
            let system = system.trim().to_string();
            if !affected_systems.contains(&system) {
                affected_systems.push(system);
            }
        }

        let record = IncidentRecord {
            id: id.clone(),
            title,
            description: request.description.trim().to_string(),
            status: IncidentStatus::Investigating,
            severity,
            affected_systems,
            start_time: now,
            end_time: None,
            root_cause: None,
            remediation_steps: None,
            logs: request.logs.filter(|l| !l.trim().is_empty()),
            metrics: request.metrics.filter(|m| !m.trim().is_empty()),
            timeline: vec![TimelineEvent::new(
                EventKind::Detection,
                format!("Incident opened with {severity} severity"),
                now,
            )],
            history: Vec::new(),
        };
        self.store.insert(&record)?;
        tracing::info!(incident_id = %id, %severity, "incident created");

        let analysis = self.pipeline.spawn(id.clone());
        Ok((id, analysis))
    }

    pub async fn post_message(&self, incident_id: &str, text: &str) -> Result<TurnOutcome> {
        let message = ChatMessageV1 {
            message: text.to_string(),
        };
        validate_chat_message_v1(incident_id, &message).map_err(IncidentError::Validation)?;
        self.conversation.post_message(incident_id, &message.message).await
    }

    /// Transcribes the audio and posts it as a chat turn. An empty transcript
    /// is "no input": `Ok(None)` and nothing is written.
    pub async fn post_voice_message(&self, incident_id: &str, audio: &[u8]) -> Result<Option<TurnOutcome>> {
        let Some(transcriber) = self.transcriber.as_ref() else {
            return Err(IncidentError::Service("transcription is not configured".into()));
        };
        if incident_id.trim().is_empty() {
            return Err(IncidentError::Validation("incident id is required".into()));
        }
        if !self.store.exists(incident_id)? {
            return Err(IncidentError::not_found(incident_id));
        }

        let transcript = transcriber.transcribe(audio).await?;
        let transcript = transcript.trim();
        if transcript.is_empty() {
            tracing::info!(incident_id, "empty transcript; voice message ignored");
            return Ok(None);
        }
        self.conversation.post_message(incident_id, transcript).await.map(Some)
    }

    pub async fn get_record(&self, incident_id: &str) -> Result<IncidentRecord> {
        let _lane = self.actors.record(incident_id).await;
        self.store.get(incident_id)
    }

    pub fn list_incidents(&self) -> Result<Vec<IncidentSummary>> {
        self.store.list()
    }

    pub async fn update_status(&self, incident_id: &str, request: StatusUpdateV1) -> Result<IncidentRecord> {
        validate_status_update_v1(&request).map_err(IncidentError::Validation)?;
        let fields = StatusFields {
            status: request.status.as_deref().map(str::parse).transpose()?,
            root_cause: request.root_cause,
            remediation_steps: request.remediation_steps,
        };
        status::update_status(&self.store, &self.actors, incident_id, &fields).await
    }

    pub async fn get_report(&self, incident_id: &str, format: ReportFormat) -> Result<Report> {
        self.reports.generate(incident_id, format).await
    }

    pub fn pipeline_state(&self, incident_id: &str) -> Result<Option<PipelineRun>> {
        self.pipeline.state(incident_id)
    }

    /// Restarts every analysis left unfinished by a previous process.
    pub fn resume_pending(&self) -> Result<Vec<JoinHandle<Result<AnalysisSummary>>>> {
        self.pipeline.resume_pending()
    }
}

fn default_title(description: &str) -> String {
    let line = description
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    line.chars().take(TITLE_CHARS).collect()
}
