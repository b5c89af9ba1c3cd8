//! Staged analysis: triage, root cause, remediation, monitoring, summary and,
//! for critical incidents, a delayed verification reminder.
//!
//! Progress is a persisted step log keyed by step name. `run` re-enters the
//! sequence from the top and skips every step whose output is already
//! recorded, so a restart resumes where the previous process stopped. A step
//! output is written in the same transaction as the step's side effects.

mod prompts;
mod steps;

pub use prompts::parse_numbered_steps;
pub use steps::{AnalysisSummary, PipelineStep};

use crate::actors::IncidentActors;
use crate::config::PipelineConfig;
use crate::error::{IncidentError, Result};
use crate::llm::{ChatMessage, Inference, InferenceParams};
use crate::record::{EventKind, IncidentRecord, Message, TimelineEvent};
use crate::status::{self, StatusFields};
use crate::store::{IncidentStore, PipelineRun, RecordUpdate, RunStatus, RunUpdate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use step_effects::Effectful;
use tokio::task::JoinHandle;

pub const VERIFICATION_REMINDER: &str = "**Mitigation check-in**\n\n\
Several minutes have passed since this critical incident was opened. \
Please confirm whether the mitigation is holding: are error rates and latency back \
within normal bounds, and is the affected service stable? Update the incident status \
once you have verified.";

type Outputs = HashMap<String, serde_json::Value>;

#[derive(Clone)]
pub struct AnalysisPipeline {
    store: IncidentStore,
    actors: IncidentActors,
    inference: Arc<dyn Inference>,
    settings: PipelineConfig,
}

impl AnalysisPipeline {
    pub fn new(
        store: IncidentStore,
        actors: IncidentActors,
        inference: Arc<dyn Inference>,
        settings: PipelineConfig,
    ) -> Self {
        Self {
            store,
            actors,
            inference,
            settings,
        }
    }

    /// Runs the pipeline in the background.
    pub fn spawn(&self, incident_id: String) -> JoinHandle<Result<AnalysisSummary>> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(&incident_id).await })
    }

    /// Re-enters every pipeline that has not reached a terminal state.
    pub fn resume_pending(&self) -> Result<Vec<JoinHandle<Result<AnalysisSummary>>>> {
        let pending = self.store.unfinished_runs()?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "resuming unfinished analysis pipelines");
        }
        Ok(pending.into_iter().map(|id| self.spawn(id)).collect())
    }

    pub fn state(&self, incident_id: &str) -> Result<Option<PipelineRun>> {
        if !self.store.exists(incident_id)? {
            return Err(IncidentError::not_found(incident_id));
        }
        self.store.run(incident_id)
    }

    pub async fn run(&self, incident_id: &str) -> Result<AnalysisSummary> {
        let record = self.store.get(incident_id)?;
        let mut outputs: Outputs = self.store.step_outputs(incident_id)?.into_iter().collect();

        if let Some(run) = self.store.run(incident_id)? {
            if run.status == RunStatus::Completed {
                return summary_from(&outputs);
            }
        }
        self.set_run(incident_id, RunStatus::Running, None).await?;
        tracing::info!(
            incident_id,
            recorded_steps = outputs.len(),
            "analysis pipeline started"
        );

        for step in PipelineStep::SEQUENCE {
            if !step.applies_to(record.severity) {
                continue;
            }
            if outputs.contains_key(step.name()) {
                tracing::debug!(incident_id, step = step.name(), "step already recorded; skipping");
                continue;
            }

            match self.run_step(step, &record, &outputs).await {
                Ok(output) => {
                    outputs.insert(step.name().to_string(), output);
                }
                Err(err) => {
                    self.halt(incident_id, step, err.to_string()).await;
                    return Err(err);
                }
            }
        }

        self.set_run(incident_id, RunStatus::Completed, None).await?;
        tracing::info!(incident_id, "analysis pipeline completed");
        summary_from(&outputs)
    }

    async fn run_step(
        &self,
        step: PipelineStep,
        record: &IncidentRecord,
        outputs: &Outputs,
    ) -> Result<serde_json::Value> {
        let recovery = step.recovery();
        let replay_safe = step.effect().replay_safe();
        let mut attempt = 1;
        loop {
            // Writes may have landed before the failure surfaced.
            if attempt > 1 && !replay_safe {
                if let Some(recorded) = self.store.step_output(&record.id, step.name())? {
                    return Ok(recorded);
                }
            }

            match self.execute(step, record, outputs).await {
                Ok(output) => return Ok(output),
                Err(err)
                    if err.is_retryable()
                        && recovery.allows_retry()
                        && attempt < self.settings.max_attempts =>
                {
                    let delay = self.settings.backoff(attempt);
                    tracing::warn!(
                        incident_id = %record.id,
                        step = step.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "pipeline step failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute(
        &self,
        step: PipelineStep,
        record: &IncidentRecord,
        outputs: &Outputs,
    ) -> Result<serde_json::Value> {
        let id = record.id.as_str();
        match step {
            PipelineStep::InitialAnalysis => {
                let messages = prompts::initial_analysis(
                    record.severity,
                    &record.description,
                    record.logs.as_deref(),
                    record.metrics.as_deref(),
                );
                self.infer_step(id, step, &messages, prompts::INITIAL_PARAMS).await
            }
            PipelineStep::PostInitialAnalysis => {
                let initial = text(outputs, PipelineStep::InitialAnalysis)?;
                self.commit(id, step, move |_, now| {
                    let update = RecordUpdate::default()
                        .message(Message::assistant(
                            format!("**Initial automated analysis**\n\n{initial}"),
                            now,
                        ))
                        .event(TimelineEvent::new(
                            EventKind::Analysis,
                            "Initial automated analysis posted to the conversation",
                            now,
                        ));
                    Ok((serde_json::json!({ "posted_at": now }), update))
                })
                .await
            }
            PipelineStep::RootCause => {
                let initial = text(outputs, PipelineStep::InitialAnalysis)?;
                let messages = prompts::root_cause(record.severity, &record.description, &initial);
                self.infer_step(id, step, &messages, prompts::ROOT_CAUSE_PARAMS).await
            }
            PipelineStep::Remediation => {
                let root_cause = text(outputs, PipelineStep::RootCause)?;
                let messages =
                    prompts::remediation(record.severity, &record.description, &root_cause);
                self.infer_step(id, step, &messages, prompts::REMEDIATION_PARAMS).await
            }
            PipelineStep::WriteBack => {
                let root_cause = text(outputs, PipelineStep::RootCause)?;
                let plan = text(outputs, PipelineStep::Remediation)?;
                let steps = parse_numbered_steps(&plan);
                if steps.is_empty() {
                    tracing::warn!(incident_id = id, "remediation plan had no numbered steps");
                }
                self.commit(id, step, move |current, now| {
                    let fields = StatusFields {
                        status: None,
                        root_cause: Some(root_cause),
                        remediation_steps: Some(steps.clone()),
                    };
                    let update = status::plan(current, &fields, now);
                    Ok((serde_json::json!({ "remediation_steps": steps }), update))
                })
                .await
            }
            PipelineStep::Monitoring => {
                let root_cause = text(outputs, PipelineStep::RootCause)?;
                let messages = prompts::monitoring(record.severity, &root_cause);
                self.infer_step(id, step, &messages, prompts::MONITORING_PARAMS).await
            }
            PipelineStep::Summary => {
                let remediation_steps = outputs
                    .get(PipelineStep::WriteBack.name())
                    .and_then(|v| v.get("remediation_steps"))
                    .cloned()
                    .map(serde_json::from_value::<Vec<String>>)
                    .transpose()?
                    .unwrap_or_default();
                let summary = AnalysisSummary {
                    incident_id: record.id.clone(),
                    severity: record.severity,
                    initial_analysis: text(outputs, PipelineStep::InitialAnalysis)?,
                    root_cause: text(outputs, PipelineStep::RootCause)?,
                    remediation_plan: text(outputs, PipelineStep::Remediation)?,
                    remediation_steps,
                    monitoring: text(outputs, PipelineStep::Monitoring)?,
                    started_at: record.start_time,
                    completed_at: Utc::now(),
                };
                let output = serde_json::to_value(&summary)?;
                self.commit(id, step, move |_, _| Ok((output, RecordUpdate::default())))
                    .await
            }
            PipelineStep::DelayedVerification => self.verify(id).await,
        }
    }

    async fn infer_step(
        &self,
        incident_id: &str,
        step: PipelineStep,
        messages: &[ChatMessage],
        params: InferenceParams,
    ) -> Result<serde_json::Value> {
        let reply = self.inference.infer(messages, params).await?;
        self.commit(incident_id, step, move |_, _| {
            Ok((serde_json::Value::String(reply), RecordUpdate::default()))
        })
        .await
    }

    /// Suspends until the persisted wake-up time, then posts the reminder.
    /// The wake-up time is written before sleeping, so a restart only waits
    /// for whatever remains of the delay.
    async fn verify(&self, incident_id: &str) -> Result<serde_json::Value> {
        let scheduled = self.store.run(incident_id)?.and_then(|run| run.wake_at);
        let wake_at = match scheduled {
            Some(at) => at,
            None => {
                let delay = chrono::Duration::from_std(self.settings.verification_delay())
                    .map_err(|e| IncidentError::InvalidState(format!("verification delay: {e}")))?;
                let at = Utc::now() + delay;
                self.set_run(incident_id, RunStatus::Waiting, Some(at)).await?;
                tracing::info!(incident_id, wake_at = %at, "verification reminder scheduled");
                at
            }
        };

        let remaining = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(remaining).await;

        let skip_when_closed = self.settings.skip_verification_when_closed;
        self.commit(incident_id, PipelineStep::DelayedVerification, move |current, now| {
            if skip_when_closed && current.status.is_closed() {
                let update = RecordUpdate::default().event(TimelineEvent::new(
                    EventKind::Update,
                    format!("Verification reminder skipped: incident already {}", current.status),
                    now,
                ));
                return Ok((
                    serde_json::json!({ "skipped": true, "status": current.status }),
                    update,
                ));
            }
            let update = RecordUpdate::default()
                .message(Message::assistant(VERIFICATION_REMINDER, now))
                .event(TimelineEvent::new(
                    EventKind::Action,
                    "Mitigation verification reminder posted",
                    now,
                ));
            Ok((serde_json::json!({ "posted_at": now }), update))
        })
        .await
    }

    /// Records a step output together with its side effects under the record
    /// lane. If another run already recorded the step, its output wins and
    /// `build` is never called.
    async fn commit<F>(&self, incident_id: &str, step: PipelineStep, build: F) -> Result<serde_json::Value>
    where
        F: FnOnce(&IncidentRecord, DateTime<Utc>) -> Result<(serde_json::Value, RecordUpdate)>
            + Send
            + 'static,
    {
        let _lane = self.actors.record(incident_id).await;
        let id = incident_id.to_string();
        self.store
            .blocking(move |store| {
                if let Some(recorded) = store.step_output(&id, step.name())? {
                    return Ok(recorded);
                }

                let current = store.get(&id)?;
                let (output, update) = build(&current, Utc::now())?;
                store.apply(&id, &update.step_output(step.name(), output.clone()))?;
                tracing::info!(incident_id = %id, step = step.name(), "pipeline step recorded");
                Ok(output)
            })
            .await
    }

    async fn set_run(
        &self,
        incident_id: &str,
        status: RunStatus,
        wake_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let update = RecordUpdate {
            run: Some(RunUpdate {
                status,
                wake_at,
                error: None,
            }),
            ..RecordUpdate::default()
        };
        let _lane = self.actors.record(incident_id).await;
        let id = incident_id.to_string();
        self.store.blocking(move |store| store.apply(&id, &update)).await
    }

    async fn halt(&self, incident_id: &str, step: PipelineStep, error: String) {
        tracing::error!(incident_id, step = step.name(), %error, "analysis pipeline halted");

        let now = Utc::now();
        let update = RecordUpdate {
            run: Some(RunUpdate {
                status: RunStatus::Failed,
                wake_at: None,
                error: Some(error.clone()),
            }),
            ..RecordUpdate::default()
        }
        .event(
            TimelineEvent::new(
                EventKind::Update,
                format!("Automated analysis halted at step {}: {error}", step.name()),
                now,
            )
            .with_payload(serde_json::json!({
                "step": step.name(),
                "error": error,
            })),
        );

        let _lane = self.actors.record(incident_id).await;
        let id = incident_id.to_string();
        if let Err(write_err) = self.store.blocking(move |store| store.apply(&id, &update)).await {
            tracing::error!(incident_id, error = %write_err, "failed to record pipeline halt");
        }
    }
}

fn text(outputs: &Outputs, step: PipelineStep) -> Result<String> {
    outputs
        .get(step.name())
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| IncidentError::InvalidState(format!("missing output of step {}", step.name())))
}

fn summary_from(outputs: &Outputs) -> Result<AnalysisSummary> {
    let raw = outputs
        .get(PipelineStep::Summary.name())
        .cloned()
        .ok_or_else(|| IncidentError::InvalidState("analysis summary not recorded".into()))?;
    Ok(serde_json::from_value(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{IncidentStatus, Role, Severity};
    use crate::testing::ScriptedInference;

    const PLAN: &str = "Immediate mitigation:\n1. Fail over to the standby database\n2. Shed batch traffic\nLong term:\n3. Add connection pool alerts";

    fn seeded(dir: &tempfile::TempDir, severity: Severity) -> IncidentStore {
        let store = IncidentStore::open(dir.path().join("pipeline.db")).expect("open");
        store
            .insert(&IncidentRecord {
                id: "inc-p".into(),
                title: "Checkout 504s".into(),
                description: "Users reporting 504 errors".into(),
                status: IncidentStatus::Investigating,
                severity,
                affected_systems: Vec::new(),
                start_time: Utc::now(),
                end_time: None,
                root_cause: None,
                remediation_steps: None,
                logs: None,
                metrics: None,
                timeline: Vec::new(),
                history: Vec::new(),
            })
            .expect("insert");
        store
    }

    fn pipeline(store: &IncidentStore, inference: Arc<ScriptedInference>) -> AnalysisPipeline {
        AnalysisPipeline::new(
            store.clone(),
            IncidentActors::new(),
            inference,
            PipelineConfig::default(),
        )
    }

    fn happy_script() -> ScriptedInference {
        ScriptedInference::replying([
            "Affected: checkout API. First step: check upstream latency.",
            "Root cause: database connection pool exhausted.",
            PLAN,
            "Alert on pool saturation above 80%.",
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn high_severity_writes_back_and_skips_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::High);
        let inference = Arc::new(happy_script());

        let summary = pipeline(&store, inference.clone()).run("inc-p").await.expect("run");

        assert_eq!(summary.remediation_steps.len(), 3);
        let record = store.get("inc-p").expect("get");
        assert_eq!(
            record.root_cause.as_deref(),
            Some("Root cause: database connection pool exhausted.")
        );
        assert_eq!(
            record.remediation_steps.as_deref(),
            Some(
                &[
                    "Fail over to the standby database".to_string(),
                    "Shed batch traffic".to_string(),
                    "Add connection pool alerts".to_string(),
                ][..]
            )
        );
        assert_eq!(record.history.len(), 1);
        assert!(record.history[0].content.contains("Initial automated analysis"));

        let run = store.run("inc-p").expect("run").expect("present");
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!run.completed_steps.contains(&"delayed_verification".to_string()));
        assert_eq!(inference.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn each_step_uses_its_own_sampling_parameters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::Low);
        let inference = Arc::new(happy_script());
        pipeline(&store, inference.clone()).run("inc-p").await.expect("run");

        let temps: Vec<f64> = inference.calls().iter().map(|(_, p)| p.temperature).collect();
        assert_eq!(temps, vec![0.3, 0.4, 0.5, 0.6]);
        let calls = inference.calls();
        assert!(calls[2].0[1].content.contains("Root cause: database connection pool exhausted."));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_only_the_failing_step() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::Medium);
        let inference = Arc::new(ScriptedInference::scripted([
            Ok("initial".to_string()),
            Err("upstream 503".to_string()),
            Ok("Root cause: bad deploy".to_string()),
            Ok(PLAN.to_string()),
            Ok("alerts".to_string()),
        ]));

        pipeline(&store, inference.clone()).run("inc-p").await.expect("run");
        assert_eq!(inference.calls().len(), 5);
        assert_eq!(store.get("inc-p").expect("get").history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_halts_and_keeps_partial_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::High);
        let inference = Arc::new(ScriptedInference::replying(["initial only"]));

        let err = pipeline(&store, inference.clone()).run("inc-p").await.expect_err("halts");
        assert!(matches!(err, IncidentError::Service(_)));

        let record = store.get("inc-p").expect("get");
        assert_eq!(record.history.len(), 1);
        assert!(record.root_cause.is_none());
        let halt = record.timeline.last().expect("halt event");
        assert_eq!(halt.kind, EventKind::Update);
        assert_eq!(
            halt.payload.as_ref().and_then(|p| p.get("step")),
            Some(&serde_json::json!("root_cause"))
        );

        let run = store.run("inc-p").expect("run").expect("present");
        assert_eq!(run.status, RunStatus::Failed);
        // 1 initial + 3 attempts at root cause
        assert_eq!(inference.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_recorded_steps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::High);

        let first = Arc::new(ScriptedInference::replying(["initial"]));
        assert!(pipeline(&store, first).run("inc-p").await.is_err());

        let second = Arc::new(ScriptedInference::replying([
            "Root cause: cache stampede",
            PLAN,
            "alerts",
        ]));
        pipeline(&store, second.clone()).run("inc-p").await.expect("resume");

        assert_eq!(second.calls().len(), 3);
        let record = store.get("inc-p").expect("get");
        let initial_posts = record
            .history
            .iter()
            .filter(|m| m.role == Role::Assistant && m.content.contains("Initial automated analysis"))
            .count();
        assert_eq!(initial_posts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_posts_one_reminder_after_delay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::Critical);
        let pipeline = pipeline(&store, Arc::new(happy_script()));

        let handle = pipeline.spawn("inc-p".into());
        handle.await.expect("join").expect("run");

        let record = store.get("inc-p").expect("get");
        let reminders = record
            .history
            .iter()
            .filter(|m| m.content == VERIFICATION_REMINDER)
            .count();
        assert_eq!(reminders, 1);

        let run = store.run("inc-p").expect("run").expect("present");
        assert!(run.wake_at.is_some());
        assert_eq!(run.status, RunStatus::Completed);

        // A second run of a completed pipeline is a no-op.
        pipeline.run("inc-p").await.expect("rerun");
        assert_eq!(store.get("inc-p").expect("get").history.len(), record.history.len());
    }

    #[tokio::test(start_paused = true)]
    async fn reminder_is_skipped_when_already_resolved() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::Critical);
        let pipeline = pipeline(&store, Arc::new(happy_script()));

        let handle = pipeline.spawn("inc-p".into());
        // Let the pipeline reach its suspend point, then resolve.
        while store.run("inc-p").expect("run").map(|r| r.status) != Some(RunStatus::Waiting) {
            tokio::task::yield_now().await;
        }
        status::update_status(
            &store,
            &IncidentActors::new(),
            "inc-p",
            &StatusFields::status(IncidentStatus::Resolved),
        )
        .await
        .expect("resolve");

        handle.await.expect("join").expect("run");
        let record = store.get("inc-p").expect("get");
        assert!(!record.history.iter().any(|m| m.content == VERIFICATION_REMINDER));
        assert_eq!(
            store
                .step_output("inc-p", "delayed_verification")
                .expect("output")
                .and_then(|v| v.get("skipped").cloned()),
            Some(serde_json::json!(true))
        );
    }

    #[tokio::test]
    async fn missing_incident_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(&dir, Severity::Low);
        let result = pipeline(&store, Arc::new(happy_script())).run("inc-missing").await;
        assert!(matches!(result, Err(IncidentError::NotFound { .. })));
    }
}
