use crate::record::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use step_effects_derive::Effectful;

/// Named stages of the automated analysis, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Effectful)]
pub enum PipelineStep {
    #[effect(Observe)]
    InitialAnalysis,
    #[effect(Mutate)]
    PostInitialAnalysis,
    #[effect(Observe)]
    RootCause,
    #[effect(Observe)]
    Remediation,
    #[effect(Mutate)]
    WriteBack,
    #[effect(Observe)]
    Monitoring,
    #[effect(Pure)]
    Summary,
    #[effect(Mutate)]
    DelayedVerification,
}

impl PipelineStep {
    pub const SEQUENCE: [PipelineStep; 8] = [
        PipelineStep::InitialAnalysis,
        PipelineStep::PostInitialAnalysis,
        PipelineStep::RootCause,
        PipelineStep::Remediation,
        PipelineStep::WriteBack,
        PipelineStep::Monitoring,
        PipelineStep::Summary,
        PipelineStep::DelayedVerification,
    ];

    /// Key under which the step's output is recorded in the step log.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStep::InitialAnalysis => "initial_analysis",
            PipelineStep::PostInitialAnalysis => "post_initial_analysis",
            PipelineStep::RootCause => "root_cause",
            PipelineStep::Remediation => "remediation",
            PipelineStep::WriteBack => "write_back",
            PipelineStep::Monitoring => "monitoring",
            PipelineStep::Summary => "summary",
            PipelineStep::DelayedVerification => "delayed_verification",
        }
    }

    pub fn applies_to(&self, severity: Severity) -> bool {
        match self {
            PipelineStep::DelayedVerification => severity == Severity::Critical,
            _ => true,
        }
    }
}

/// Aggregate result of a completed analysis, recorded as the `summary` step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub incident_id: String,
    pub severity: Severity,
    pub initial_analysis: String,
    pub root_cause: String,
    pub remediation_plan: String,
    pub remediation_steps: Vec<String>,
    pub monitoring: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}
