pub mod actors;
pub mod classifier;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod service;
pub mod status;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::CopilotConfig;
pub use error::{IncidentError, Result};
pub use record::{IncidentRecord, IncidentStatus, IncidentSummary, Severity};
pub use report::{Report, ReportFormat};
pub use service::IncidentService;
pub use store::IncidentStore;
