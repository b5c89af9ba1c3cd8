use copilot_core::llm::{RigInference, RigTranscriber};
use copilot_core::{CopilotConfig, IncidentService, IncidentStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "COPILOT_LOG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| format!("failed to initialize tracing subscriber: {error}"))?;

    let config = CopilotConfig::load()?;
    let store = IncidentStore::open(&config.database_path)?;
    let service = IncidentService::new(
        &config,
        store,
        Arc::new(RigInference::new(config.llm.clone())),
        Some(Arc::new(RigTranscriber::new(config.llm.clone()))),
    );

    let resumed = service.resume_pending()?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "resumed unfinished analyses");
    }

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        db = %config.database_path.display(),
        model = %config.llm.model,
        "copilot-server listening"
    );
    axum::serve(listener, copilot_server::api::router(service)).await?;
    Ok(())
}
