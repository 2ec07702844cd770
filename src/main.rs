//! Agent Run Orchestrator server.

use std::sync::Arc;

use agent_run_orchestrator::{config::AppConfig, runs::telemetry, server};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before config reads the environment.
    let _ = dotenvy::dotenv();

    telemetry::init();

    let config = AppConfig::load()?;
    tracing::info!(
        name: "config.loaded",
        store = %config.store.provider,
        agent_service = %config.agent_service.base_url,
        "Configuration loaded"
    );

    server::start_server(Arc::new(config)).await
}
