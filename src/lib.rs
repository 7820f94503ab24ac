mod core;
mod engine;
mod extract;
mod model;
mod providers;
mod store;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::engine::GradingEngine;
use crate::extract::PlainTextExtractor;
use crate::store::MemoryStore;

/// Worker entry point: loads configuration, wires telemetry and the engine,
/// then runs until a shutdown signal arrives.
pub async fn run_worker() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load().context("Failed to load settings")?;
    crate::core::telemetry::init_tracing(&settings).context("Failed to initialize tracing")?;
    crate::core::metrics::init(&settings).context("Failed to initialize metrics exporter")?;

    let store = Arc::new(MemoryStore::new());
    let extractor = Arc::new(PlainTextExtractor);
    let engine = GradingEngine::from_settings(&settings, store, extractor)
        .context("Failed to build grading engine")?;

    let recovered = engine.recover_dispatched().await.context("Restart recovery failed")?;
    if recovered > 0 {
        tracing::info!(recovered, "Requeued submissions stranded in flight");
    }

    let state = AppState::new(settings, engine);
    tracing::info!(
        environment = state.settings().runtime().environment.as_str(),
        backends = state.settings().backends().len(),
        worker_pool = state.settings().engine().worker_pool_size,
        "Grading engine ready"
    );

    crate::core::shutdown::wait_for_termination().await;
    state.engine().shutdown().await;

    Ok(())
}
