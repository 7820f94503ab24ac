use std::sync::Arc;

use crate::core::config::Settings;
use crate::engine::GradingEngine;

struct InnerState {
    settings: Settings,
    engine: GradingEngine,
}

/// Shared application state; clones are cheap handles to the same inner.
#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

impl AppState {
    pub(crate) fn new(settings: Settings, engine: GradingEngine) -> Self {
        Self { inner: Arc::new(InnerState { settings, engine }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn engine(&self) -> &GradingEngine {
        &self.inner.engine
    }
}
