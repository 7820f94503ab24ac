use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::config::Settings;
use crate::engine::governor::RateGovernor;
use crate::providers::openai::OpenAiGateway;
use crate::providers::ProviderGateway;

/// One configured backend: its gateway plus the governor bounding calls to
/// it. Constructed once and shared by handle; there is no process-global
/// limiter state.
#[derive(Clone)]
pub(crate) struct ProviderHandle {
    pub(crate) gateway: Arc<dyn ProviderGateway>,
    pub(crate) governor: Arc<RateGovernor>,
}

pub(crate) struct ProviderRegistry {
    providers: HashMap<String, ProviderHandle>,
}

impl ProviderRegistry {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let mut providers = HashMap::new();
        for backend in settings.backends() {
            let gateway = OpenAiGateway::from_settings(backend, settings.http())
                .with_context(|| format!("Failed to build gateway for backend {}", backend.id))?;
            let governor = RateGovernor::new(
                backend.id.clone(),
                backend.capacity,
                backend.min_interval_ms.map(Duration::from_millis),
            );
            providers.insert(
                backend.id.clone(),
                ProviderHandle { gateway: Arc::new(gateway), governor: Arc::new(governor) },
            );
        }

        Ok(Self { providers })
    }

    pub(crate) fn empty() -> Self {
        Self { providers: HashMap::new() }
    }

    pub(crate) fn register(
        &mut self,
        gateway: Arc<dyn ProviderGateway>,
        capacity: Option<usize>,
        min_interval: Option<Duration>,
    ) {
        let backend = gateway.backend_id().to_string();
        let governor = Arc::new(RateGovernor::new(backend.clone(), capacity, min_interval));
        self.providers.insert(backend, ProviderHandle { gateway, governor });
    }

    pub(crate) fn get(&self, backend: &str) -> Option<&ProviderHandle> {
        self.providers.get(backend)
    }

    pub(crate) fn contains(&self, backend: &str) -> bool {
        self.providers.contains_key(backend)
    }
}
