use thiserror::Error;

use crate::model::types::BackendKind;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) runtime: RuntimeSettings,
    pub(super) engine: EngineSettings,
    pub(super) retry: RetrySettings,
    pub(super) http: HttpSettings,
    pub(super) telemetry: TelemetrySettings,
    pub(super) backends: Vec<BackendSettings>,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    /// Bounds concurrently executing runner attempts, independent of any
    /// backend governor's capacity.
    pub(crate) worker_pool_size: usize,
    pub(crate) default_max_retries: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct RetrySettings {
    pub(crate) base_delay_ms: u64,
    pub(crate) max_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct HttpSettings {
    pub(crate) request_timeout_secs: u64,
    pub(crate) connect_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
    pub(crate) prometheus_port: u16,
}

#[derive(Debug, Clone)]
pub(crate) struct BackendSettings {
    pub(crate) id: String,
    pub(crate) kind: BackendKind,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) model: String,
    /// Governor capacity; None means unbounded (self-hosted backends).
    pub(crate) capacity: Option<usize>,
    /// Optional minimum interval between call starts, for pacing.
    pub(crate) min_interval_ms: Option<u64>,
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
    #[error("missing required secret for {0}")]
    MissingSecret(String),
    #[error("no backends configured; set GRADEFLOW_BACKENDS")]
    NoBackends,
}
