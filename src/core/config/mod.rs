mod parsing;
mod settings;
mod types;

pub(crate) use types::{
    BackendSettings, ConfigError, EngineSettings, Environment, HttpSettings, RetrySettings,
    RuntimeSettings, Settings, TelemetrySettings,
};
