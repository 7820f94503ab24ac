use std::env;

use super::types::{ConfigError, Environment};
use crate::model::types::BackendKind;

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u16(field: &str, value: String) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidValue { field: field.to_string(), value })
}

pub(super) fn parse_u32(field: &str, value: String) -> Result<u32, ConfigError> {
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidValue { field: field.to_string(), value })
}

pub(super) fn parse_u64(field: &str, value: String) -> Result<u64, ConfigError> {
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue { field: field.to_string(), value })
}

pub(super) fn parse_usize(field: &str, value: String) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue { field: field.to_string(), value })
}

pub(super) fn parse_f64(field: &str, value: String) -> Result<f64, ConfigError> {
    value
        .parse::<f64>()
        .map_err(|_| ConfigError::InvalidValue { field: field.to_string(), value })
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_string_list(value: Option<String>) -> Vec<String> {
    match value {
        Some(raw) => raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_backend_kind(field: &str, value: String) -> Result<BackendKind, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "openai" => Ok(BackendKind::Openai),
        "local" => Ok(BackendKind::Local),
        _ => Err(ConfigError::InvalidValue { field: field.to_string(), value }),
    }
}

/// Backend identity to env-var fragment: `gpt-4o.main` becomes `GPT_4O_MAIN`.
pub(super) fn backend_env_fragment(id: &str) -> String {
    id.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch.to_ascii_uppercase() } else { '_' })
        .collect()
}
