use super::parsing::{
    backend_env_fragment, env_optional, env_or_default, parse_backend_kind, parse_bool, parse_f64,
    parse_environment, parse_string_list, parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::types::{
    BackendSettings, ConfigError, EngineSettings, HttpSettings, RetrySettings, RuntimeSettings,
    Settings, TelemetrySettings,
};
use crate::model::types::BackendKind;

const PROPRIETARY_DEFAULT_CAPACITY: usize = 4;

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let environment =
            parse_environment(env_optional("GRADEFLOW_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config = env_optional("GRADEFLOW_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let worker_pool_size = match env_optional("GRADEFLOW_WORKER_POOL_SIZE") {
            Some(value) => parse_usize("GRADEFLOW_WORKER_POOL_SIZE", value)?,
            None => default_worker_pool_size(),
        };
        let default_max_retries = parse_u32(
            "GRADEFLOW_DEFAULT_MAX_RETRIES",
            env_or_default("GRADEFLOW_DEFAULT_MAX_RETRIES", "3"),
        )?;

        let base_delay_ms = parse_u64(
            "GRADEFLOW_RETRY_BASE_DELAY_MS",
            env_or_default("GRADEFLOW_RETRY_BASE_DELAY_MS", "1000"),
        )?;
        let max_delay_ms = parse_u64(
            "GRADEFLOW_RETRY_MAX_DELAY_MS",
            env_or_default("GRADEFLOW_RETRY_MAX_DELAY_MS", "60000"),
        )?;

        let request_timeout_secs = parse_u64(
            "GRADEFLOW_REQUEST_TIMEOUT_SECS",
            env_or_default("GRADEFLOW_REQUEST_TIMEOUT_SECS", "600"),
        )?;
        let connect_timeout_secs = parse_u64(
            "GRADEFLOW_CONNECT_TIMEOUT_SECS",
            env_or_default("GRADEFLOW_CONNECT_TIMEOUT_SECS", "30"),
        )?;

        let log_level = env_or_default("GRADEFLOW_LOG_LEVEL", "info");
        let json = env_optional("GRADEFLOW_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_port =
            parse_u16("PROMETHEUS_PORT", env_or_default("PROMETHEUS_PORT", "9187"))?;

        let backend_ids = parse_string_list(env_optional("GRADEFLOW_BACKENDS"));
        let mut backends = Vec::with_capacity(backend_ids.len());
        for id in backend_ids {
            backends.push(load_backend(&id)?);
        }

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            engine: EngineSettings { worker_pool_size, default_max_retries },
            retry: RetrySettings { base_delay_ms, max_delay_ms },
            http: HttpSettings { request_timeout_secs, connect_timeout_secs },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled, prometheus_port },
            backends,
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub(crate) fn engine(&self) -> &EngineSettings {
        &self.engine
    }

    pub(crate) fn retry(&self) -> &RetrySettings {
        &self.retry
    }

    pub(crate) fn http(&self) -> &HttpSettings {
        &self.http
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn backends(&self) -> &[BackendSettings] {
        &self.backends
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADEFLOW_WORKER_POOL_SIZE".to_string(),
                value: "0".to_string(),
            });
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "GRADEFLOW_RETRY_MAX_DELAY_MS".to_string(),
                value: self.retry.max_delay_ms.to_string(),
            });
        }

        for backend in &self.backends {
            let fragment = backend_env_fragment(&backend.id);

            if backend.capacity == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("GRADEFLOW_BACKEND_{fragment}_CAPACITY"),
                    value: "0".to_string(),
                });
            }

            if !(0.0..=2.0).contains(&backend.temperature) {
                return Err(ConfigError::InvalidValue {
                    field: format!("GRADEFLOW_BACKEND_{fragment}_TEMPERATURE"),
                    value: backend.temperature.to_string(),
                });
            }

            if backend.kind == BackendKind::Openai && backend.base_url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("GRADEFLOW_BACKEND_{fragment}_BASE_URL"),
                    value: "<empty>".to_string(),
                });
            }
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        for backend in &self.backends {
            if backend.kind == BackendKind::Openai && backend.api_key.is_empty() {
                let fragment = backend_env_fragment(&backend.id);
                return Err(ConfigError::MissingSecret(format!(
                    "GRADEFLOW_BACKEND_{fragment}_API_KEY"
                )));
            }
        }

        Ok(())
    }
}

fn load_backend(id: &str) -> Result<BackendSettings, ConfigError> {
    let fragment = backend_env_fragment(id);
    let key = |suffix: &str| format!("GRADEFLOW_BACKEND_{fragment}_{suffix}");

    let kind = parse_backend_kind(&key("KIND"), env_or_default(&key("KIND"), "openai"))?;
    let base_url =
        env_or_default(&key("BASE_URL"), "https://api.openai.com/v1").trim_end_matches('/').to_string();
    let api_key = env_or_default(&key("API_KEY"), "");
    let model = env_or_default(&key("MODEL"), "gpt-4o");

    let capacity = match env_optional(key("CAPACITY").as_str()) {
        Some(value) => Some(parse_usize(&key("CAPACITY"), value)?),
        None => match kind {
            BackendKind::Openai => Some(PROPRIETARY_DEFAULT_CAPACITY),
            BackendKind::Local => None,
        },
    };

    let min_interval_ms = match env_optional(key("MIN_INTERVAL_MS").as_str()) {
        Some(value) => Some(parse_u64(&key("MIN_INTERVAL_MS"), value)?),
        None => None,
    };

    let max_tokens = parse_u32(&key("MAX_TOKENS"), env_or_default(&key("MAX_TOKENS"), "4000"))?;
    let temperature = parse_f64(&key("TEMPERATURE"), env_or_default(&key("TEMPERATURE"), "0.0"))?;

    Ok(BackendSettings {
        id: id.to_string(),
        kind,
        base_url,
        api_key,
        model,
        capacity,
        min_interval_ms,
        max_tokens,
        temperature,
    })
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism().map(|value| value.get() * 2).unwrap_or(8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_lock;

    fn clear_gradeflow_env() {
        let keys: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with("GRADEFLOW_") || key.starts_with("PROMETHEUS_"))
            .collect();
        for key in keys {
            std::env::remove_var(key);
        }
    }

    #[tokio::test]
    async fn load_parses_backend_block() {
        let _guard = env_lock().await;
        clear_gradeflow_env();

        std::env::set_var("GRADEFLOW_BACKENDS", "openai-main, llama-lab");
        std::env::set_var("GRADEFLOW_BACKEND_OPENAI_MAIN_KIND", "openai");
        std::env::set_var("GRADEFLOW_BACKEND_OPENAI_MAIN_MODEL", "gpt-4o-mini");
        std::env::set_var("GRADEFLOW_BACKEND_LLAMA_LAB_KIND", "local");
        std::env::set_var("GRADEFLOW_BACKEND_LLAMA_LAB_BASE_URL", "http://localhost:11434/v1/");
        std::env::set_var("GRADEFLOW_BACKEND_LLAMA_LAB_MIN_INTERVAL_MS", "250");

        let settings = Settings::load().expect("settings");
        let backends = settings.backends();
        assert_eq!(backends.len(), 2);

        assert_eq!(backends[0].id, "openai-main");
        assert_eq!(backends[0].kind, BackendKind::Openai);
        assert_eq!(backends[0].model, "gpt-4o-mini");
        assert_eq!(backends[0].capacity, Some(4));

        assert_eq!(backends[1].id, "llama-lab");
        assert_eq!(backends[1].kind, BackendKind::Local);
        assert_eq!(backends[1].base_url, "http://localhost:11434/v1");
        assert_eq!(backends[1].capacity, None);
        assert_eq!(backends[1].min_interval_ms, Some(250));

        clear_gradeflow_env();
    }

    #[tokio::test]
    async fn strict_mode_requires_api_key() {
        let _guard = env_lock().await;
        clear_gradeflow_env();

        std::env::set_var("GRADEFLOW_STRICT_CONFIG", "1");
        std::env::set_var("GRADEFLOW_BACKENDS", "openai-main");

        let err = Settings::load().expect_err("strict mode should reject empty api key");
        assert!(matches!(err, ConfigError::MissingSecret(_)));

        clear_gradeflow_env();
    }

    #[tokio::test]
    async fn zero_capacity_rejected() {
        let _guard = env_lock().await;
        clear_gradeflow_env();

        std::env::set_var("GRADEFLOW_BACKENDS", "openai-main");
        std::env::set_var("GRADEFLOW_BACKEND_OPENAI_MAIN_CAPACITY", "0");

        let err = Settings::load().expect_err("zero capacity is invalid");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        clear_gradeflow_env();
    }
}
