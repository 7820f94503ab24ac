use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::retry::RetryPolicy;
use crate::engine::{EngineOptions, GradingEngine};
use crate::extract::PlainTextExtractor;
use crate::model::records::{JobConfig, ModelParams};
use crate::model::types::ErrorClass;
use crate::providers::registry::ProviderRegistry;
use crate::providers::{GradeCall, GradeReply, ProviderGateway};
use crate::store::MemoryStore;

/// Serializes tests that mutate process environment variables.
pub(crate) async fn env_lock() -> tokio::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(())).lock().await
}

#[derive(Debug, Clone)]
pub(crate) enum MockBehavior {
    Succeed,
    Fail { class: ErrorClass, retry_after: Option<Duration> },
    /// Fails the first `failures` calls per submission, then succeeds.
    FailThenSucceed { failures: u32, class: ErrorClass },
}

pub(crate) struct MockGateway {
    backend: String,
    behavior: Mutex<MockBehavior>,
    /// Calls observed per submission id, so per-submission failure scripts
    /// stay deterministic under concurrency.
    seen: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockGateway {
    pub(crate) fn new(backend: &str, behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            backend: backend.to_string(),
            behavior: Mutex::new(behavior),
            seen: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    pub(crate) fn with_delay(backend: &str, behavior: MockBehavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend: backend.to_string(),
            behavior: Mutex::new(behavior),
            seen: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }

    pub(crate) fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().expect("behavior lock poisoned") = behavior;
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderGateway for MockGateway {
    fn backend_id(&self) -> &str {
        &self.backend
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn grade(&self, call: GradeCall) -> GradeReply {
        if call.text.trim().is_empty() {
            return GradeReply::failure(ErrorClass::InvalidInput, "submission text is empty");
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = self.behavior.lock().expect("behavior lock poisoned").clone();
        let call_number = {
            let mut seen = self.seen.lock().expect("seen lock poisoned");
            let count = seen.entry(call.submission_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match behavior {
            MockBehavior::Succeed => success_reply(),
            MockBehavior::Fail { class, retry_after } => GradeReply::Failure {
                class,
                message: format!("scripted {} failure", class.as_str()),
                retry_after,
            },
            MockBehavior::FailThenSucceed { failures, class } => {
                if call_number <= failures {
                    GradeReply::failure(class, format!("scripted {} failure", class.as_str()))
                } else {
                    success_reply()
                }
            }
        }
    }
}

fn success_reply() -> GradeReply {
    GradeReply::Success {
        grade: json!({"total_score": 87, "feedback": "solid work"}),
        usage: None,
        model: "mock-model".to_string(),
    }
}

/// Engine wired with mock gateways, an in-memory store, and fast backoff.
pub(crate) fn build_engine(gateways: Vec<(Arc<MockGateway>, Option<usize>)>) -> GradingEngine {
    let mut registry = ProviderRegistry::empty();
    for (gateway, capacity) in gateways {
        registry.register(gateway, capacity, None);
    }

    GradingEngine::new(
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(PlainTextExtractor),
        EngineOptions {
            worker_pool_size: 8,
            retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            default_max_retries: 3,
        },
    )
}

pub(crate) fn job_config(backends: &[&str], max_retries: u32) -> JobConfig {
    JobConfig {
        prompt: "Grade this essay against the scheme.".to_string(),
        backends: backends.iter().map(|backend| backend.to_string()).collect(),
        params: ModelParams::default(),
        marking_scheme: json!({"criteria": [{"name": "argument", "max": 100}]}),
        max_retries,
    }
}

pub(crate) fn doc(text: &str) -> crate::engine::DocumentInput {
    crate::engine::DocumentInput { bytes: text.as_bytes().to_vec(), format: "txt".to_string() }
}
