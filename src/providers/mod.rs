pub(crate) mod openai;
pub(crate) mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::records::{ModelParams, TokenUsage};
use crate::model::types::ErrorClass;

#[derive(Debug, Clone)]
pub(crate) struct GradeCall {
    pub(crate) text: String,
    pub(crate) prompt: String,
    pub(crate) params: ModelParams,
    pub(crate) submission_id: String,
    pub(crate) attempt: u32,
}

#[derive(Debug, Clone)]
pub(crate) enum GradeReply {
    Success { grade: Value, usage: Option<TokenUsage>, model: String },
    Failure { class: ErrorClass, message: String, retry_after: Option<Duration> },
}

impl GradeReply {
    pub(crate) fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::Failure { class, message: message.into(), retry_after: None }
    }
}

/// Uniform capability over one AI backend. Implementations classify every
/// transport, authentication, and input failure into an [`ErrorClass`] before
/// returning; nothing raw escapes this boundary, and no retry happens here.
#[async_trait]
pub(crate) trait ProviderGateway: Send + Sync {
    fn backend_id(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn grade(&self, call: GradeCall) -> GradeReply;
}
