use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::core::config::{BackendSettings, HttpSettings};
use crate::model::records::TokenUsage;
use crate::model::types::ErrorClass;
use crate::providers::{GradeCall, GradeReply, ProviderGateway};

const GRADING_SYSTEM_PROMPT: &str = "You are an experienced grader. \
Assess the submitted document against the marking prompt you are given and \
respond with strict JSON: {\"score\": <number>, \"max_score\": <number>, \
\"criteria\": [{\"name\": \"...\", \"score\": <number>, \"comment\": \"...\"}], \
\"feedback\": \"overall feedback for the author\"}. \
Do not wrap the JSON in markdown fences.";

/// OpenAI-compatible chat-completions gateway. Covers both proprietary
/// endpoints and self-hosted servers exposing the same wire format.
#[derive(Debug, Clone)]
pub(crate) struct OpenAiGateway {
    client: Client,
    backend_id: String,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiGateway {
    pub(crate) fn from_settings(
        backend: &BackendSettings,
        http: &HttpSettings,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .timeout(Duration::from_secs(http.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            backend_id: backend.id.clone(),
            api_key: backend.api_key.clone(),
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            model: backend.model.clone(),
            max_tokens: backend.max_tokens,
            temperature: backend.temperature,
        })
    }

    fn classify_status(status: StatusCode, body: &Value) -> (ErrorClass, String) {
        let detail = body
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let message = if detail.is_empty() {
            format!("backend returned {status}")
        } else {
            format!("backend returned {status}: {detail}")
        };

        let class = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorClass::Authentication,
            StatusCode::TOO_MANY_REQUESTS => ErrorClass::RateLimited,
            StatusCode::BAD_REQUEST
            | StatusCode::NOT_FOUND
            | StatusCode::UNPROCESSABLE_ENTITY => ErrorClass::InvalidInput,
            StatusCode::REQUEST_TIMEOUT => ErrorClass::Transient,
            status if status.is_server_error() => ErrorClass::Transient,
            _ => ErrorClass::Unknown,
        };

        (class, message)
    }

    fn classify_transport(err: &reqwest::Error) -> (ErrorClass, String) {
        if err.is_timeout() || err.is_connect() {
            (ErrorClass::Transient, format!("transport error: {err}"))
        } else {
            (ErrorClass::Unknown, format!("request error: {err}"))
        }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    let field = |name: &str| usage.get(name).and_then(Value::as_u64);
    Some(TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    })
}

#[async_trait]
impl ProviderGateway for OpenAiGateway {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn grade(&self, call: GradeCall) -> GradeReply {
        if call.text.trim().is_empty() {
            return GradeReply::failure(ErrorClass::InvalidInput, "extracted text is empty");
        }

        let model = call.params.model.clone().unwrap_or_else(|| self.model.clone());
        let max_tokens = call.params.max_tokens.unwrap_or(self.max_tokens);
        let temperature = call.params.temperature.unwrap_or(self.temperature);

        let user_prompt = format!("{}\n\nDocument to grade:\n{}", call.prompt, call.text);
        let payload = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": GRADING_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "max_completion_tokens": max_tokens,
            "temperature": temperature,
            "response_format": {"type": "json_object"}
        });

        tracing::info!(
            backend = %self.backend_id,
            submission_id = %call.submission_id,
            attempt = call.attempt,
            model = %model,
            "Sending grading request"
        );

        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&payload);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let (class, message) = Self::classify_transport(&err);
                return GradeReply::Failure { class, message, retry_after: None };
            }
        };

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let (class, message) = Self::classify_status(status, &body);
            return GradeReply::Failure { class, message, retry_after };
        }

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str);
        let Some(content) = content else {
            return GradeReply::failure(ErrorClass::Unknown, "missing response content");
        };

        let grade: Value = match serde_json::from_str(content) {
            Ok(value) => value,
            Err(err) => {
                return GradeReply::failure(
                    ErrorClass::Unknown,
                    format!("unparseable grade payload: {err}"),
                );
            }
        };

        let usage = parse_usage(&body);

        tracing::info!(
            backend = %self.backend_id,
            submission_id = %call.submission_id,
            attempt = call.attempt,
            tokens_used = usage.as_ref().and_then(|usage| usage.total_tokens),
            "Grading request completed"
        );

        GradeReply::Success { grade, usage, model }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_taxonomy() {
        let body = Value::Null;
        let class = |status: StatusCode| OpenAiGateway::classify_status(status, &body).0;

        assert_eq!(class(StatusCode::UNAUTHORIZED), ErrorClass::Authentication);
        assert_eq!(class(StatusCode::FORBIDDEN), ErrorClass::Authentication);
        assert_eq!(class(StatusCode::TOO_MANY_REQUESTS), ErrorClass::RateLimited);
        assert_eq!(class(StatusCode::BAD_REQUEST), ErrorClass::InvalidInput);
        assert_eq!(class(StatusCode::UNPROCESSABLE_ENTITY), ErrorClass::InvalidInput);
        assert_eq!(class(StatusCode::INTERNAL_SERVER_ERROR), ErrorClass::Transient);
        assert_eq!(class(StatusCode::BAD_GATEWAY), ErrorClass::Transient);
        assert_eq!(class(StatusCode::REQUEST_TIMEOUT), ErrorClass::Transient);
        assert_eq!(class(StatusCode::IM_A_TEAPOT), ErrorClass::Unknown);
    }

    #[test]
    fn error_message_includes_backend_detail() {
        let body = json!({"error": {"message": "model overloaded"}});
        let (class, message) =
            OpenAiGateway::classify_status(StatusCode::SERVICE_UNAVAILABLE, &body);
        assert_eq!(class, ErrorClass::Transient);
        assert!(message.contains("model overloaded"));
    }

    #[test]
    fn usage_parsed_from_body() {
        let body = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}});
        let usage = parse_usage(&body).expect("usage");
        assert_eq!(usage.total_tokens, Some(15));
        assert_eq!(usage.prompt_tokens, Some(10));
    }
}
