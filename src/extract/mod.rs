use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ExtractError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),
    #[error("document contains no text")]
    Empty,
}

/// Text extraction collaborator. The engine only consumes the result: a
/// non-empty text is input-ready, an error or blank text follows the
/// invalid-input path and fails the submission without retries.
#[async_trait]
pub(crate) trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], format: &str) -> Result<String, ExtractError>;
}

/// Handles plain-text formats; anything richer belongs to an external
/// extraction service implementing the same trait.
pub(crate) struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8], format: &str) -> Result<String, ExtractError> {
        match format.to_ascii_lowercase().as_str() {
            "txt" | "text" | "md" | "markdown" => {
                let text = String::from_utf8_lossy(bytes).trim().to_string();
                if text.is_empty() {
                    return Err(ExtractError::Empty);
                }
                Ok(text)
            }
            other => Err(ExtractError::UnsupportedFormat(other.to_string())),
        }
    }
}
