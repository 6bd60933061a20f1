//! Completion service trait

use async_trait::async_trait;
use std::time::Duration;

/// Result type for completion calls
pub type CompletionResult<T> = Result<T, CompletionError>;

/// Completion error types. All of these are recoverable for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl CompletionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CompletionError::Timeout(_))
    }

    /// Short tag for receipts and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionError::Timeout(_) => "timeout",
            CompletionError::RequestFailed(_) => "request_failed",
            CompletionError::AuthFailed(_) => "auth_failed",
            CompletionError::RateLimited { .. } => "rate_limited",
            CompletionError::StreamError(_) => "stream_error",
            CompletionError::Unavailable(_) => "unavailable",
            CompletionError::NetworkError(_) => "network",
        }
    }
}

/// Opaque text-completion service. Possibly slow, possibly failing.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    /// One prompt in, one text out, within `timeout`.
    async fn complete(&self, prompt: &str, timeout: Duration) -> CompletionResult<String>;
}
