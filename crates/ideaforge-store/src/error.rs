//! Error types for row-store access.

use thiserror::Error;

/// Errors that can occur when talking to the row store.
///
/// Cloneable so that every caller coalesced onto one in-flight read can
/// observe the same failure.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The executor gave up waiting for the call.
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// The request was cancelled or aborted before a response arrived.
    #[error("request aborted: {0}")]
    Aborted(String),

    /// Transport-level failure (connection refused, reset, DNS).
    #[error("transport error: {0}")]
    Transport(String),

    /// Rejection reported by the store itself.
    #[error("remote error ({status}){}: {message}", code.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
    Remote {
        status: u16,
        code: Option<String>,
        message: String,
        details: Option<String>,
        hint: Option<String>,
    },

    /// A unique or foreign-key constraint rejected the write.
    #[error("conflict{}: {message}", code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Conflict {
        code: Option<String>,
        message: String,
    },

    /// Rate limited by the store.
    #[error("rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// The addressed row does not exist.
    #[error("row not found: {table}/{id}")]
    NotFound { table: String, id: String },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(String),

    /// Response did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Whether this failure came from a timeout or cancellation rather than a
    /// substantive rejection. Only these are retried.
    pub fn is_abort_like(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. } | StoreError::Aborted(_) | StoreError::Transport(_)
        )
    }

    /// Machine-readable error code, when the store supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Remote { code, .. } | StoreError::Conflict { code, .. } => code.as_deref(),
            StoreError::Timeout { .. } => Some("timeout"),
            StoreError::Aborted(_) => Some("aborted"),
            StoreError::RateLimited { .. } => Some("rate_limited"),
            StoreError::NotFound { .. } => Some("not_found"),
            _ => None,
        }
    }

    /// Extra diagnostic detail reported by the store.
    pub fn details(&self) -> Option<&str> {
        match self {
            StoreError::Remote { details, .. } => details.as_deref(),
            _ => None,
        }
    }

    /// Remediation hint reported by the store.
    pub fn hint(&self) -> Option<&str> {
        match self {
            StoreError::Remote { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Aborted(format!("transport timeout: {err}"))
        } else if err.is_decode() {
            StoreError::InvalidResponse(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            StoreError::Transport(err.to_string())
        } else {
            StoreError::InvalidResponse(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Json(err.to_string())
    }
}
