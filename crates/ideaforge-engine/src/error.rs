//! Error types for the engine.

use ideaforge_store::StoreError;
use thiserror::Error;

/// Errors from backend operations and the mutation coordinator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("insufficient influence: need {needed}, have {available}")]
    InsufficientInfluence { needed: i64, available: i64 },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for failures decided locally, before any durable write.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InsufficientInfluence { .. }
                | Self::Forbidden(_)
                | Self::Invalid(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_classification() {
        assert!(EngineError::not_found("idea", "i1").is_precondition());
        assert!(
            EngineError::InsufficientInfluence {
                needed: 1,
                available: 0
            }
            .is_precondition()
        );
        assert!(!EngineError::Store(StoreError::Aborted("signal".into())).is_precondition());
    }

    #[test]
    fn not_found_message_names_the_entity() {
        assert_eq!(
            EngineError::not_found("idea", "i9").to_string(),
            "idea not found: i9"
        );
    }
}
