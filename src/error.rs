//! Error types shared by the coordinator, the worker and the backends.
//!
//! `LlamaError` is a plain value (`Clone + Serialize`) so the worker can hand
//! it to the control side inside an `Error` response instead of unwinding
//! across the thread boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for worker operations.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum LlamaError {
    #[error("backend not initialized")]
    NotInitialized,

    #[error("no model loaded")]
    ModelNotLoaded,

    #[error("no context created")]
    ContextNotCreated,

    #[error("context overflow: {current} tokens exceed context window of {max}")]
    ContextOverflow { current: usize, max: usize },

    #[error("tokenization produced no tokens for {0:?}")]
    TokenizationFailure(String),

    #[error("invalid sampling parameter: {0}")]
    SamplingParameterInvalid(String),

    #[error("failed to load model {path}: {detail}")]
    ModelLoadFailure { path: String, detail: String },

    #[error("session error: {0}")]
    SessionFailure(String),

    #[error("embeddings error: {0}")]
    EmbeddingsFailure(String),

    #[error("decode failed: {0}")]
    DecodeFailure(String),

    #[error("worker has been disposed")]
    Disposed,

    #[error("worker already started")]
    AlreadyStarted,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("worker is not running")]
    WorkerUnavailable,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LlamaError>;

/// Build a `map_err` adapter that wraps a displayable error into a variant.
///
/// Usage: `.map_err(wrap(LlamaError::SessionFailure, "write metadata"))?`
pub fn wrap<E: std::fmt::Display>(
    variant: fn(String) -> LlamaError,
    context: &str,
) -> impl Fn(E) -> LlamaError + '_ {
    move |e| variant(format!("{context}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_message_names_both_sizes() {
        let err = LlamaError::ContextOverflow {
            current: 4096,
            max: 2048,
        };
        assert_eq!(
            err.to_string(),
            "context overflow: 4096 tokens exceed context window of 2048"
        );
    }

    #[test]
    fn test_wrap_prefixes_context() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = wrap(LlamaError::SessionFailure, "read metadata")(io);
        assert_eq!(err, LlamaError::SessionFailure("read metadata: gone".to_string()));
    }

    #[test]
    fn test_error_survives_json_transport() {
        let err = LlamaError::ModelLoadFailure {
            path: "/models/a.gguf".to_string(),
            detail: "bad magic".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"ModelLoadFailure\""));
        let back: LlamaError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
