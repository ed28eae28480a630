//! Engine Errors
//!
//! Error types for the conversation engine. The engine separates failures
//! by how far they are allowed to reach:
//!
//! - [`SendRejection`]: a `send` precondition failed; nothing was mutated and
//!   no request was made
//! - [`EngineError`]: a network, protocol or decoding failure inside a stream
//!   or an enrichment fetch
//!
//! Configuration errors live in [`crate::config::ConfigError`].

use thiserror::Error;

/// Why a `send` was refused before anything happened
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SendRejection {
    /// A response is already streaming for this session
    #[error("a response is already in progress")]
    AlreadyResponding,

    /// A required input variable has no value
    #[error("required input `{variable}` has no value")]
    MissingRequiredInput {
        /// Variable name from the input form
        variable: String,
    },

    /// An input value could not be coerced to its declared type
    #[error("input `{variable}` is not a valid {expected}")]
    InvalidInput {
        /// Variable name from the input form
        variable: String,
        /// Expected type description
        expected: &'static str,
    },
}

/// Failures while talking to the chat backend
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// A frame or response body could not be decoded
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// SSE framing failed mid-stream
    #[error("event stream error: {0}")]
    Stream(String),

    /// The server reported an error inside the stream
    #[error("server error{}: {message}", code_suffix(.code))]
    Server {
        /// Human-readable message
        message: String,
        /// Machine-readable error code, if any
        code: Option<String>,
    },

    /// The operation was cancelled before it finished
    #[error("operation cancelled")]
    Cancelled,
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl EngineError {
    /// Whether this error came from a user-initiated cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display() {
        assert_eq!(
            SendRejection::AlreadyResponding.to_string(),
            "a response is already in progress"
        );
        assert_eq!(
            SendRejection::MissingRequiredInput {
                variable: "city".to_string()
            }
            .to_string(),
            "required input `city` has no value"
        );
    }

    #[test]
    fn test_server_error_display() {
        let with_code = EngineError::Server {
            message: "quota exceeded".to_string(),
            code: Some("provider_quota_exceeded".to_string()),
        };
        assert_eq!(
            with_code.to_string(),
            "server error (provider_quota_exceeded): quota exceeded"
        );

        let without_code = EngineError::Server {
            message: "boom".to_string(),
            code: None,
        };
        assert_eq!(without_code.to_string(), "server error: boom");
        assert!(!without_code.is_cancelled());
        assert!(EngineError::Cancelled.is_cancelled());
    }
}
