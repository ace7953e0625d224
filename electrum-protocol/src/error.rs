//! Protocol error types.

use serde_json::Value;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in document")]
    InvalidUtf8,

    #[error("document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("unclassifiable message: {0}")]
    Unclassifiable(String),

    #[error("invalid response id: {0}")]
    InvalidId(Value),

    #[error("expected a batch response array, got {0}")]
    NotABatch(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::DocumentTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("50"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));

        let err = ProtocolError::InvalidId(serde_json::json!("abc"));
        assert!(err.to_string().contains("abc"));

        let err = ProtocolError::Unclassifiable("no id and no method".to_string());
        assert!(err.to_string().contains("no method"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<Value>("{not json").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
