//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering encoding and framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A line exceeds the maximum allowed size.
    #[error("line too large: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLarge {
        /// Actual line size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// An empty line was handed to the decoder.
    #[error("empty line")]
    EmptyLine,
}

/// Result type alias using ProtocolError.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_too_large_display() {
        let err = ProtocolError::LineTooLarge { size: 20, max: 10 };
        assert_eq!(
            err.to_string(),
            "line too large: 20 bytes exceeds maximum of 10 bytes"
        );
    }

    #[test]
    fn test_from_json_syntax_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
