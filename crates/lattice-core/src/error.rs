//! Error types for frame and record validation.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating frames and decoding records.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame field has an invalid format (e.g., malformed DID).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// A required frame field is absent.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A record payload does not satisfy its kind's structural rules.
    #[error("invalid {kind} record: {reason}")]
    InvalidRecord {
        /// Record kind name (e.g., "preprint").
        kind: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// An AT-URI could not be parsed.
    #[error("invalid AT-URI '{0}'")]
    InvalidAtUri(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "did",
            reason: "missing method".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("did"));
        assert!(msg.contains("missing method"));
    }

    #[test]
    fn test_invalid_record_display() {
        let err = Error::InvalidRecord {
            kind: "review",
            reason: "empty text".to_string(),
        };
        assert_eq!(err.to_string(), "invalid review record: empty text");
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
