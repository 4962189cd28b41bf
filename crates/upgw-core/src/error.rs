//! # Error Types
//!
//! Domain-specific error types for upgw-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  upgw-core errors (this file)                                          │
//! │  ├── ValidationError  - Caller-supplied value outside allowed domain   │
//! │  └── DecodeError      - Malformed topic or shadow payload              │
//! │                                                                         │
//! │  upgw-sync errors (separate crate)                                     │
//! │  └── SyncError        - What callers of SyncClient see                 │
//! │                                                                         │
//! │  Flow: ValidationError → SyncError::Validation → caller                │
//! │        DecodeError     → logged and dropped by the processing loop     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::Attribute;

// =============================================================================
// Validation Error
// =============================================================================

/// Attribute update validation errors.
///
/// Raised before any network call is made, so a failing update never reaches
/// the broker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// The attribute is reported by the device and cannot be written.
    #[error("{attribute} is read-only")]
    NotWritable { attribute: Attribute },

    /// The value variant does not match the attribute.
    #[error("{attribute} expects a {expected} value")]
    TypeMismatch {
        attribute: Attribute,
        expected: &'static str,
    },

    /// NaN or infinite number.
    #[error("{attribute} must be a finite number")]
    NotFinite { attribute: Attribute },

    /// Numeric value is out of range.
    #[error("{attribute} must be between {min} and {max}, got {value}")]
    OutOfRange {
        attribute: Attribute,
        min: f64,
        max: f64,
        value: f64,
    },
}

// =============================================================================
// Decode Error
// =============================================================================

/// Errors decoding inbound topics and shadow documents.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Topic is not a shadow response topic.
    #[error("unrecognized topic: {0}")]
    UnrecognizedTopic(String),

    /// Payload is not valid JSON or has the wrong shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Required field is missing from a service API response.
    #[error("missing field: {0}")]
    MissingField(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::InvalidPayload(err.to_string())
    }
}

/// Convenience type alias for decode results.
pub type DecodeResult<T> = Result<T, DecodeError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::OutOfRange {
            attribute: Attribute::TargetTemperature,
            min: 5.0,
            max: 30.0,
            value: 42.0,
        };
        assert_eq!(
            err.to_string(),
            "target_temperature must be between 5 and 30, got 42"
        );

        let err = ValidationError::NotWritable {
            attribute: Attribute::CurrentTemperature,
        };
        assert_eq!(err.to_string(), "current_temperature is read-only");
    }

    #[test]
    fn test_json_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: DecodeError = json_err.into();
        assert!(matches!(err, DecodeError::InvalidPayload(_)));
    }
}
