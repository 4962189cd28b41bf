//! # Sync Error Types
//!
//! Error types for the client session.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Session       │  │     Requests            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Authentication │  │  Validation             │ │
//! │  │  ConfigLoad     │  │  IdentityUnavail│  │  Timeout / Superseded   │ │
//! │  │  ConfigSave     │  │  Connection     │  │  Rejected / UnknownDev  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Internal: ClientClosed • Client (with source)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;
use thiserror::Error;

use upgw_core::{DecodeError, DeviceId, ValidationError};

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Boxed error used as the source of [`SyncError::Client`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type covering every failure a [`crate::SyncClient`] caller can see.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Credentials were rejected and could not be recovered.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Identity provider could not be reached or returned a server error.
    #[error("Identity provider unavailable: {0}")]
    IdentityUnavailable(String),

    /// Broker connection could not be established.
    #[error("Connection failed: {0}")]
    Connection(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Caller-supplied value failed validation. Nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No acknowledgement before the deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// A newer request for the same device and command replaced this one.
    #[error("Request {key} was superseded by a newer request")]
    Superseded { key: String },

    /// The shadow service answered on a rejected topic.
    #[error("Request rejected: {message} ({code})")]
    Rejected { code: i64, message: String },

    /// The device id is not in the registry.
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The client was closed while the operation was outstanding.
    #[error("Client is closed")]
    ClientClosed,

    /// Anything else, with the underlying cause attached.
    #[error("{context}")]
    Client {
        context: String,
        #[source]
        source: BoxError,
    },
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Client {
            context: "Malformed JSON".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::Client {
            context: "Malformed response".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Client {
            context: "Service API request failed".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl SyncError {
    /// Wraps an arbitrary error with a short description of what failed.
    pub fn client(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SyncError::Client {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        SyncError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the caller may retry the same operation unchanged.
    ///
    /// ## Retryable Errors
    /// - Timeouts and supersession
    /// - Identity provider or broker unreachable
    ///
    /// ## Non-Retryable Errors
    /// - Authentication, validation and configuration errors
    /// - Server rejections
    /// - Client closed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout { .. }
                | SyncError::Superseded { .. }
                | SyncError::IdentityUnavailable(_)
                | SyncError::Connection(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the session needs a fresh `authenticate` to continue.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Authentication(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upgw_core::Attribute;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::timeout("refresh T1", Duration::from_secs(10)).is_retryable());
        assert!(SyncError::Superseded { key: "T1/update".into() }.is_retryable());
        assert!(SyncError::IdentityUnavailable("503".into()).is_retryable());

        assert!(!SyncError::Authentication("bad password".into()).is_retryable());
        assert!(!SyncError::ClientClosed.is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
    }

    #[test]
    fn test_validation_is_transparent() {
        let err: SyncError = ValidationError::NotFinite {
            attribute: Attribute::TargetTemperature,
        }
        .into();
        assert_eq!(err.to_string(), "target_temperature must be a finite number");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_client_error_keeps_source() {
        use std::error::Error as _;

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SyncError = json_err.into();
        assert_eq!(err.to_string(), "Malformed JSON");
        assert!(err.source().is_some());
    }
}
