//! # Validation Module
//!
//! Allowed domains for writable device attributes.
//!
//! Every attribute update passes through [`validate_update`] before a client
//! token is minted or anything is published, so a rejected value never costs
//! a network round trip.
//!
//! ## Usage
//! ```rust
//! use upgw_core::validation::validate_target_temperature;
//!
//! assert!(validate_target_temperature(21.5, 5.0, 30.0).is_ok());
//! assert!(validate_target_temperature(f64::NAN, 5.0, 30.0).is_err());
//! ```

use crate::error::ValidationError;
use crate::types::{Attribute, AttributeBag, AttributeValue};
use crate::{DEFAULT_MAX_SETPOINT, DEFAULT_MIN_SETPOINT};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a heating setpoint against an inclusive range.
///
/// ## Rules
/// - Must be finite (NaN and infinities are rejected)
/// - Must lie within `[min, max]`
pub fn validate_target_temperature(value: f64, min: f64, max: f64) -> ValidationResult<()> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite {
            attribute: Attribute::TargetTemperature,
        });
    }

    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            attribute: Attribute::TargetTemperature,
            min,
            max,
            value,
        });
    }

    Ok(())
}

/// Setpoint range for a device: its reported bounds, else the defaults.
pub fn setpoint_range(current: &AttributeBag) -> (f64, f64) {
    let min = current
        .min_temperature()
        .filter(|v| v.is_finite())
        .unwrap_or(DEFAULT_MIN_SETPOINT);
    let max = current
        .max_temperature()
        .filter(|v| v.is_finite())
        .unwrap_or(DEFAULT_MAX_SETPOINT);
    (min, max)
}

// =============================================================================
// Attribute Validators
// =============================================================================

/// Validates one proposed attribute value against the device's current state.
pub fn validate_update(
    attribute: Attribute,
    value: &AttributeValue,
    current: &AttributeBag,
) -> ValidationResult<()> {
    if !attribute.is_writable() {
        return Err(ValidationError::NotWritable { attribute });
    }

    match (attribute, value) {
        (Attribute::TargetTemperature, AttributeValue::Temperature(v)) => {
            let (min, max) = setpoint_range(current);
            validate_target_temperature(*v, min, max)
        }
        (Attribute::TargetTemperature, _) => Err(ValidationError::TypeMismatch {
            attribute,
            expected: "temperature",
        }),
        (Attribute::SystemMode, AttributeValue::Mode(_)) => Ok(()),
        (Attribute::SystemMode, _) => Err(ValidationError::TypeMismatch {
            attribute,
            expected: "system mode",
        }),
        _ => Err(ValidationError::NotWritable { attribute }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
