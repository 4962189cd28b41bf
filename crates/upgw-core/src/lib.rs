//! # upgw-core: Pure Device Model for the Unisenza Plus client
//!
//! This crate holds everything about gateways and thermostats that can be
//! expressed without touching the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          upgw Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  upgw-sync (SyncClient)                         │   │
//! │  │   credentials ──► MQTT session ──► registry ──► listeners       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ upgw-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  shadow   │  │  catalog  │  │ validation│  │   │
//! │  │   │ Attribute │  │  topics   │  │  service  │  │ setpoint  │  │   │
//! │  │   │   Bag     │  │  codec    │  │  listing  │  │  domain   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │        NO I/O • NO ASYNC • DETERMINISTIC FUNCTIONS              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Device identifiers, attributes and snapshots
//! - [`shadow`] - Shadow topics and JSON document encode/decode
//! - [`catalog`] - Parsing of the vendor service API device listings
//! - [`validation`] - Allowed domains for writable attributes
//! - [`error`] - Validation and decode errors
//!
//! ## Example Usage
//!
//! ```rust
//! use upgw_core::{Attribute, AttributeBag, AttributeMap, AttributeValue};
//!
//! let mut bag = AttributeBag::default();
//! let mut delta = AttributeMap::new();
//! delta.insert(Attribute::TargetTemperature, AttributeValue::Temperature(20.5));
//!
//! let changed = bag.merge(&delta);
//! assert!(changed.contains(&Attribute::TargetTemperature));
//!
//! // Same value again: nothing changes
//! assert!(bag.merge(&delta).is_empty());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod catalog;
pub mod error;
pub mod shadow;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{DecodeError, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Lowest setpoint accepted when the device has not reported its own minimum.
pub const DEFAULT_MIN_SETPOINT: f64 = 5.0;

/// Highest setpoint accepted when the device has not reported its own maximum.
pub const DEFAULT_MAX_SETPOINT: f64 = 30.0;
