//! # upgw-sync: Session and State-Synchronization Engine
//!
//! Keeps an in-memory mirror of every thermostat's cloud shadow and turns
//! caller commands into correlated shadow requests.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Client Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncClient (Orchestrator)                     │  │
//! │  │                                                                  │  │
//! │  │  Processing loop: decode → apply → resolve → notify              │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │CredentialStore │  │TransportSession│  │  DeviceRegistry        │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Cached tokens  │  │ MQTT with      │  │ Gateways and devices   │    │
//! │  │ Single-flight  │  │ auto-reconnect │  │ by id, attribute bags  │    │
//! │  │ refresh        │  │ & resubscribe  │  │ with change sets       │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │          ▼                   ▼                                          │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │IdentityProvider│  │BrokerConnector │  │  DeviceDirectory       │    │
//! │  │ (Cognito)      │  │ (rumqttc)      │  │  (service API)         │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  Long-latency identity and handshake calls run on the WorkerPool.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Orchestration
//! - [`client`] - `SyncClient` and per-device handles
//! - [`pending`] - Correlation of shadow requests with acknowledgements
//! - [`registry`] - In-memory gateways and devices
//! - [`listeners`] - Per-device change callbacks
//!
//! ### Boundaries
//! - [`identity`] - Identity provider trait and Cognito implementation
//! - [`credentials`] - Credential cache with refresh
//! - [`broker`] - Broker trait and MQTT implementation
//! - [`session`] - Reconnecting broker session
//! - [`directory`] - Device inventory from the service API
//!
//! ### Support
//! - [`config`] - Client configuration (TOML + environment)
//! - [`error`] - Sync error types
//! - [`worker`] - Bounded pool for long-latency calls
//!
//! ## Usage
//!
//! ```rust,ignore
//! use upgw_sync::{ClientConfig, ClientDeps, SyncClient};
//!
//! let config = ClientConfig::load_or_default(None);
//! let deps = ClientDeps::from_config(&config)?;
//! let client = SyncClient::start(config, deps, "me@example.com", "secret").await?;
//!
//! client.populate_devices().await?;
//! client.refresh_all_devices().await?;
//!
//! let thermostat = client.device(&"T1".into())?;
//! thermostat.subscribe(|device: &upgw_core::DeviceSnapshot, changed: &upgw_core::ChangeSet| {
//!     println!("{} changed: {:?}", device.name(), changed);
//! });
//! thermostat.update_target_temperature(20.5).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Orchestration
pub mod client;
pub mod listeners;
pub mod pending;
pub mod registry;

// Boundaries
pub mod broker;
pub mod credentials;
pub mod directory;
pub mod identity;
pub mod session;

// Support
pub mod config;
pub mod error;
pub mod worker;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use broker::{BrokerClient, BrokerConnector, BrokerEvent, BrokerLink, MqttConnector, TransportError};
pub use client::{Acknowledgement, ClientDeps, DeviceHandle, SyncClient};
pub use config::{AuthSettings, BrokerSettings, ClientConfig, ServiceSettings, SyncSettings};
pub use credentials::CredentialStore;
pub use directory::{DeviceDirectory, ServiceApiDirectory};
pub use error::{SyncError, SyncResult};
pub use identity::{CognitoIdentityProvider, Credentials, IdentityError, IdentityProvider};
pub use listeners::{DeviceListener, SubscriptionId};
pub use session::{SessionEvent, SessionState};
pub use worker::WorkerPool;
