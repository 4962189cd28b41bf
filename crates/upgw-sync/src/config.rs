//! # Client Configuration
//!
//! Endpoints, timeouts and tuning for a [`crate::SyncClient`].
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     UPGW_USERNAME=me@example.com                                       │
//! │     UPGW_AWS_IOT_ENDPOINT=xxxx-ats.iot.eu-central-1.amazonaws.com     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/upgw/upgw.toml (Linux)                                   │
//! │     ~/Library/Application Support/org.upgw.upgw/upgw.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Vendor production endpoints                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The password is never read from or written to the config file; it is
//! handed to [`crate::SyncClient::start`] directly.
//!
//! ## Configuration File Format
//! ```toml
//! # upgw.toml
//! [auth]
//! username = "me@example.com"
//! region = "eu-central-1"
//!
//! [broker]
//! endpoint = "a1b4blxx3o9kj3-ats.iot.eu-central-1.amazonaws.com"
//! keep_alive_secs = 30
//!
//! [sync]
//! publish_timeout_secs = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Auth Settings
// =============================================================================

/// Identity provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Account name. May also be passed to `start` directly.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// App client id registered with the user pool.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_user_pool_id")]
    pub user_pool_id: String,

    /// Overrides `https://cognito-idp.{region}.amazonaws.com/`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Credentials this close to expiry are refreshed before use.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

fn default_region() -> String {
    "eu-central-1".to_string()
}

fn default_client_id() -> String {
    "63qkc36u3eje4lp8ums9njmarv".to_string()
}

fn default_user_pool_id() -> String {
    "eu-central-1_HfciXliKM".to_string()
}

fn default_refresh_margin() -> u64 {
    300
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            username: None,
            region: default_region(),
            client_id: default_client_id(),
            user_pool_id: default_user_pool_id(),
            endpoint: None,
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

impl AuthSettings {
    /// Identity provider endpoint URL.
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://cognito-idp.{}.amazonaws.com/", self.region))
    }
}

// =============================================================================
// Broker Settings
// =============================================================================

/// Shadow broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// MQTT endpoint host name.
    #[serde(default = "default_iot_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix of the MQTT client id; a random suffix is appended per connection.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Time allowed for the broker handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnection delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnection delay cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_iot_endpoint() -> String {
    "a1b4blxx3o9kj3-ats.iot.eu-central-1.amazonaws.com".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_client_name() -> String {
    "upgw".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_initial_backoff() -> u64 {
    10_000
}

fn default_max_backoff() -> u64 {
    60
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            endpoint: default_iot_endpoint(),
            port: default_port(),
            client_name: default_client_name(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl BrokerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Service API Settings
// =============================================================================

/// Vendor service API used to list gateways and devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Sent as `x-company-code`.
    #[serde(default = "default_company")]
    pub company: String,
}

fn default_base_url() -> String {
    "https://service-api.purmo.uleeco.com/api/v1".to_string()
}

fn default_company() -> String {
    "purmo".to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            base_url: default_base_url(),
            company: default_company(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Request timing and concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Deadline for an update to be acknowledged.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,

    /// Deadline for every device to answer a refresh.
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    /// Concurrent identity/handshake calls.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_publish_timeout() -> u64 {
    60
}

fn default_refresh_timeout() -> u64 {
    60
}

fn default_max_workers() -> usize {
    4
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            publish_timeout_secs: default_publish_timeout(),
            refresh_timeout_secs: default_refresh_timeout(),
            max_workers: default_max_workers(),
        }
    }
}

impl SyncSettings {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

// =============================================================================
// Main Client Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub service: ServiceSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (upgw.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.broker.endpoint.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "broker.endpoint must not be empty".into(),
            ));
        }

        if !self.service.base_url.starts_with("https://")
            && !self.service.base_url.starts_with("http://")
        {
            return Err(SyncError::InvalidConfig(format!(
                "service.base_url must be an http(s) URL, got: {}",
                self.service.base_url
            )));
        }

        if self.sync.publish_timeout_secs == 0 || self.sync.refresh_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request timeouts must be greater than 0".into(),
            ));
        }

        if self.sync.max_workers == 0 {
            return Err(SyncError::InvalidConfig(
                "max_workers must be greater than 0".into(),
            ));
        }

        if self.broker.initial_backoff() > self.broker.max_backoff() {
            return Err(SyncError::InvalidConfig(
                "broker.initial_backoff_ms exceeds broker.max_backoff_secs".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var("UPGW_USERNAME") {
            debug!(username = %username, "Overriding username from environment");
            self.auth.username = Some(username);
        }

        if let Ok(region) = std::env::var("UPGW_AWS_REGION") {
            self.auth.region = region;
        }

        if let Ok(client_id) = std::env::var("UPGW_AWS_CLIENT_ID") {
            self.auth.client_id = client_id;
        }

        if let Ok(endpoint) = std::env::var("UPGW_AWS_IOT_ENDPOINT") {
            debug!(endpoint = %endpoint, "Overriding broker endpoint from environment");
            self.broker.endpoint = endpoint;
        }

        if let Ok(url) = std::env::var("UPGW_SERVICE_API_BASE_URL") {
            debug!(url = %url, "Overriding service API URL from environment");
            self.service.base_url = url;
        }

        if let Ok(company) = std::env::var("UPGW_SERVICE_API_COMPANY") {
            self.service.company = company;
        }

        if let Ok(timeout) = std::env::var("UPGW_PUBLISH_TIMEOUT_SECS") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.sync.publish_timeout_secs = secs,
                Err(_) => warn!(value = %timeout, "Ignoring non-numeric UPGW_PUBLISH_TIMEOUT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "upgw", "upgw")
            .map(|dirs| dirs.config_dir().join("upgw.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.sync.publish_timeout(), Duration::from_secs(60));
        assert_eq!(config.broker.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert_eq!(config.broker.initial_backoff(), Duration::from_secs(10));
        assert_eq!(config.broker.max_backoff(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [auth]
            username = "me@example.com"

            [sync]
            publish_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.username.as_deref(), Some("me@example.com"));
        assert_eq!(config.auth.region, "eu-central-1");
        assert_eq!(config.sync.publish_timeout_secs, 5);
        assert_eq!(config.sync.refresh_timeout_secs, 60);
        assert_eq!(config.service.company, "purmo");
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();

        config.sync.max_workers = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.sync.max_workers = 2;
        config.service.base_url = "ftp://nope".into();
        assert!(config.validate().is_err());

        config.service.base_url = "http://localhost:8080/api".into();
        config.broker.initial_backoff_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_applies_env_overrides() {
        let dir = std::env::temp_dir().join(format!("upgw-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("upgw.toml");
        ClientConfig::default().save(Some(path.clone())).unwrap();

        std::env::set_var("UPGW_SERVICE_API_COMPANY", "acme");
        let loaded = ClientConfig::load(Some(path));
        std::env::remove_var("UPGW_SERVICE_API_COMPANY");

        assert_eq!(loaded.unwrap().service.company, "acme");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_endpoint_url() {
        let mut auth = AuthSettings::default();
        assert_eq!(
            auth.endpoint_url(),
            "https://cognito-idp.eu-central-1.amazonaws.com/"
        );
        auth.endpoint = Some("http://127.0.0.1:9229/".into());
        assert_eq!(auth.endpoint_url(), "http://127.0.0.1:9229/");
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&ClientConfig::default()).unwrap();
        assert!(toml_str.contains("[auth]"));
        assert!(toml_str.contains("[broker]"));
        assert!(!toml_str.contains("password"));
    }
}
