//! # Device Directory
//!
//! Fetches the gateway and device inventory from the vendor service API so
//! the registry can be populated before any shadow traffic.
//!
//! ```text
//!   GET {base}/occupants/slider_list
//!        │  one entry per gateway the account can see
//!        ▼
//!   GET {base}/occupants/slider_details?id=<gateway id>&type=gateway   (concurrently)
//!        │  nested rooms / devices
//!        ▼
//!   Vec<(GatewayInfo, Vec<DeviceInfo>)>
//! ```

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use upgw_core::catalog::{parse_slider_details, parse_slider_list, GATEWAY_SLIDER_TYPE};
use upgw_core::{DecodeError, DeviceInfo, GatewayInfo};

use crate::config::ServiceSettings;
use crate::error::{SyncError, SyncResult};
use crate::identity::Credentials;

/// Source of the gateway/device inventory.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_gateways(
        &self,
        credentials: &Credentials,
    ) -> SyncResult<Vec<(GatewayInfo, Vec<DeviceInfo>)>>;
}

/// [`DeviceDirectory`] backed by the vendor service API.
pub struct ServiceApiDirectory {
    http: reqwest::Client,
    base_url: String,
    company: String,
}

impl ServiceApiDirectory {
    pub fn new(settings: &ServiceSettings, timeout: Duration) -> SyncResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            company: settings.company.clone(),
        })
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        credentials: &Credentials,
    ) -> SyncResult<Value> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "Service API request");

        let response = self
            .http
            .get(&url)
            .query(query)
            .header("x-auth-token", &credentials.id_token)
            .header("x-access-token", &credentials.access_token)
            .header("x-company-code", &self.company)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Authentication(format!(
                "service API refused {path}: {status}"
            )));
        }

        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl DeviceDirectory for ServiceApiDirectory {
    async fn list_gateways(
        &self,
        credentials: &Credentials,
    ) -> SyncResult<Vec<(GatewayInfo, Vec<DeviceInfo>)>> {
        let listing = self.get("occupants/slider_list", &[], credentials).await?;
        let gateways = parse_slider_list(&listing)?;

        let details = gateways.into_iter().map(|gateway| async move {
            let slider_id = gateway
                .service_id
                .map(|id| id.to_string())
                .ok_or_else(|| DecodeError::MissingField(format!("{}.id", gateway.id)))?;
            let body = self
                .get(
                    "occupants/slider_details",
                    &[("id", slider_id.as_str()), ("type", GATEWAY_SLIDER_TYPE)],
                    credentials,
                )
                .await?;
            let devices = parse_slider_details(&body)?;
            Ok::<_, SyncError>((gateway, devices))
        });

        let inventory = try_join_all(details).await?;
        info!(
            gateways = inventory.len(),
            devices = inventory.iter().map(|(_, d)| d.len()).sum::<usize>(),
            "Fetched device inventory"
        );
        Ok(inventory)
    }
}
