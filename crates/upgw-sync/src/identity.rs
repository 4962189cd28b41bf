//! # Identity Provider
//!
//! The seam to the cloud user directory, plus the Cognito implementation
//! used in production.
//!
//! ## Authentication Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cognito InitiateAuth                             │
//! │                                                                         │
//! │  ┌────────────────┐                           ┌─────────────────┐      │
//! │  │ CredentialStore│                           │ cognito-idp     │      │
//! │  └───────┬────────┘                           └────────┬────────┘      │
//! │          │  1. USER_PASSWORD_AUTH (user, pass)          │               │
//! │          │─────────────────────────────────────────────►│               │
//! │          │  2. AccessToken + IdToken + RefreshToken     │               │
//! │          │◄─────────────────────────────────────────────│               │
//! │          │                                              │               │
//! │          │  [Later: token near expiry]                  │               │
//! │          │                                              │               │
//! │          │  3. REFRESH_TOKEN_AUTH (refresh token)       │               │
//! │          │─────────────────────────────────────────────►│               │
//! │          │  4. AccessToken + IdToken (same refresh)     │               │
//! │          │◄─────────────────────────────────────────────│               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every failure is classified as either [`IdentityError::InvalidCredentials`]
//! (the user has to act) or [`IdentityError::ServiceUnavailable`] (try again
//! later). The store never treats the second kind as a rejection.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::AuthSettings;

// =============================================================================
// Credentials
// =============================================================================

/// Tokens issued by the identity provider.
///
/// Replaced wholesale on every refresh; never mutated in place.
#[derive(Clone)]
pub struct Credentials {
    /// Presented to the broker.
    pub access_token: String,
    /// Presented to the service API as `x-auth-token`.
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: Instant,
}

impl Credentials {
    pub fn new(
        access_token: impl Into<String>,
        id_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: Duration,
    ) -> Self {
        Credentials {
            access_token: access_token.into(),
            id_token: id_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: Instant::now() + expires_in,
        }
    }

    /// True once `margin` or less of the lifetime remains.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        Instant::now() + margin >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_secs(&self) -> u64 {
        self.expires_at
            .checked_duration_since(Instant::now())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("remaining_secs", &self.remaining_secs())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Classified identity provider failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("identity service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Issues and refreshes credentials.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str)
        -> Result<Credentials, IdentityError>;

    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, IdentityError>;
}

// =============================================================================
// Cognito Implementation
// =============================================================================

const INITIATE_AUTH_TARGET: &str = "AWSCognitoIdentityProviderService.InitiateAuth";
const AMZ_JSON: &str = "application/x-amz-json-1.1";

/// Cognito user pool client speaking the `InitiateAuth` JSON protocol.
pub struct CognitoIdentityProvider {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
}

#[derive(Deserialize)]
struct InitiateAuthResponse {
    #[serde(rename = "AuthenticationResult")]
    result: Option<AuthenticationResult>,
    #[serde(rename = "ChallengeName")]
    challenge: Option<String>,
}

#[derive(Deserialize)]
struct AuthenticationResult {
    #[serde(rename = "AccessToken")]
    access_token: String,
    #[serde(rename = "IdToken")]
    id_token: String,
    #[serde(rename = "RefreshToken")]
    refresh_token: Option<String>,
    #[serde(rename = "ExpiresIn")]
    expires_in: u64,
}

#[derive(Deserialize)]
struct ServiceErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default, alias = "Message")]
    message: String,
}

impl CognitoIdentityProvider {
    pub fn new(settings: &AuthSettings, timeout: Duration) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::ServiceUnavailable(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: settings.endpoint_url(),
            client_id: settings.client_id.clone(),
        })
    }

    async fn initiate_auth(
        &self,
        flow: &str,
        parameters: serde_json::Value,
    ) -> Result<AuthenticationResult, IdentityError> {
        debug!(flow, "Calling identity provider");

        let body = json!({
            "AuthFlow": flow,
            "ClientId": self.client_id,
            "AuthParameters": parameters,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Amz-Target", INITIATE_AUTH_TARGET)
            .header(reqwest::header::CONTENT_TYPE, AMZ_JSON)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| IdentityError::ServiceUnavailable(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| IdentityError::ServiceUnavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_failure(status, &bytes));
        }

        let parsed: InitiateAuthResponse = serde_json::from_slice(&bytes)
            .map_err(|e| IdentityError::ServiceUnavailable(format!("malformed response: {e}")))?;

        match (parsed.result, parsed.challenge) {
            (Some(result), _) => Ok(result),
            (None, Some(challenge)) => Err(IdentityError::InvalidCredentials(format!(
                "unsupported challenge {challenge}"
            ))),
            (None, None) => Err(IdentityError::ServiceUnavailable(
                "response carried no authentication result".into(),
            )),
        }
    }
}

/// Maps a non-2xx response to an [`IdentityError`].
fn classify_failure(status: reqwest::StatusCode, body: &[u8]) -> IdentityError {
    let parsed: Option<ServiceErrorBody> = serde_json::from_slice(body).ok();
    let (kind, message) = parsed
        .map(|b| (b.kind, b.message))
        .unwrap_or_else(|| (String::new(), status.to_string()));

    // __type may be namespaced: "com.amazonaws...#NotAuthorizedException"
    let short_kind = kind.rsplit('#').next().unwrap_or_default();
    match short_kind {
        "NotAuthorizedException"
        | "UserNotFoundException"
        | "UserNotConfirmedException"
        | "PasswordResetRequiredException" => IdentityError::InvalidCredentials(message),
        _ if status.is_client_error() && !kind.is_empty() && status != 429 => {
            IdentityError::InvalidCredentials(format!("{short_kind}: {message}"))
        }
        _ => IdentityError::ServiceUnavailable(format!("{status}: {message}")),
    }
}

#[async_trait]
impl IdentityProvider for CognitoIdentityProvider {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Credentials, IdentityError> {
        let result = self
            .initiate_auth(
                "USER_PASSWORD_AUTH",
                json!({ "USERNAME": username, "PASSWORD": password }),
            )
            .await?;

        let refresh_token = result.refresh_token.ok_or_else(|| {
            IdentityError::ServiceUnavailable("authentication returned no refresh token".into())
        })?;

        Ok(Credentials::new(
            result.access_token,
            result.id_token,
            refresh_token,
            Duration::from_secs(result.expires_in),
        ))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, IdentityError> {
        let result = self
            .initiate_auth(
                "REFRESH_TOKEN_AUTH",
                json!({ "REFRESH_TOKEN": refresh_token }),
            )
            .await?;

        // Cognito only rotates the refresh token when rotation is enabled.
        Ok(Credentials::new(
            result.access_token,
            result.id_token,
            result
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            Duration::from_secs(result.expires_in),
        ))
    }
}
