//! # Credential Store
//!
//! Caches the current [`Credentials`] for the life of the client and hands
//! out valid ones on demand.
//!
//! ## Refresh Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ensure_valid()                                 │
//! │                                                                         │
//! │  read lock ── fresh? ──yes──► return clone                              │
//! │      │                                                                  │
//! │      no                                                                 │
//! │      ▼                                                                  │
//! │  write lock ── fresh now? ──yes──► return clone (someone else refreshed)│
//! │      │                                                                  │
//! │      no                                                                 │
//! │      ▼                                                                  │
//! │  refresh(refresh_token) ──ok──► store + return                          │
//! │      │ InvalidCredentials            │ ServiceUnavailable               │
//! │      ▼                               ▼                                  │
//! │  authenticate(user, pass)       IdentityUnavailable (retryable)         │
//! │      │ InvalidCredentials                                               │
//! │      ▼                                                                  │
//! │  Authentication error, credentials dropped                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers that queue on the write lock while a refresh is running observe
//! its result instead of starting their own, so there is only ever one
//! provider call in flight.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::{Credentials, IdentityError, IdentityProvider};
use crate::worker::WorkerPool;

/// Username and password retained for re-authentication.
#[derive(Clone)]
struct Login {
    username: String,
    password: String,
}

#[derive(Default)]
struct StoreState {
    credentials: Option<Credentials>,
    login: Option<Login>,
    /// Set by `invalidate`; the next `ensure_valid` refreshes regardless of expiry.
    stale: bool,
}

impl StoreState {
    fn usable(&self, margin: Duration) -> Option<&Credentials> {
        self.credentials
            .as_ref()
            .filter(|c| !self.stale && !c.needs_refresh(margin))
    }
}

/// Token cache with single-flight refresh.
pub struct CredentialStore {
    provider: Arc<dyn IdentityProvider>,
    workers: WorkerPool,
    refresh_margin: Duration,
    state: RwLock<StoreState>,
}

impl CredentialStore {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        workers: WorkerPool,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            provider,
            workers,
            refresh_margin,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Authenticates with a password and retains it for later recovery.
    pub async fn authenticate(&self, username: &str, password: &str) -> SyncResult<Credentials> {
        let login = Login {
            username: username.to_string(),
            password: password.to_string(),
        };

        let mut state = self.state.write().await;
        let credentials = self.password_login(&login).await?;

        info!(
            username = %login.username,
            expires_in_secs = credentials.remaining_secs(),
            "Authenticated with identity provider"
        );
        state.credentials = Some(credentials.clone());
        state.login = Some(login);
        state.stale = false;
        Ok(credentials)
    }

    /// Returns credentials that are not about to expire.
    ///
    /// ## Flow
    /// 1. Cached credentials outside the refresh margin are returned as is
    /// 2. Otherwise the refresh token is exchanged
    /// 3. A rejected refresh token falls back to the retained password
    pub async fn ensure_valid(&self) -> SyncResult<Credentials> {
        {
            let state = self.state.read().await;
            if let Some(credentials) = state.usable(self.refresh_margin) {
                debug!(
                    remaining_secs = credentials.remaining_secs(),
                    "Using cached credentials"
                );
                return Ok(credentials.clone());
            }
        }

        let mut state = self.state.write().await;

        // Double-check after acquiring write lock
        if let Some(credentials) = state.usable(self.refresh_margin) {
            return Ok(credentials.clone());
        }

        if let Some(current) = state.credentials.as_ref() {
            let provider = self.provider.clone();
            let refresh_token = current.refresh_token.clone();
            let outcome = self
                .workers
                .run(async move { provider.refresh(&refresh_token).await })
                .await?;

            match outcome {
                Ok(credentials) => {
                    info!(
                        expires_in_secs = credentials.remaining_secs(),
                        "Credentials refreshed"
                    );
                    state.credentials = Some(credentials.clone());
                    state.stale = false;
                    return Ok(credentials);
                }
                Err(IdentityError::InvalidCredentials(reason)) => {
                    warn!(%reason, "Refresh token rejected, re-authenticating with password");
                }
                Err(IdentityError::ServiceUnavailable(reason)) => {
                    return Err(SyncError::IdentityUnavailable(reason));
                }
            }
        }

        let Some(login) = state.login.clone() else {
            state.credentials = None;
            return Err(SyncError::Authentication("not authenticated".into()));
        };

        match self.password_login(&login).await {
            Ok(credentials) => {
                info!(
                    username = %login.username,
                    expires_in_secs = credentials.remaining_secs(),
                    "Re-authenticated with identity provider"
                );
                state.credentials = Some(credentials.clone());
                state.stale = false;
                Ok(credentials)
            }
            Err(e) => {
                if e.is_auth_error() {
                    state.credentials = None;
                }
                Err(e)
            }
        }
    }

    /// Forces the next [`ensure_valid`](Self::ensure_valid) to refresh.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        if state.credentials.is_some() {
            debug!("Credentials invalidated");
            state.stale = true;
        }
    }

    /// Drops credentials and the retained password.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = StoreState::default();
        debug!("Credentials cleared");
    }

    /// True if credentials are held and not yet expired.
    pub async fn is_authenticated(&self) -> bool {
        self.state
            .read()
            .await
            .credentials
            .as_ref()
            .is_some_and(|c| !c.is_expired())
    }

    /// Current credentials without triggering a refresh.
    pub async fn current(&self) -> Option<Credentials> {
        self.state.read().await.credentials.clone()
    }

    async fn password_login(&self, login: &Login) -> SyncResult<Credentials> {
        let provider = self.provider.clone();
        let Login { username, password } = login.clone();
        let outcome = self
            .workers
            .run(async move { provider.authenticate(&username, &password).await })
            .await?;

        outcome.map_err(|e| match e {
            IdentityError::InvalidCredentials(reason) => SyncError::Authentication(reason),
            IdentityError::ServiceUnavailable(reason) => SyncError::IdentityUnavailable(reason),
        })
    }
}
