//! In-memory stand-ins for the identity provider, broker and directory.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use upgw_core::{DeviceInfo, GatewayInfo};

use crate::broker::{BrokerClient, BrokerConnector, BrokerEvent, BrokerLink, TransportError};
use crate::directory::DeviceDirectory;
use crate::error::SyncResult;
use crate::identity::{Credentials, IdentityError, IdentityProvider};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Identity
// =============================================================================

struct IdentityState {
    username: String,
    password: String,
    valid_refresh_tokens: HashSet<String>,
    lifetime: Duration,
    latency: Duration,
    unavailable: bool,
    issued: u64,
}

/// Identity provider with one user and counted calls.
pub struct FakeIdentity {
    state: Mutex<IdentityState>,
    authenticate_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl FakeIdentity {
    pub fn new(username: &str, password: &str) -> Self {
        FakeIdentity {
            state: Mutex::new(IdentityState {
                username: username.to_string(),
                password: password.to_string(),
                valid_refresh_tokens: HashSet::new(),
                lifetime: Duration::from_secs(3600),
                latency: Duration::ZERO,
                unavailable: false,
                issued: 0,
            }),
            authenticate_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn set_lifetime(&self, lifetime: Duration) {
        locked(&self.state).lifetime = lifetime;
    }

    pub fn set_latency(&self, latency: Duration) {
        locked(&self.state).latency = latency;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        locked(&self.state).unavailable = unavailable;
    }

    pub fn set_password(&self, password: &str) {
        locked(&self.state).password = password.to_string();
    }

    pub fn revoke_refresh_tokens(&self) {
        locked(&self.state).valid_refresh_tokens.clear();
    }

    fn latency(&self) -> Duration {
        locked(&self.state).latency
    }

    fn issue(state: &mut IdentityState, refresh_token: Option<String>) -> Credentials {
        state.issued += 1;
        let refresh_token = refresh_token.unwrap_or_else(|| format!("refresh-{}", state.issued));
        state.valid_refresh_tokens.insert(refresh_token.clone());
        Credentials::new(
            format!("access-{}", state.issued),
            format!("id-{}", state.issued),
            refresh_token,
            state.lifetime,
        )
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Credentials, IdentityError> {
        tokio::time::sleep(self.latency()).await;
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = locked(&self.state);
        if state.unavailable {
            return Err(IdentityError::ServiceUnavailable("identity offline".into()));
        }
        if username != state.username || password != state.password {
            return Err(IdentityError::InvalidCredentials(
                "Incorrect username or password.".into(),
            ));
        }
        Ok(Self::issue(&mut state, None))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, IdentityError> {
        tokio::time::sleep(self.latency()).await;
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = locked(&self.state);
        if state.unavailable {
            return Err(IdentityError::ServiceUnavailable("identity offline".into()));
        }
        if !state.valid_refresh_tokens.contains(refresh_token) {
            return Err(IdentityError::InvalidCredentials(
                "Invalid Refresh Token".into(),
            ));
        }
        Ok(Self::issue(&mut state, Some(refresh_token.to_string())))
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Everything the fake broker saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    Connect,
    Subscribe(String),
    Publish(String, Vec<u8>),
    Disconnect,
}

/// Answers a publish with messages delivered back on the same link.
pub type Responder = Arc<dyn Fn(&str, &[u8]) -> Vec<(String, Vec<u8>)> + Send + Sync>;

#[derive(Default)]
struct BrokerState {
    log: Vec<BrokerOp>,
    attempts: usize,
    fail_next: usize,
    reject_next: usize,
    preload: Vec<(String, Vec<u8>)>,
    generation: u64,
    events: Option<mpsc::Sender<BrokerEvent>>,
    responder: Option<Responder>,
}

/// Broker connector whose links live in memory.
#[derive(Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection attempts, successful or not.
    pub fn connect_count(&self) -> usize {
        locked(&self.state).attempts
    }

    pub fn log(&self) -> Vec<BrokerOp> {
        locked(&self.state).log.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.log()
            .into_iter()
            .filter_map(|op| match op {
                BrokerOp::Publish(topic, payload) => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next_connects(&self, count: usize) {
        locked(&self.state).fail_next = count;
    }

    pub fn reject_next_connects(&self, count: usize) {
        locked(&self.state).reject_next = count;
    }

    /// Messages waiting on the next link as soon as it is established.
    pub fn preload_on_connect(&self, topic: &str, payload: Vec<u8>) {
        locked(&self.state).preload.push((topic.to_string(), payload));
    }

    pub fn set_responder(&self, responder: Responder) {
        locked(&self.state).responder = Some(responder);
    }

    /// Pushes a message on the current link.
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) {
        if let Some(events) = locked(&self.state).events.as_ref() {
            let _ = events.try_send(BrokerEvent::Message {
                topic: topic.to_string(),
                payload,
            });
        }
    }

    /// Kills the current link.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(events) = locked(&self.state).events.take() {
            let _ = events.try_send(BrokerEvent::Disconnected(reason.to_string()));
        }
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    async fn connect(&self, _credentials: &Credentials) -> Result<BrokerLink, TransportError> {
        let mut state = locked(&self.state);
        state.attempts += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(TransportError::Rejected("NotAuthorized".into()));
        }

        let (tx, rx) = mpsc::channel(256);
        for (topic, payload) in state.preload.drain(..) {
            let _ = tx.try_send(BrokerEvent::Message { topic, payload });
        }
        state.generation += 1;
        state.events = Some(tx);
        state.log.push(BrokerOp::Connect);

        Ok(BrokerLink {
            client: Arc::new(FakeClient {
                state: self.state.clone(),
                generation: state.generation,
            }),
            events: rx,
        })
    }
}

struct FakeClient {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
}

impl FakeClient {
    fn live<'a>(&self, state: &'a MutexGuard<'_, BrokerState>) -> Option<&'a mpsc::Sender<BrokerEvent>> {
        if state.generation == self.generation {
            state.events.as_ref()
        } else {
            None
        }
    }
}

#[async_trait]
impl BrokerClient for FakeClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let (events, replies) = {
            let mut state = locked(&self.state);
            let events = self.live(&state).cloned().ok_or(TransportError::Closed)?;
            state.log.push(BrokerOp::Publish(topic.to_string(), payload.clone()));
            let replies = state
                .responder
                .as_ref()
                .map(|respond| respond(topic, &payload))
                .unwrap_or_default();
            (events, replies)
        };

        for (topic, payload) in replies {
            let _ = events.send(BrokerEvent::Message { topic, payload }).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = locked(&self.state);
        if self.live(&state).is_none() {
            return Err(TransportError::Closed);
        }
        state.log.push(BrokerOp::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = locked(&self.state);
        state.log.push(BrokerOp::Disconnect);
        if state.generation == self.generation {
            state.events = None;
        }
    }
}

// =============================================================================
// Directory
// =============================================================================

/// Directory returning a fixed inventory.
pub struct FakeDirectory {
    inventory: Vec<(GatewayInfo, Vec<DeviceInfo>)>,
    calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn new(inventory: Vec<(GatewayInfo, Vec<DeviceInfo>)>) -> Self {
        FakeDirectory {
            inventory,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceDirectory for FakeDirectory {
    async fn list_gateways(
        &self,
        _credentials: &Credentials,
    ) -> SyncResult<Vec<(GatewayInfo, Vec<DeviceInfo>)>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inventory.clone())
    }
}
