//! # Sync Client
//!
//! Orchestrates credentials, the broker session, the device registry and
//! pending requests behind one caller-facing object.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            SyncClient                                   │
//! │                                                                         │
//! │  caller ──update/refresh──► Track ──────────┐                           │
//! │     │                                       ▼                           │
//! │     │                         ┌───────────────────────────┐             │
//! │     │ publish                 │     Processing loop       │             │
//! │     ▼                         │                           │             │
//! │  ┌──────────────┐  events     │  decode → apply → resolve │──► listeners│
//! │  │   Session    │────────────►│           → notify        │             │
//! │  │ (reconnects) │             │                           │             │
//! │  └──────┬───────┘             │  owns PendingRequestTable │             │
//! │         │ ensure_valid        │  only writer of registry  │             │
//! │         ▼                     └─────────────┬─────────────┘             │
//! │  ┌──────────────┐                           │                           │
//! │  │ Credentials  │            get_devices ◄──┘ short read lock           │
//! │  └──────────────┘                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let config = ClientConfig::load(None)?;
//! let client = SyncClient::start(config.clone(), ClientDeps::from_config(&config)?, "me@example.com", "secret").await?;
//! client.populate_devices().await?;
//! client.refresh_all_devices().await?;
//!
//! for (gateway, device) in client.get_devices() {
//!     println!("{} / {}: {:?}", gateway.name(), device.name(), device.attributes.target_temperature());
//! }
//!
//! client.device(&"T1".into())?.update_target_temperature(20.5).await?;
//! client.close().await;
//! ```

use futures_util::future::try_join_all;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use upgw_core::shadow::{
    decode_message, encode_get_request, encode_update_request, subscription_topics,
    ShadowCommand, ShadowResponse, ShadowTopic,
};
use upgw_core::validation::validate_update;
use upgw_core::{
    Attribute, AttributeBag, AttributeMap, AttributeValue, DeviceId, DeviceInfo, DeviceSnapshot,
    GatewayInfo, GatewaySnapshot, SystemMode,
};

use crate::broker::{BrokerConnector, MqttConnector};
use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::directory::{DeviceDirectory, ServiceApiDirectory};
use crate::error::{SyncError, SyncResult};
use crate::identity::{CognitoIdentityProvider, IdentityError, IdentityProvider};
use crate::listeners::{DeviceListener, ListenerRegistry, SubscriptionId};
use crate::pending::{CorrelationKey, PendingHandle, PendingRequestTable};
use crate::registry::DeviceRegistry;
use crate::session::{SessionConfig, SessionEvent, SessionHandle, SessionState, TransportSession};
use crate::worker::WorkerPool;

const REQUEST_BUFFER: usize = 64;

// =============================================================================
// Dependencies
// =============================================================================

/// External boundaries the client talks to.
pub struct ClientDeps {
    pub identity: Arc<dyn IdentityProvider>,
    pub connector: Arc<dyn BrokerConnector>,
    pub directory: Arc<dyn DeviceDirectory>,
}

impl ClientDeps {
    /// Production implementations: Cognito, MQTT over TLS and the service API.
    pub fn from_config(config: &ClientConfig) -> SyncResult<Self> {
        let http_timeout = config.broker.connect_timeout();
        let identity = CognitoIdentityProvider::new(&config.auth, http_timeout).map_err(
            |e: IdentityError| SyncError::client("Failed to build identity client", e),
        )?;

        Ok(ClientDeps {
            identity: Arc::new(identity),
            connector: Arc::new(MqttConnector::new(config.broker.clone())),
            directory: Arc::new(ServiceApiDirectory::new(&config.service, http_timeout)?),
        })
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// Acknowledgement of a shadow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub version: Option<u64>,
}

type Pending = PendingHandle<CorrelationKey, Acknowledgement>;

/// State read by callers and written only by the processing loop.
#[derive(Default)]
struct Shared {
    registry: RwLock<DeviceRegistry>,
    listeners: ListenerRegistry,
}

impl Shared {
    fn registry(&self) -> RwLockReadGuard<'_, DeviceRegistry> {
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, DeviceRegistry> {
        self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Request {
    Track {
        key: CorrelationKey,
        token: String,
        timeout: Duration,
        reply: oneshot::Sender<Pending>,
    },
    Insert {
        gateway: GatewayInfo,
        devices: Vec<DeviceInfo>,
        reply: oneshot::Sender<Vec<DeviceId>>,
    },
}

// =============================================================================
// Sync Client
// =============================================================================

/// Client for gateways and thermostats behind the cloud device shadow.
///
/// Dropping the client tears everything down; [`close`](Self::close) does
/// the same and waits for the broker connection to close.
pub struct SyncClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    credentials: Arc<CredentialStore>,
    session: SessionHandle,
    directory: Arc<dyn DeviceDirectory>,
    workers: WorkerPool,
    requests: mpsc::Sender<Request>,
    shutdown: CancellationToken,
}

impl SyncClient {
    /// Authenticates, connects and starts the processing loop.
    ///
    /// Fails without leaving anything running if authentication or the
    /// first connection attempt fails.
    pub async fn start(
        config: ClientConfig,
        deps: ClientDeps,
        username: &str,
        password: &str,
    ) -> SyncResult<Self> {
        config.validate()?;

        info!(
            username = %username,
            broker = %config.broker.endpoint,
            "Starting sync client"
        );

        let workers = WorkerPool::new(config.sync.max_workers);
        let credentials = Arc::new(CredentialStore::new(
            deps.identity,
            workers.clone(),
            Duration::from_secs(config.auth.refresh_margin_secs),
        ));

        if let Err(e) = credentials.authenticate(username, password).await {
            error!(error = %e, "Initial authentication failed");
            workers.close();
            return Err(e);
        }

        let shutdown = CancellationToken::new();
        let (session, events, first_attempt) = TransportSession::spawn(
            deps.connector,
            credentials.clone(),
            workers.clone(),
            SessionConfig::from(&config.broker),
            shutdown.clone(),
        );

        let connected = first_attempt
            .await
            .unwrap_or(Err(SyncError::ClientClosed));
        if let Err(e) = connected {
            error!(error = %e, "Initial connection failed");
            shutdown.cancel();
            workers.close();
            credentials.clear().await;
            return Err(e);
        }

        let shared = Arc::new(Shared::default());
        let (table, cancelled) = PendingRequestTable::new();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_BUFFER);

        let processor = Processor {
            shared: shared.clone(),
            session: session.clone(),
            table,
            cancelled,
            requests: requests_rx,
            events,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(processor.run());

        info!("Sync client started");

        Ok(SyncClient {
            config,
            shared,
            credentials,
            session,
            directory: deps.directory,
            workers,
            requests: requests_tx,
            shutdown,
        })
    }

    /// Stops everything. Outstanding requests fail with `ClientClosed`.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Closing sync client");

        self.shutdown.cancel();
        self.workers.close();

        let mut state = self.session.watch_state();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        self.credentials.clear().await;

        info!("Sync client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Authenticates again and resumes an unauthorized session.
    pub async fn authenticate(&self, username: &str, password: &str) -> SyncResult<()> {
        self.ensure_open()?;
        self.credentials.authenticate(username, password).await?;
        if self.session.state() == SessionState::Unauthorized {
            info!("Resuming session after re-authentication");
            self.session.resume().await?;
        }
        Ok(())
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Loads every gateway and device from the service API.
    pub async fn populate_devices(&self) -> SyncResult<()> {
        self.ensure_open()?;
        let credentials = self.credentials.ensure_valid().await?;
        let inventory = self.directory.list_gateways(&credentials).await?;

        for (gateway, devices) in inventory {
            self.register_gateway(gateway, devices).await?;
        }
        Ok(())
    }

    /// Adds a gateway and its devices and subscribes to their shadows.
    pub async fn register_gateway(
        &self,
        gateway: GatewayInfo,
        devices: Vec<DeviceInfo>,
    ) -> SyncResult<()> {
        let topics: Vec<String> = devices
            .iter()
            .flat_map(|device| subscription_topics(&device.id))
            .collect();

        let (reply, rx) = oneshot::channel();
        self.send(Request::Insert {
            gateway,
            devices,
            reply,
        })
        .await?;
        let added = rx.await.map_err(|_| SyncError::ClientClosed)?;
        if !added.is_empty() {
            debug!(count = added.len(), "New devices registered");
        }

        self.session.subscribe(topics).await
    }

    /// Gateways in registration order.
    pub fn get_gateways(&self) -> Vec<GatewaySnapshot> {
        self.shared.registry().get_gateways()
    }

    /// Every device with its gateway.
    pub fn get_devices(&self) -> Vec<(GatewaySnapshot, DeviceSnapshot)> {
        self.shared.registry().get_devices()
    }

    /// Handle for one known device.
    pub fn device(&self, id: &DeviceId) -> SyncResult<DeviceHandle<'_>> {
        if !self.shared.registry().contains(id) {
            return Err(SyncError::UnknownDevice(id.clone()));
        }
        Ok(DeviceHandle {
            client: self,
            id: id.clone(),
        })
    }

    // =========================================================================
    // State Synchronization
    // =========================================================================

    /// Requests every device's full state and waits until each one has
    /// been applied.
    pub async fn refresh_all_devices(&self) -> SyncResult<()> {
        let ids = self.shared.registry().device_ids();
        self.refresh(ids).await
    }

    pub async fn refresh_device(&self, id: &DeviceId) -> SyncResult<()> {
        if !self.shared.registry().contains(id) {
            return Err(SyncError::UnknownDevice(id.clone()));
        }
        self.refresh(vec![id.clone()]).await
    }

    async fn refresh(&self, ids: Vec<DeviceId>) -> SyncResult<()> {
        self.ensure_open()?;
        self.credentials.ensure_valid().await?;

        let timeout = self.config.sync.refresh_timeout();
        debug!(devices = ids.len(), "Refreshing device state");

        let requests = ids.into_iter().map(|id| {
            let token = Uuid::new_v4();
            let topic = ShadowTopic::request(id.clone(), ShadowCommand::Get).to_string();
            self.request(CorrelationKey::get(id, token), token, topic, encode_get_request, timeout)
        });
        try_join_all(requests).await?;
        Ok(())
    }

    /// Sets one writable attribute and waits for the shadow service to
    /// accept it.
    ///
    /// The value is validated before anything is sent. Completion means the
    /// request was accepted, not that the device applied it; the device's
    /// own report arrives later through the listeners.
    pub async fn update_device_attribute(
        &self,
        id: &DeviceId,
        attribute: Attribute,
        value: AttributeValue,
    ) -> SyncResult<()> {
        let current = self.shared.registry().device(id).map(|d| d.attributes);
        let empty = AttributeBag::default();
        validate_update(attribute, &value, current.as_ref().unwrap_or(&empty))?;
        if current.is_none() {
            return Err(SyncError::UnknownDevice(id.clone()));
        }
        self.ensure_open()?;

        let mut changes = AttributeMap::new();
        changes.insert(attribute, value);

        let topic = ShadowTopic::request(id.clone(), ShadowCommand::Update).to_string();
        let ack = self
            .request(
                CorrelationKey::update(id.clone(), attribute),
                Uuid::new_v4(),
                topic,
                |token| encode_update_request(&changes, token),
                self.config.sync.publish_timeout(),
            )
            .await?;

        debug!(device = %id, %attribute, version = ?ack.version, "Update accepted");
        Ok(())
    }

    /// Registers, publishes and waits for one correlated request.
    ///
    /// Dropping the returned future cancels the request.
    async fn request(
        &self,
        key: CorrelationKey,
        token: Uuid,
        topic: String,
        encode: impl FnOnce(&str) -> Vec<u8>,
        timeout: Duration,
    ) -> SyncResult<Acknowledgement> {
        let deadline = Instant::now() + timeout;
        let token = token.to_string();
        let payload = encode(&token);

        let (reply, rx) = oneshot::channel();
        self.send(Request::Track {
            key: key.clone(),
            token,
            timeout,
            reply,
        })
        .await?;
        let pending = rx.await.map_err(|_| SyncError::ClientClosed)?;

        // Publishing waits for a connection; the request deadline bounds it
        match tokio::time::timeout_at(deadline, self.session.publish(topic, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SyncError::timeout(key.to_string(), timeout)),
        }

        pending.wait().await
    }

    async fn send(&self, request: Request) -> SyncResult<()> {
        self.ensure_open()?;
        self.requests
            .send(request)
            .await
            .map_err(|_| SyncError::ClientClosed)
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::ClientClosed);
        }
        Ok(())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.workers.close();
    }
}

// =============================================================================
// Device Handle
// =============================================================================

/// Per-device view of a [`SyncClient`].
pub struct DeviceHandle<'a> {
    client: &'a SyncClient,
    id: DeviceId,
}

impl DeviceHandle<'_> {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Current state, copied out of the registry.
    pub fn snapshot(&self) -> Option<DeviceSnapshot> {
        self.client.shared.registry().device(&self.id)
    }

    pub async fn update_target_temperature(&self, celsius: f64) -> SyncResult<()> {
        self.client
            .update_device_attribute(
                &self.id,
                Attribute::TargetTemperature,
                AttributeValue::Temperature(celsius),
            )
            .await
    }

    pub async fn update_system_mode(&self, mode: SystemMode) -> SyncResult<()> {
        self.client
            .update_device_attribute(&self.id, Attribute::SystemMode, mode.into())
            .await
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        self.client.refresh_device(&self.id).await
    }

    /// Registers a callback for changes to this device.
    pub fn subscribe(&self, listener: impl DeviceListener + 'static) -> SubscriptionId {
        self.client
            .shared
            .listeners
            .subscribe(self.id.clone(), Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.client.shared.listeners.unsubscribe(&self.id, id)
    }
}

// =============================================================================
// Processing Loop
// =============================================================================

struct Processor {
    shared: Arc<Shared>,
    session: SessionHandle,
    table: PendingRequestTable<CorrelationKey, Acknowledgement>,
    cancelled: mpsc::UnboundedReceiver<(CorrelationKey, u64)>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::Receiver<SessionEvent>,
    shutdown: CancellationToken,
}

impl Processor {
    /// Single serialization point for inbound traffic and pending requests.
    async fn run(mut self) {
        debug!("Processing loop started");

        loop {
            let deadline = self.table.next_deadline();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(request) = self.requests.recv() => self.handle_request(request),

                Some((key, id)) = self.cancelled.recv() => {
                    self.table.cancel(&key, id);
                }

                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for key in self.table.expire(Instant::now()) {
                        warn!(%key, "Request timed out");
                    }
                }
            }
        }

        self.table.fail_all(|| SyncError::ClientClosed);
        debug!("Processing loop stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Track {
                key,
                token,
                timeout,
                reply,
            } => {
                let handle = self.table.register(key, token, timeout);
                // A caller that went away drops the handle, which cancels it
                let _ = reply.send(handle);
            }
            Request::Insert {
                gateway,
                devices,
                reply,
            } => {
                let added = self.shared.registry_mut().insert_gateway(gateway, devices);
                let _ = reply.send(added);
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Message { topic, payload } => self.handle_message(&topic, &payload),
            SessionEvent::Ready { reconnected } => {
                if reconnected {
                    self.request_all_states();
                }
            }
            SessionEvent::Disconnected(reason) => {
                debug!(%reason, "Marking devices unavailable");
                let changed = self.shared.registry_mut().mark_all_unavailable();
                for (id, set) in changed {
                    self.notify(&id, &set);
                }
            }
            SessionEvent::AuthenticationFailed(reason) => {
                warn!(%reason, pending = self.table.len(), "Failing pending requests");
                self.table
                    .fail_all(|| SyncError::Authentication(reason.clone()));
            }
        }
    }

    /// Decode, apply, resolve, then notify.
    fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let message = match decode_message(topic, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(%topic, error = %e, "Dropping malformed shadow message");
                return;
            }
        };
        let token = message.client_token().map(str::to_string);
        let thing = message.thing;

        match message.response {
            ShadowResponse::Accepted(doc) => {
                debug!(
                    device = %thing,
                    command = message.command.as_str(),
                    version = ?doc.version,
                    timestamp = ?doc.timestamp,
                    "Shadow document accepted"
                );
                let changed = {
                    let mut registry = self.shared.registry_mut();
                    match (message.command, doc.reported) {
                        (ShadowCommand::Get, reported) => {
                            let state = reported.unwrap_or_default();
                            log_skipped(&thing, &state.skipped);
                            registry.apply_snapshot(&thing, state.attributes)
                        }
                        (ShadowCommand::Update, Some(reported)) => {
                            log_skipped(&thing, &reported.skipped);
                            registry.apply_delta(&thing, &reported.attributes)
                        }
                        (ShadowCommand::Update, None) => None,
                    }
                };

                let ack = Acknowledgement {
                    version: doc.version,
                };
                if let Some(key) = token.and_then(|token| self.table.resolve_token(&token, ack)) {
                    debug!(%key, "Request acknowledged");
                }
                // Any applied snapshot satisfies every get waiting on the device
                if message.command == ShadowCommand::Get && changed.is_some() {
                    let satisfied = self.table.resolve_matching(|key| key.is_get_for(&thing), ack);
                    if !satisfied.is_empty() {
                        debug!(device = %thing, count = satisfied.len(), "Refresh requests satisfied");
                    }
                }

                if let Some(set) = changed {
                    self.notify(&thing, &set);
                }
            }
            ShadowResponse::Rejected(doc) => {
                warn!(device = %thing, code = doc.code, message = %doc.message, "Shadow request rejected");
                if let Some(token) = token {
                    self.table.reject_token(
                        &token,
                        SyncError::Rejected {
                            code: doc.code,
                            message: doc.message,
                        },
                    );
                }
            }
        }
    }

    fn notify(&self, id: &DeviceId, changed: &upgw_core::ChangeSet) {
        if changed.is_empty() {
            return;
        }
        let snapshot = self.shared.registry().device(id);
        if let Some(snapshot) = snapshot {
            self.shared.listeners.dispatch(&snapshot, changed);
        }
    }

    /// Re-requests every device's state after a reconnect.
    ///
    /// Fire and forget: answers are applied like any other snapshot.
    fn request_all_states(&self) {
        let ids = self.shared.registry().device_ids();
        if ids.is_empty() {
            return;
        }
        info!(devices = ids.len(), "Requesting device state after reconnect");

        let session = self.session.clone();
        tokio::spawn(async move {
            for id in ids {
                let topic = ShadowTopic::request(id.clone(), ShadowCommand::Get).to_string();
                let token = Uuid::new_v4().to_string();
                if let Err(e) = session.publish(topic, encode_get_request(&token)).await {
                    warn!(device = %id, error = %e, "Failed to request device state");
                    break;
                }
            }
        });
    }
}

fn log_skipped(thing: &DeviceId, skipped: &[upgw_core::shadow::SkippedValue]) {
    for value in skipped {
        warn!(device = %thing, key = %value.key, value = %value.value, "Skipping unparseable property");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BrokerOp, FakeBroker, FakeDirectory, FakeIdentity, Responder};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use upgw_core::ChangeSet;

    #[derive(Clone, Copy)]
    enum UpdateReply {
        Accept,
        Reject,
        Ignore,
    }

    type Reported = Arc<Mutex<HashMap<String, Value>>>;

    fn thing_of(topic: &str) -> String {
        topic.split('/').nth(2).unwrap_or_default().to_string()
    }

    fn token_of(payload: &[u8]) -> Value {
        serde_json::from_slice::<Value>(payload)
            .map(|v| v["clientToken"].clone())
            .unwrap_or(Value::Null)
    }

    /// Answers gets from `reported` and updates per `update`.
    fn shadow_responder(reported: Reported, update: UpdateReply) -> Responder {
        Arc::new(move |topic: &str, payload: &[u8]| {
            let token = token_of(payload);
            if topic.ends_with("/shadow/get") {
                let props = reported
                    .lock()
                    .unwrap()
                    .get(&thing_of(topic))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let doc = json!({
                    "state": { "reported": { "11": { "properties": props } } },
                    "version": 1,
                    "clientToken": token,
                });
                return vec![(format!("{topic}/accepted"), doc.to_string().into_bytes())];
            }
            if topic.ends_with("/shadow/update") {
                let request: Value = serde_json::from_slice(payload).unwrap();
                let (suffix, doc) = match update {
                    UpdateReply::Accept => (
                        "accepted",
                        json!({ "state": request["state"], "version": 2, "clientToken": token }),
                    ),
                    UpdateReply::Reject => (
                        "rejected",
                        json!({ "code": 400, "message": "Invalid JSON", "clientToken": token }),
                    ),
                    UpdateReply::Ignore => return Vec::new(),
                };
                return vec![(format!("{topic}/{suffix}"), doc.to_string().into_bytes())];
            }
            Vec::new()
        })
    }

    fn t1_reported() -> Reported {
        let mut states = HashMap::new();
        states.insert(
            "T1".to_string(),
            json!({
                "ep1:sTherS:HeatingSetpoint_x100": 1800,
                "ep1:sTherS:LocalTemperature_x100": 1750,
                "ep1:sTherS:RunningMode": 4,
            }),
        );
        Arc::new(Mutex::new(states))
    }

    struct Fixture {
        client: SyncClient,
        broker: Arc<FakeBroker>,
        identity: Arc<FakeIdentity>,
    }

    async fn start(update: UpdateReply) -> Fixture {
        start_with(shadow_responder(t1_reported(), update)).await
    }

    async fn start_with(responder: Responder) -> Fixture {
        let broker = Arc::new(FakeBroker::new());
        broker.set_responder(responder);
        let identity = Arc::new(FakeIdentity::new("user", "pass"));
        let deps = ClientDeps {
            identity: identity.clone(),
            connector: broker.clone(),
            directory: Arc::new(FakeDirectory::new(Vec::new())),
        };
        let client = SyncClient::start(ClientConfig::default(), deps, "user", "pass")
            .await
            .unwrap();
        client
            .register_gateway(
                GatewayInfo::unnamed(DeviceId::new("GW1")),
                vec![DeviceInfo::thermostat(DeviceId::new("T1"), "Living room")],
            )
            .await
            .unwrap();
        Fixture {
            client,
            broker,
            identity,
        }
    }

    fn t1() -> DeviceId {
        DeviceId::new("T1")
    }

    /// Lets the processing loop drain its inputs.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_update_and_notify() {
        let fx = start(UpdateReply::Accept).await;

        fx.client.refresh_all_devices().await.unwrap();
        let devices = fx.client.get_devices();
        assert_eq!(devices.len(), 1);
        let (gateway, device) = &devices[0];
        assert_eq!(gateway.id().as_str(), "GW1");
        assert_eq!(device.attributes.target_temperature(), Some(18.0));
        assert_eq!(device.attributes.current_temperature(), Some(17.5));
        assert_eq!(device.attributes.system_mode(), Some(SystemMode::Heat));
        assert!(device.attributes.available());

        let seen: Arc<Mutex<Vec<ChangeSet>>> = Arc::default();
        let sink = seen.clone();
        let handle = fx.client.device(&t1()).unwrap();
        handle.subscribe(move |_: &DeviceSnapshot, changed: &ChangeSet| {
            sink.lock().unwrap().push(changed.clone());
        });

        handle.update_target_temperature(20.0).await.unwrap();
        let (topic, payload) = fx.broker.published().pop().unwrap();
        assert_eq!(topic, "$aws/things/T1/shadow/update");
        let body: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            body["state"]["desired"]["11"]["properties"]["ep1:sTherS:SetHeatingSetpoint_x100"],
            json!(2000)
        );

        // Accepted desired state alone changes nothing
        assert!(seen.lock().unwrap().is_empty());

        // The device reports the new setpoint
        let report = json!({
            "state": { "reported": { "11": { "properties": {
                "ep1:sTherS:HeatingSetpoint_x100": 2000
            } } } },
            "version": 3,
        });
        fx.broker.deliver(
            "$aws/things/T1/shadow/update/accepted",
            report.to_string().into_bytes(),
        );
        settle().await;

        let expected: ChangeSet = [Attribute::TargetTemperature].into_iter().collect();
        assert_eq!(*seen.lock().unwrap(), vec![expected]);
        assert_eq!(
            handle.snapshot().unwrap().attributes.target_temperature(),
            Some(20.0)
        );

        // Echo of the same report is suppressed
        fx.broker.deliver(
            "$aws/things/T1/shadow/update/accepted",
            report.to_string().into_bytes(),
        );
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_both_complete() {
        let fx = start(UpdateReply::Accept).await;

        let (first, second) = tokio::join!(
            fx.client.refresh_all_devices(),
            fx.client.refresh_all_devices(),
        );

        first.unwrap();
        second.unwrap();
        let device = fx.client.device(&t1()).unwrap().snapshot().unwrap();
        assert_eq!(device.attributes.target_temperature(), Some(18.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_snapshot_completes_every_waiting_refresh() {
        // Only the first get is answered
        let answered = Arc::new(Mutex::new(false));
        let inner = shadow_responder(t1_reported(), UpdateReply::Accept);
        let fx = start_with(Arc::new(move |topic: &str, payload: &[u8]| {
            let mut answered = answered.lock().unwrap();
            if topic.ends_with("/shadow/get") && *answered {
                return Vec::new();
            }
            *answered = true;
            inner(topic, payload)
        }))
        .await;

        let handle = fx.client.device(&t1()).unwrap();
        let id = t1();
        let (first, second) = tokio::join!(handle.refresh(), fx.client.refresh_device(&id));

        first.unwrap();
        second.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_refresh_times_out() {
        let fx = start_with(Arc::new(|_: &str, _: &[u8]| Vec::new())).await;

        let started = Instant::now();
        let err = fx.client.refresh_all_devices().await.unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(started.elapsed() >= fx.client.config().sync.refresh_timeout());
        let device = fx.client.device(&t1()).unwrap().snapshot().unwrap();
        assert!(!device.attributes.available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_credentials_fail_pending_then_recover() {
        let fx = start(UpdateReply::Ignore).await;
        let handle = fx.client.device(&t1()).unwrap();

        let revoke = async {
            settle().await;
            fx.identity.revoke_refresh_tokens();
            fx.identity.set_password("changed");
            fx.broker.reject_next_connects(1);
            fx.broker.drop_connection("token revoked");
        };
        let (result, ()) = tokio::join!(handle.update_system_mode(SystemMode::Off), revoke);

        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        assert_eq!(fx.client.session_state(), SessionState::Unauthorized);

        let err = fx.client.authenticate("user", "pass").await.unwrap_err();
        assert!(err.is_auth_error());
        fx.client.authenticate("user", "changed").await.unwrap();

        let mut state = fx.client.session.watch_state();
        state
            .wait_for(|s| *s == SessionState::Connected)
            .await
            .unwrap();
        fx.client.refresh_device(&t1()).await.unwrap();
        let device = fx.client.device(&t1()).unwrap().snapshot().unwrap();
        assert!(device.attributes.available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_values_are_never_published() {
        let fx = start(UpdateReply::Accept).await;
        let before = fx.broker.published().len();
        let handle = fx.client.device(&t1()).unwrap();

        let err = handle.update_target_temperature(f64::NAN).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        let err = handle.update_target_temperature(45.0).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        let err = fx
            .client
            .update_device_attribute(
                &t1(),
                Attribute::CurrentTemperature,
                AttributeValue::Temperature(20.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        assert_eq!(fx.broker.published().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device() {
        let fx = start(UpdateReply::Accept).await;
        let ghost = DeviceId::new("ghost");

        assert!(matches!(fx.client.device(&ghost), Err(SyncError::UnknownDevice(_))));
        assert!(matches!(
            fx.client
                .update_device_attribute(&ghost, Attribute::SystemMode, SystemMode::Off.into())
                .await,
            Err(SyncError::UnknownDevice(_))
        ));
        assert!(matches!(
            fx.client.refresh_device(&ghost).await,
            Err(SyncError::UnknownDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_update_times_out() {
        let fx = start(UpdateReply::Ignore).await;
        let handle = fx.client.device(&t1()).unwrap();

        let started = Instant::now();
        let err = handle.update_system_mode(SystemMode::Off).await.unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_update_supersedes_first() {
        let fx = start(UpdateReply::Ignore).await;
        let handle = fx.client.device(&t1()).unwrap();

        let (first, second) = tokio::join!(
            handle.update_target_temperature(19.0),
            handle.update_target_temperature(21.0),
        );

        assert!(matches!(first, Err(SyncError::Superseded { .. })));
        assert!(matches!(second, Err(SyncError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_update() {
        let fx = start(UpdateReply::Reject).await;
        let err = fx
            .client
            .device(&t1())
            .unwrap()
            .update_target_temperature(21.0)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Rejected { code: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_is_dropped() {
        let fx = start(UpdateReply::Accept).await;
        fx.client.refresh_all_devices().await.unwrap();

        fx.broker
            .deliver("$aws/things/T1/shadow/update/accepted", b"not json".to_vec());
        settle().await;

        // Still processing after the bad message
        fx.client.refresh_device(&t1()).await.unwrap();
        let device = fx.client.device(&t1()).unwrap().snapshot().unwrap();
        assert_eq!(device.attributes.target_temperature(), Some(18.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_marks_unavailable_then_refreshes() {
        let fx = start(UpdateReply::Accept).await;
        fx.client.refresh_all_devices().await.unwrap();

        let seen: Arc<Mutex<Vec<ChangeSet>>> = Arc::default();
        let sink = seen.clone();
        fx.client
            .device(&t1())
            .unwrap()
            .subscribe(move |_: &DeviceSnapshot, changed: &ChangeSet| {
                sink.lock().unwrap().push(changed.clone());
            });

        fx.broker.drop_connection("network reset");
        settle().await;
        let device = fx.client.device(&t1()).unwrap().snapshot().unwrap();
        assert!(!device.attributes.available());

        // Backoff elapses, the session reconnects and state is requested again
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.client.session_state(), SessionState::Connected);
        let device = fx.client.device(&t1()).unwrap().snapshot().unwrap();
        assert!(device.attributes.available());

        let gets = fx
            .broker
            .published()
            .iter()
            .filter(|(topic, _)| topic == "$aws/things/T1/shadow/get")
            .count();
        assert_eq!(gets, 2);

        let available: ChangeSet = [Attribute::Available].into_iter().collect();
        assert_eq!(*seen.lock().unwrap(), vec![available.clone(), available]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_populate_devices_subscribes_topics() {
        let broker = Arc::new(FakeBroker::new());
        let directory = Arc::new(FakeDirectory::new(vec![(
            GatewayInfo::unnamed(DeviceId::new("GW1")),
            vec![
                DeviceInfo::thermostat(DeviceId::new("T1"), "Living room"),
                DeviceInfo::thermostat(DeviceId::new("T2"), "Bedroom"),
            ],
        )]));
        let deps = ClientDeps {
            identity: Arc::new(FakeIdentity::new("user", "pass")),
            connector: broker.clone(),
            directory: directory.clone(),
        };
        let client = SyncClient::start(ClientConfig::default(), deps, "user", "pass")
            .await
            .unwrap();

        client.populate_devices().await.unwrap();

        assert_eq!(directory.calls(), 1);
        assert_eq!(client.get_gateways()[0].children.len(), 2);
        let subscribed = broker
            .log()
            .into_iter()
            .filter(|op| matches!(op, BrokerOp::Subscribe(_)))
            .count();
        assert_eq!(subscribed, 8);
        assert!(broker
            .log()
            .contains(&BrokerOp::Subscribe("$aws/things/T2/shadow/update/rejected".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_on_bad_password() {
        let deps = ClientDeps {
            identity: Arc::new(FakeIdentity::new("user", "pass")),
            connector: Arc::new(FakeBroker::new()),
            directory: Arc::new(FakeDirectory::new(Vec::new())),
        };
        let err = SyncClient::start(ClientConfig::default(), deps, "user", "wrong")
            .await
            .err()
            .unwrap();
        assert!(err.is_auth_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_broker_unreachable() {
        let broker = Arc::new(FakeBroker::new());
        broker.fail_next_connects(1);
        let deps = ClientDeps {
            identity: Arc::new(FakeIdentity::new("user", "pass")),
            connector: broker.clone(),
            directory: Arc::new(FakeDirectory::new(Vec::new())),
        };
        let err = SyncClient::start(ClientConfig::default(), deps, "user", "pass")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Connection(_)));
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_outstanding_requests() {
        let fx = start(UpdateReply::Ignore).await;
        let client = Arc::new(fx.client);

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .update_device_attribute(&t1(), Attribute::SystemMode, SystemMode::Off.into())
                    .await
            })
        };
        settle().await;

        client.close().await;
        assert!(matches!(pending.await.unwrap(), Err(SyncError::ClientClosed)));
        assert_eq!(client.session_state(), SessionState::Closed);
        assert!(matches!(
            client.refresh_all_devices().await,
            Err(SyncError::ClientClosed)
        ));
        assert!(fx.broker.log().contains(&BrokerOp::Disconnect));
    }
}
