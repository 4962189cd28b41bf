//! # Transport Session
//!
//! One logical broker connection that survives the physical ones.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Session Connection States                         │
//! │                                                                         │
//! │  ┌────────────┐   spawn()   ┌────────────┐                              │
//! │  │Disconnected│ ──────────► │ Connecting │──── first attempt fails ──►  │
//! │  └────────────┘             └─────┬──────┘     start() returns error    │
//! │                                   │ credentials ok, link up,            │
//! │                                   │ every topic resubscribed            │
//! │                                   ▼                                     │
//! │                             ┌────────────┐                              │
//! │            ┌──────────────► │ Connected  │                              │
//! │            │                └─────┬──────┘                              │
//! │            │                      │ link lost                           │
//! │            │                      ▼                                     │
//! │            │                ┌────────────┐  credentials unrecoverable   │
//! │            └─── success ─── │Reconnecting│ ───────────┐                 │
//! │                             └─────┬──────┘            ▼                 │
//! │                                   │ backoff    ┌────────────┐           │
//! │                                   └──(retry)   │Unauthorized│           │
//! │                                                └─────┬──────┘           │
//! │                                       resume() after │                  │
//! │                                       authenticate   └──► Reconnecting  │
//! │                                                                         │
//! │  Any state ── shutdown ──► Closed                                       │
//! │                                                                         │
//! │  BACKOFF: exponential, 10s doubling to a 60s cap, no jitter,            │
//! │  no attempt limit.                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantees
//!
//! - Topics are resubscribed on a new link before [`SessionEvent::Ready`] is
//!   emitted and before any message from that link is forwarded.
//! - Publishes issued while no link is up are queued and flushed, in order,
//!   right after resubscription. Publishes whose caller stopped waiting are
//!   dropped from the queue.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, BrokerConnector, BrokerEvent, BrokerLink, TransportError};
use crate::config::BrokerSettings;
use crate::credentials::CredentialStore;
use crate::error::{SyncError, SyncResult};
use crate::worker::WorkerPool;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

// =============================================================================
// Session State
// =============================================================================

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started yet.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Link up and all topics subscribed.
    Connected,
    /// Link lost; waiting out backoff or reconnecting.
    Reconnecting,
    /// Credentials could not be recovered. Waiting for `resume`.
    Unauthorized,
    /// Shut down. Terminal.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Unauthorized => write!(f, "unauthorized"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Event delivered to the session owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A link is up and every known topic is subscribed.
    Ready { reconnected: bool },
    /// Inbound message from the current link.
    Message { topic: String, payload: Vec<u8> },
    /// The current link was lost. Reconnection is already scheduled.
    Disconnected(String),
    /// Reconnection stopped because credentials were rejected.
    AuthenticationFailed(String),
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Reconnection tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Creates the exponential backoff configuration. Jitter is off so
    /// delays stay within `max_backoff`.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None, // No limit on total time
            ..Default::default()
        }
    }

    fn next_delay(&self, backoff: &mut ExponentialBackoff) -> Duration {
        backoff
            .next_backoff()
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

impl From<&BrokerSettings> for SessionConfig {
    fn from(settings: &BrokerSettings) -> Self {
        SessionConfig {
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
        }
    }
}

// =============================================================================
// Session Handle
// =============================================================================

enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Subscribe {
        topics: Vec<String>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Resume,
}

/// Handle for interacting with the session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Publishes on the current link, or queues until one is up.
    ///
    /// Completes once the broker client has accepted the message. Callers
    /// bound the wait with their own deadline.
    pub async fn publish(&self, topic: impl Into<String>, payload: Vec<u8>) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish {
            topic: topic.into(),
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::ClientClosed)?
    }

    /// Adds topics to the subscription set.
    ///
    /// Topics are subscribed on the current link right away and on every
    /// later link before it is reported ready.
    pub async fn subscribe(&self, topics: Vec<String>) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { topics, reply }).await?;
        rx.await.map_err(|_| SyncError::ClientClosed)?
    }

    /// Leaves the `Unauthorized` state and reconnects immediately.
    pub async fn resume(&self) -> SyncResult<()> {
        self.send(Command::Resume).await
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Triggers shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::ClientClosed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ClientClosed)
    }
}

// =============================================================================
// Transport Session
// =============================================================================

struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    reply: oneshot::Sender<SyncResult<()>>,
}

/// Why a connection attempt did not produce a link.
enum AttemptFailure {
    /// Credentials could not be recovered.
    Unauthorized(String),
    /// Worth retrying after backoff.
    Transient(SyncError),
    /// Client is shutting down.
    Closed,
}

/// How a stretch of waiting ended.
enum Wake {
    Elapsed,
    Resumed,
    Shutdown,
}

/// Everything the spawned session task owns.
///
/// ## Usage
/// ```rust,ignore
/// let (handle, mut events, first_attempt) = TransportSession::spawn(
///     connector, credentials, workers, SessionConfig::default(), shutdown,
/// );
/// first_attempt.await??;
/// handle.subscribe(upgw_core::shadow::subscription_topics(&device)).await?;
/// while let Some(event) = events.recv().await { /* ... */ }
/// ```
pub struct TransportSession {
    connector: Arc<dyn BrokerConnector>,
    credentials: Arc<CredentialStore>,
    workers: WorkerPool,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    events: mpsc::Sender<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    topics: Vec<String>,
    queued: VecDeque<QueuedPublish>,
}

impl TransportSession {
    /// Spawns the session task.
    ///
    /// Returns the handle, the event stream, and a receiver that reports the
    /// outcome of the first connection attempt. The task stops by itself if
    /// that attempt fails.
    pub fn spawn(
        connector: Arc<dyn BrokerConnector>,
        credentials: Arc<CredentialStore>,
        workers: WorkerPool,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> (
        SessionHandle,
        mpsc::Receiver<SessionEvent>,
        oneshot::Receiver<SyncResult<()>>,
    ) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (first_tx, first_rx) = oneshot::channel();

        let session = TransportSession {
            connector,
            credentials,
            workers,
            config,
            state: state_tx,
            events: events_tx,
            commands: commands_rx,
            shutdown: shutdown.clone(),
            topics: Vec::new(),
            queued: VecDeque::new(),
        };

        tokio::spawn(session.run(first_tx));

        let handle = SessionHandle {
            commands: commands_tx,
            state: state_rx,
            shutdown,
        };

        (handle, events_rx, first_rx)
    }

    /// Main session loop.
    async fn run(mut self, first_attempt: oneshot::Sender<SyncResult<()>>) {
        info!("Session starting");

        let mut first_attempt = Some(first_attempt);
        let mut backoff = self.config.create_backoff();
        let mut connected_before = false;

        loop {
            self.set_state(if connected_before {
                SessionState::Reconnecting
            } else {
                SessionState::Connecting
            });

            match self.connect().await {
                Ok(link) => {
                    backoff.reset();
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let BrokerLink { client, mut events } = link;

                    self.set_state(SessionState::Connected);
                    if !self
                        .emit(SessionEvent::Ready {
                            reconnected: connected_before,
                        })
                        .await
                    {
                        client.disconnect().await;
                        break;
                    }
                    connected_before = true;

                    match self.connection_loop(&*client, &mut events).await {
                        None => {
                            client.disconnect().await;
                            break;
                        }
                        Some(reason) => {
                            warn!(%reason, "Connection lost");
                            self.set_state(SessionState::Reconnecting);
                            if !self.emit(SessionEvent::Disconnected(reason)).await {
                                break;
                            }
                        }
                    }
                }
                Err(AttemptFailure::Closed) => break,
                Err(AttemptFailure::Unauthorized(reason)) => {
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(Err(SyncError::Authentication(reason)));
                        break;
                    }

                    error!(%reason, "Credentials rejected, reconnection stopped");
                    self.set_state(SessionState::Unauthorized);
                    self.fail_queued(|| SyncError::Authentication(reason.clone()));
                    if !self
                        .emit(SessionEvent::AuthenticationFailed(reason.clone()))
                        .await
                    {
                        break;
                    }

                    match self.idle(None, true).await {
                        Wake::Shutdown => break,
                        Wake::Elapsed | Wake::Resumed => {
                            info!("Resuming session");
                            backoff.reset();
                            continue;
                        }
                    }
                }
                Err(AttemptFailure::Transient(e)) => {
                    if let Some(tx) = first_attempt.take() {
                        let _ = tx.send(Err(e));
                        break;
                    }
                    warn!(error = %e, "Connection attempt failed");
                }
            }

            let delay = self.config.next_delay(&mut backoff);
            debug!(?delay, "Waiting before reconnect");
            match self.idle(Some(delay), false).await {
                Wake::Shutdown => break,
                Wake::Elapsed | Wake::Resumed => {}
            }
        }

        self.fail_queued(|| SyncError::ClientClosed);
        self.set_state(SessionState::Closed);
        info!("Session stopped");
    }

    /// Runs one connection attempt while still servicing commands.
    ///
    /// On success every known topic is subscribed and the publish queue is
    /// flushed on the new link.
    async fn connect(&mut self) -> Result<BrokerLink, AttemptFailure> {
        let known = self.topics.len();
        let attempt = establish(
            self.connector.clone(),
            self.credentials.clone(),
            self.workers.clone(),
            self.topics.clone(),
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(AttemptFailure::Closed),
                result = &mut attempt => {
                    let link = result?;
                    // Topics registered while the attempt was in flight
                    let added = self.topics[known..].to_vec();
                    if let Err(e) = self.subscribe_all(&*link.client, &added).await {
                        return Err(AttemptFailure::Transient(SyncError::Connection(e.to_string())));
                    }
                    if let Err(e) = self.flush_queued(&*link.client).await {
                        return Err(AttemptFailure::Transient(SyncError::Connection(e.to_string())));
                    }
                    return Ok(link);
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_offline(command, false),
                    None => return Err(AttemptFailure::Closed),
                },
            }
        }
    }

    /// Forwards traffic on a live link.
    ///
    /// Returns `None` on shutdown and `Some(reason)` when the link is lost.
    async fn connection_loop(
        &mut self,
        client: &dyn BrokerClient,
        events: &mut mpsc::Receiver<BrokerEvent>,
    ) -> Option<String> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, closing connection");
                    return None;
                }

                command = self.commands.recv() => match command {
                    None => return None,
                    Some(Command::Publish { topic, payload, reply }) => {
                        if reply.is_closed() {
                            continue;
                        }
                        debug!(%topic, bytes = payload.len(), "Publishing");
                        if let Err(e) = client.publish(&topic, payload.clone()).await {
                            self.queued.push_front(QueuedPublish { topic, payload, reply });
                            return Some(e.to_string());
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Subscribe { topics, reply }) => {
                        let added = self.add_topics(topics);
                        if let Err(e) = self.subscribe_all(client, &added).await {
                            let _ = reply.send(Ok(()));
                            return Some(e.to_string());
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Resume) => {}
                },

                event = events.recv() => match event {
                    Some(BrokerEvent::Message { topic, payload }) => {
                        if !self.emit(SessionEvent::Message { topic, payload }).await {
                            return None;
                        }
                    }
                    Some(BrokerEvent::Disconnected(reason)) => return Some(reason),
                    None => return Some("event stream ended".to_string()),
                },
            }
        }
    }

    /// Waits for `delay` (or indefinitely) while queuing commands.
    async fn idle(&mut self, delay: Option<Duration>, unauthorized: bool) -> Wake {
        let sleep = tokio::time::sleep(delay.unwrap_or_default());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Wake::Shutdown,
                _ = &mut sleep, if delay.is_some() => return Wake::Elapsed,
                command = self.commands.recv() => match command {
                    None => return Wake::Shutdown,
                    Some(Command::Resume) => return Wake::Resumed,
                    Some(command) => self.handle_offline(command, unauthorized),
                },
            }
        }
    }

    /// Handles a command while no link is up.
    fn handle_offline(&mut self, command: Command, unauthorized: bool) {
        match command {
            Command::Publish {
                topic,
                payload,
                reply,
            } => {
                if unauthorized {
                    let _ = reply.send(Err(SyncError::Authentication(
                        "session is unauthorized".into(),
                    )));
                } else {
                    debug!(%topic, queued = self.queued.len() + 1, "Queuing publish until connected");
                    self.queued.push_back(QueuedPublish {
                        topic,
                        payload,
                        reply,
                    });
                }
            }
            Command::Subscribe { topics, reply } => {
                self.add_topics(topics);
                let _ = reply.send(Ok(()));
            }
            Command::Resume => {}
        }
    }

    /// Adds new topics to the set and returns the ones not seen before.
    fn add_topics(&mut self, topics: Vec<String>) -> Vec<String> {
        let mut added = Vec::new();
        for topic in topics {
            if !self.topics.contains(&topic) {
                self.topics.push(topic.clone());
                added.push(topic);
            }
        }
        added
    }

    async fn subscribe_all(
        &self,
        client: &dyn BrokerClient,
        topics: &[String],
    ) -> Result<(), TransportError> {
        for topic in topics {
            client.subscribe(topic).await?;
        }
        if !topics.is_empty() {
            debug!(count = topics.len(), "Subscribed topics");
        }
        Ok(())
    }

    async fn flush_queued(&mut self, client: &dyn BrokerClient) -> Result<(), TransportError> {
        while let Some(item) = self.queued.pop_front() {
            if item.reply.is_closed() {
                continue;
            }
            if let Err(e) = client.publish(&item.topic, item.payload.clone()).await {
                self.queued.push_front(item);
                return Err(e);
            }
            let _ = item.reply.send(Ok(()));
        }
        Ok(())
    }

    fn fail_queued(&mut self, error: impl Fn() -> SyncError) {
        for item in self.queued.drain(..) {
            let _ = item.reply.send(Err(error()));
        }
    }

    /// Returns false if the owner is gone.
    async fn emit(&self, event: SessionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Session state changed");
        }
    }

}

/// Obtains valid credentials, opens a link and subscribes `topics` on it.
///
/// A credential rejection by the broker invalidates the cached credentials
/// and retries once with fresh ones.
async fn establish(
    connector: Arc<dyn BrokerConnector>,
    credentials: Arc<CredentialStore>,
    workers: WorkerPool,
    topics: Vec<String>,
) -> Result<BrokerLink, AttemptFailure> {
    let mut revalidated = false;

    loop {
        let current = credentials.ensure_valid().await.map_err(|e| match e {
            SyncError::Authentication(reason) => AttemptFailure::Unauthorized(reason),
            SyncError::ClientClosed => AttemptFailure::Closed,
            other => AttemptFailure::Transient(other),
        })?;

        let connector = connector.clone();
        let outcome = workers
            .run(async move { connector.connect(&current).await })
            .await
            .map_err(|e| match e {
                SyncError::ClientClosed => AttemptFailure::Closed,
                other => AttemptFailure::Transient(other),
            })?;

        match outcome {
            Ok(link) => {
                for topic in &topics {
                    link.client.subscribe(topic).await.map_err(|e| {
                        AttemptFailure::Transient(SyncError::Connection(e.to_string()))
                    })?;
                }
                if !topics.is_empty() {
                    debug!(count = topics.len(), "Resubscribed topics");
                }
                return Ok(link);
            }
            Err(TransportError::Rejected(reason)) if !revalidated => {
                warn!(%reason, "Broker rejected credentials, revalidating");
                credentials.invalidate().await;
                revalidated = true;
            }
            Err(e) => return Err(AttemptFailure::Transient(SyncError::Connection(e.to_string()))),
        }
    }
}
