//! # Pending Requests
//!
//! Correlates published shadow requests with their acknowledgements.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PendingRequestTable<K, V>                          │
//! │                                                                         │
//! │  register(key, token, timeout) ──► PendingHandle ──► wait()            │
//! │        │                                                 ▲              │
//! │        │ same key already present:                       │              │
//! │        │   old waiter ◄── Superseded                     │              │
//! │        ▼                                                 │              │
//! │  ┌──────────────────────────────┐                        │              │
//! │  │ key → { id, token, deadline }│── resolve_token ───────┤ Ok(V)        │
//! │  │                              │── reject_token ────────┤ Rejected     │
//! │  │                              │── expire(now) ─────────┤ Timeout      │
//! │  │                              │── fail_all ────────────┘ ClientClosed │
//! │  └──────────────────────────────┘                                       │
//! │        ▲                                                                │
//! │        └── cancel(key, id) ◄── handle dropped before completion         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The table is owned by a single task. Handles talk back to it only
//! through the cancellation channel returned by [`PendingRequestTable::new`].

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use upgw_core::{Attribute, DeviceId};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Correlation Key
// =============================================================================

/// What a request asked for.
///
/// Gets carry their request id, so concurrent gets for one device never
/// share a key. Updates are keyed by attribute only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Get(Uuid),
    Update(Attribute),
}

/// Device plus command kind. At most one request per key is outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub device: DeviceId,
    pub command: CommandKind,
}

impl CorrelationKey {
    pub fn get(device: DeviceId, request: Uuid) -> Self {
        CorrelationKey {
            device,
            command: CommandKind::Get(request),
        }
    }

    pub fn is_get_for(&self, device: &DeviceId) -> bool {
        matches!(self.command, CommandKind::Get(_)) && self.device == *device
    }

    pub fn update(device: DeviceId, attribute: Attribute) -> Self {
        CorrelationKey {
            device,
            command: CommandKind::Update(attribute),
        }
    }
}

impl Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.command {
            CommandKind::Get(_) => write!(f, "{}/get", self.device),
            CommandKind::Update(attribute) => write!(f, "{}/update:{}", self.device, attribute),
        }
    }
}

// =============================================================================
// Table
// =============================================================================

struct Entry<V> {
    id: u64,
    token: String,
    deadline: Instant,
    timeout: Duration,
    tx: oneshot::Sender<SyncResult<V>>,
}

/// Outstanding requests keyed by `K`, each completed exactly once.
pub struct PendingRequestTable<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_id: u64,
    cancel: mpsc::UnboundedSender<(K, u64)>,
}

impl<K, V> PendingRequestTable<K, V>
where
    K: Hash + Eq + Clone + Display + Send + 'static,
{
    /// Creates the table and the receiver its handles report cancellations on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(K, u64)>) {
        let (cancel, cancelled) = mpsc::unbounded_channel();
        let table = PendingRequestTable {
            entries: HashMap::new(),
            next_id: 0,
            cancel,
        };
        (table, cancelled)
    }

    /// Installs a request. An existing request under the same key fails
    /// with [`SyncError::Superseded`].
    pub fn register(
        &mut self,
        key: K,
        token: impl Into<String>,
        timeout: Duration,
    ) -> PendingHandle<K, V> {
        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = oneshot::channel();

        let entry = Entry {
            id,
            token: token.into(),
            deadline: Instant::now() + timeout,
            timeout,
            tx,
        };

        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            debug!(%key, "Superseding pending request");
            let _ = previous.tx.send(Err(SyncError::Superseded {
                key: key.to_string(),
            }));
        }

        PendingHandle {
            key,
            id,
            rx,
            cancel: self.cancel.clone(),
            done: false,
        }
    }

    /// Completes the request under `key`. Returns false if there is none.
    pub fn resolve(&mut self, key: &K, value: V) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Completes every request whose key matches.
    pub fn resolve_matching(&mut self, matches: impl Fn(&K) -> bool, value: V) -> Vec<K>
    where
        V: Clone,
    {
        let keys: Vec<K> = self.entries.keys().filter(|key| matches(key)).cloned().collect();
        for key in &keys {
            self.resolve(key, value.clone());
        }
        keys
    }

    /// Completes the request that was published with `token`.
    pub fn resolve_token(&mut self, token: &str, value: V) -> Option<K> {
        let key = self.key_for_token(token)?;
        self.resolve(&key, value);
        Some(key)
    }

    /// Fails the request that was published with `token`.
    pub fn reject_token(&mut self, token: &str, error: SyncError) -> Option<K> {
        let key = self.key_for_token(token)?;
        if let Some(entry) = self.entries.remove(&key) {
            let _ = entry.tx.send(Err(error));
        }
        Some(key)
    }

    /// Fails every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = self.entries.remove(key) {
                debug!(%key, "Pending request timed out");
                let _ = entry
                    .tx
                    .send(Err(SyncError::timeout(key.to_string(), entry.timeout)));
            }
        }
        expired
    }

    /// Earliest deadline among outstanding requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Removes the entry if it still belongs to the handle that sent `id`.
    pub fn cancel(&mut self, key: &K, id: u64) -> bool {
        if self.entries.get(key).is_some_and(|entry| entry.id == id) {
            self.entries.remove(key);
            debug!(%key, "Pending request cancelled");
            return true;
        }
        false
    }

    /// Fails every outstanding request.
    pub fn fail_all(&mut self, error: impl Fn() -> SyncError) {
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn key_for_token(&self, token: &str) -> Option<K> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.token == token)
            .map(|(key, _)| key.clone())
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Waiter side of one registered request.
///
/// Dropping the handle before it completes removes the entry from the table.
pub struct PendingHandle<K: Clone + Send + 'static, V> {
    key: K,
    id: u64,
    rx: oneshot::Receiver<SyncResult<V>>,
    cancel: mpsc::UnboundedSender<(K, u64)>,
    done: bool,
}

impl<K: Clone + Send + 'static, V> PendingHandle<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Waits for the outcome. The table enforces the deadline.
    pub async fn wait(mut self) -> SyncResult<V> {
        let result = (&mut self.rx).await;
        self.done = true;
        result.unwrap_or(Err(SyncError::ClientClosed))
    }
}

impl<K: Clone + Send + 'static, V> Drop for PendingHandle<K, V> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.cancel.send((self.key.clone(), self.id));
        }
    }
}
