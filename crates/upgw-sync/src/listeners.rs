//! # Device Listeners
//!
//! Per-device change callbacks.
//!
//! A listener runs on the client's processing loop, once per applied update
//! that changed at least one attribute. A panicking listener is logged and
//! does not stop the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::warn;

use upgw_core::{ChangeSet, DeviceId, DeviceSnapshot};

/// Receives a device snapshot together with the attributes that changed.
pub trait DeviceListener: Send + Sync {
    fn on_update(&self, device: &DeviceSnapshot, changed: &ChangeSet);
}

impl<F> DeviceListener for F
where
    F: Fn(&DeviceSnapshot, &ChangeSet) + Send + Sync,
{
    fn on_update(&self, device: &DeviceSnapshot, changed: &ChangeSet) {
        self(device, changed)
    }
}

/// Handle returned by [`ListenerRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Inner {
    next_id: u64,
    listeners: HashMap<DeviceId, Vec<(SubscriptionId, Arc<dyn DeviceListener>)>>,
}

/// Listeners keyed by device.
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<Inner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, device: DeviceId, listener: Arc<dyn DeviceListener>) -> SubscriptionId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.listeners.entry(device).or_default().push((id, listener));
        id
    }

    /// Returns false if the subscription was not found.
    pub fn unsubscribe(&self, device: &DeviceId, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.listeners.get_mut(device) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.listeners.remove(device);
        }
        removed
    }

    /// Calls every listener of the device in subscription order.
    pub fn dispatch(&self, device: &DeviceSnapshot, changed: &ChangeSet) {
        if changed.is_empty() {
            return;
        }

        // Listeners may subscribe or unsubscribe from inside the callback
        let listeners: Vec<(SubscriptionId, Arc<dyn DeviceListener>)> = self
            .lock()
            .listeners
            .get(device.id())
            .cloned()
            .unwrap_or_default();

        for (id, listener) in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_update(device, changed)));
            if result.is_err() {
                warn!(device = %device.id(), subscription = id.0, "Device listener panicked");
            }
        }
    }

    pub fn count(&self, device: &DeviceId) -> usize {
        self.lock().listeners.get(device).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
