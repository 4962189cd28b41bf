//! # Device Registry
//!
//! In-memory mirror of every gateway and device the client knows about.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DeviceRegistry                                  │
//! │                                                                         │
//! │  gateway_order: [GW1, GW2]                                              │
//! │                                                                         │
//! │  gateways                          devices                              │
//! │  ┌─────────────────────────┐      ┌──────────────────────────────────┐ │
//! │  │ GW1 → info              │      │ T1 → info, gateway_id: GW1, bag  │ │
//! │  │       children: [T1,T2] │─────►│ T2 → info, gateway_id: GW1, bag  │ │
//! │  │       bag               │      │ T3 → info, gateway_id: GW2, bag  │ │
//! │  └─────────────────────────┘      └──────────────────────────────────┘ │
//! │                                                                         │
//! │  Children are referenced by id only. Entries are created on first      │
//! │  sight, updated in place and never removed during a session.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the client's processing loop mutates the registry. Readers take a
//! short read lock and copy out a snapshot.

use std::collections::HashMap;
use tracing::{debug, warn};

use upgw_core::{
    Attribute, AttributeBag, AttributeMap, AttributeValue, ChangeSet, DeviceId, DeviceInfo,
    DeviceSnapshot, GatewayInfo, GatewaySnapshot,
};

struct GatewayEntry {
    info: GatewayInfo,
    children: Vec<DeviceId>,
    attributes: AttributeBag,
}

struct DeviceEntry {
    info: DeviceInfo,
    gateway_id: DeviceId,
    attributes: AttributeBag,
}

/// Arena of gateways and devices keyed by id.
#[derive(Default)]
pub struct DeviceRegistry {
    gateways: HashMap<DeviceId, GatewayEntry>,
    gateway_order: Vec<DeviceId>,
    devices: HashMap<DeviceId, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Inserts a gateway and its devices, or updates them in place.
    ///
    /// Returns the ids of devices that were not known before.
    pub fn insert_gateway(&mut self, info: GatewayInfo, devices: Vec<DeviceInfo>) -> Vec<DeviceId> {
        let gateway_id = info.id.clone();

        match self.gateways.get_mut(&gateway_id) {
            Some(entry) => entry.info = info,
            None => {
                debug!(gateway = %gateway_id, "Registering gateway");
                self.gateways.insert(
                    gateway_id.clone(),
                    GatewayEntry {
                        info,
                        children: Vec::new(),
                        attributes: AttributeBag::default(),
                    },
                );
                self.gateway_order.push(gateway_id.clone());
            }
        }

        let mut added = Vec::new();
        for device in devices {
            let device_id = device.id.clone();
            match self.devices.get_mut(&device_id) {
                Some(entry) => {
                    entry.info = device;
                    entry.gateway_id = gateway_id.clone();
                }
                None => {
                    debug!(gateway = %gateway_id, device = %device_id, "Registering device");
                    self.devices.insert(
                        device_id.clone(),
                        DeviceEntry {
                            info: device,
                            gateway_id: gateway_id.clone(),
                            attributes: AttributeBag::default(),
                        },
                    );
                    added.push(device_id.clone());
                }
            }

            if let Some(gateway) = self.gateways.get_mut(&gateway_id) {
                if !gateway.children.contains(&device_id) {
                    gateway.children.push(device_id);
                }
            }
        }
        added
    }

    // =========================================================================
    // State Application
    // =========================================================================

    /// Applies a full reported state and marks the device available.
    ///
    /// Attributes missing from `full` become unknown. Returns `None` for an
    /// unknown id.
    ///
    /// A device snapshot also marks its gateway available.
    pub fn apply_snapshot(&mut self, id: &DeviceId, mut full: AttributeMap) -> Option<ChangeSet> {
        full.insert(Attribute::Available, AttributeValue::Flag(true));

        if let Some(gateway_id) = self.devices.get(id).map(|entry| entry.gateway_id.clone()) {
            if let Some(gateway) = self.gateways.get_mut(&gateway_id) {
                gateway.attributes.merge(&available(true));
            }
        }

        match self.bag_mut(id) {
            Some(bag) => Some(bag.replace(full)),
            None => {
                warn!(device = %id, "Ignoring snapshot for unknown device");
                None
            }
        }
    }

    /// Merges a partial state. Returns `None` for an unknown id.
    pub fn apply_delta(&mut self, id: &DeviceId, delta: &AttributeMap) -> Option<ChangeSet> {
        match self.bag_mut(id) {
            Some(bag) => Some(bag.merge(delta)),
            None => {
                warn!(device = %id, "Ignoring delta for unknown device");
                None
            }
        }
    }

    /// Flags every device unavailable and returns those that changed.
    pub fn mark_all_unavailable(&mut self) -> Vec<(DeviceId, ChangeSet)> {
        let delta = available(false);

        let mut changed = Vec::new();
        for (id, entry) in self.devices.iter_mut() {
            let set = entry.attributes.merge(&delta);
            if !set.is_empty() {
                changed.push((id.clone(), set));
            }
        }
        for (id, entry) in self.gateways.iter_mut() {
            entry.attributes.merge(&delta);
            debug!(gateway = %id, "Gateway marked unavailable");
        }
        changed
    }

    fn bag_mut(&mut self, id: &DeviceId) -> Option<&mut AttributeBag> {
        if let Some(entry) = self.devices.get_mut(id) {
            return Some(&mut entry.attributes);
        }
        self.gateways.get_mut(id).map(|entry| &mut entry.attributes)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn device(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.devices.get(id).map(|entry| DeviceSnapshot {
            info: entry.info.clone(),
            gateway_id: entry.gateway_id.clone(),
            attributes: entry.attributes.clone(),
        })
    }

    pub fn gateway(&self, id: &DeviceId) -> Option<GatewaySnapshot> {
        self.gateways.get(id).map(|entry| GatewaySnapshot {
            info: entry.info.clone(),
            children: entry.children.clone(),
            attributes: entry.attributes.clone(),
        })
    }

    /// Gateways in registration order.
    pub fn get_gateways(&self) -> Vec<GatewaySnapshot> {
        self.gateway_order
            .iter()
            .filter_map(|id| self.gateway(id))
            .collect()
    }

    /// Every device paired with its gateway, in gateway then child order.
    pub fn get_devices(&self) -> Vec<(GatewaySnapshot, DeviceSnapshot)> {
        let mut pairs = Vec::with_capacity(self.devices.len());
        for gateway in self.get_gateways() {
            for child in &gateway.children {
                if let Some(device) = self.device(child) {
                    pairs.push((gateway.clone(), device));
                }
            }
        }
        pairs
    }

    /// Ids of every device in gateway then child order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.gateway_order
            .iter()
            .filter_map(|id| self.gateways.get(id))
            .flat_map(|gateway| gateway.children.iter().cloned())
            .collect()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn available(flag: bool) -> AttributeMap {
    let mut delta = AttributeMap::new();
    delta.insert(Attribute::Available, AttributeValue::Flag(flag));
    delta
}
