//! # Domain Types
//!
//! Gateways, devices and their attribute bags.
//!
//! ## Entity Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Arena of Entities by Id                           │
//! │                                                                         │
//! │   GatewaySnapshot ─── children: [DeviceId, DeviceId, ...]              │
//! │         ▲                               │                               │
//! │         │ gateway_id (lookup only)      ▼                               │
//! │         └──────────────────────── DeviceSnapshot                       │
//! │                                         │                               │
//! │                                         ▼                               │
//! │                                   AttributeBag                          │
//! │                          { Attribute → AttributeValue }                 │
//! │                                                                         │
//! │  A missing key means "unknown". Deltas merge, snapshots replace.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Device code, which doubles as the shadow thing name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(code: impl Into<String>) -> Self {
        DeviceId(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(code: &str) -> Self {
        DeviceId::new(code)
    }
}

impl From<String> for DeviceId {
    fn from(code: String) -> Self {
        DeviceId(code)
    }
}

// =============================================================================
// Enumerations
// =============================================================================

/// Closed set of device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Smart radiator thermostat.
    Thermostat,
    /// The gateway itself, addressed as a device.
    Gateway,
    /// Anything the service lists that this client does not model yet.
    Unknown,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Thermostat => write!(f, "thermostat"),
            DeviceKind::Gateway => write!(f, "gateway"),
            DeviceKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// HVAC system mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Off,
    Heat,
}

impl SystemMode {
    /// Wire code used in the shadow document.
    pub fn code(self) -> i64 {
        match self {
            SystemMode::Off => 0,
            SystemMode::Heat => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SystemMode::Off),
            4 => Some(SystemMode::Heat),
            _ => None,
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemMode::Off => write!(f, "off"),
            SystemMode::Heat => write!(f, "heat"),
        }
    }
}

impl FromStr for SystemMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(SystemMode::Off),
            "heat" => Ok(SystemMode::Heat),
            other => Err(format!(
                "Unknown system mode: '{}'. Valid options: off, heat",
                other
            )),
        }
    }
}

/// HVAC running state (what the valve is doing right now).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningState {
    Idle,
    Heating,
}

impl RunningState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RunningState::Idle),
            1 => Some(RunningState::Heating),
            _ => None,
        }
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningState::Idle => write!(f, "idle"),
            RunningState::Heating => write!(f, "heating"),
        }
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// Name of a cached device attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    TargetTemperature,
    CurrentTemperature,
    MinTemperature,
    MaxTemperature,
    SystemMode,
    RunningState,
    Available,
    FirmwareVersion,
    SerialNumber,
    Manufacturer,
}

impl Attribute {
    pub const ALL: [Attribute; 10] = [
        Attribute::TargetTemperature,
        Attribute::CurrentTemperature,
        Attribute::MinTemperature,
        Attribute::MaxTemperature,
        Attribute::SystemMode,
        Attribute::RunningState,
        Attribute::Available,
        Attribute::FirmwareVersion,
        Attribute::SerialNumber,
        Attribute::Manufacturer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::TargetTemperature => "target_temperature",
            Attribute::CurrentTemperature => "current_temperature",
            Attribute::MinTemperature => "min_temperature",
            Attribute::MaxTemperature => "max_temperature",
            Attribute::SystemMode => "system_mode",
            Attribute::RunningState => "running_state",
            Attribute::Available => "available",
            Attribute::FirmwareVersion => "firmware_version",
            Attribute::SerialNumber => "serial_number",
            Attribute::Manufacturer => "manufacturer",
        }
    }

    /// Attributes the cloud accepts in a desired-state update.
    pub fn is_writable(self) -> bool {
        matches!(self, Attribute::TargetTemperature | Attribute::SystemMode)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Attribute::ALL
            .into_iter()
            .find(|attr| attr.as_str() == s)
            .ok_or_else(|| format!("Unknown attribute: '{}'", s))
    }
}

/// Value of a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Degrees Celsius.
    Temperature(f64),
    Mode(SystemMode),
    State(RunningState),
    Flag(bool),
    Text(String),
}

impl AttributeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Temperature(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<SystemMode> for AttributeValue {
    fn from(mode: SystemMode) -> Self {
        AttributeValue::Mode(mode)
    }
}

/// A set of attribute values, keyed by name.
pub type AttributeMap = BTreeMap<Attribute, AttributeValue>;

/// Names of the attributes changed by one application of an update.
pub type ChangeSet = BTreeSet<Attribute>;

/// The mutable attribute state of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeBag {
    values: AttributeMap,
}

impl AttributeBag {
    pub fn from_map(values: AttributeMap) -> Self {
        AttributeBag { values }
    }

    pub fn get(&self, attribute: Attribute) -> Option<&AttributeValue> {
        self.values.get(&attribute)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Attribute, &AttributeValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merges `delta` into the bag.
    ///
    /// Keys absent from the delta are left untouched. Returns the keys whose
    /// value actually changed, so an echo of the current state is an empty set.
    pub fn merge(&mut self, delta: &AttributeMap) -> ChangeSet {
        let mut changed = ChangeSet::new();
        for (attribute, value) in delta {
            if self.values.get(attribute) != Some(value) {
                self.values.insert(*attribute, value.clone());
                changed.insert(*attribute);
            }
        }
        changed
    }

    /// Replaces the whole bag with `full`.
    ///
    /// Keys missing from `full` become unknown and count as changed.
    pub fn replace(&mut self, full: AttributeMap) -> ChangeSet {
        let mut changed: ChangeSet = self
            .values
            .keys()
            .filter(|attribute| !full.contains_key(attribute))
            .copied()
            .collect();
        for (attribute, value) in &full {
            if self.values.get(attribute) != Some(value) {
                changed.insert(*attribute);
            }
        }
        self.values = full;
        changed
    }

    pub fn target_temperature(&self) -> Option<f64> {
        self.get(Attribute::TargetTemperature).and_then(AttributeValue::as_f64)
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.get(Attribute::CurrentTemperature).and_then(AttributeValue::as_f64)
    }

    pub fn min_temperature(&self) -> Option<f64> {
        self.get(Attribute::MinTemperature).and_then(AttributeValue::as_f64)
    }

    pub fn max_temperature(&self) -> Option<f64> {
        self.get(Attribute::MaxTemperature).and_then(AttributeValue::as_f64)
    }

    pub fn system_mode(&self) -> Option<SystemMode> {
        match self.get(Attribute::SystemMode) {
            Some(AttributeValue::Mode(mode)) => Some(*mode),
            _ => None,
        }
    }

    pub fn running_state(&self) -> Option<RunningState> {
        match self.get(Attribute::RunningState) {
            Some(AttributeValue::State(state)) => Some(*state),
            _ => None,
        }
    }

    /// False until the device has been seen over a live connection.
    pub fn available(&self) -> bool {
        self.get(Attribute::Available)
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false)
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.get(Attribute::FirmwareVersion).and_then(AttributeValue::as_str)
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.get(Attribute::SerialNumber).and_then(AttributeValue::as_str)
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.get(Attribute::Manufacturer).and_then(AttributeValue::as_str)
    }
}

// =============================================================================
// Static Device Information
// =============================================================================

/// Occupant (account) that owns a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupant {
    pub id: Uuid,
    /// Federated identity of the occupant.
    pub identity_id: String,
}

/// Descriptive, rarely-changing information about a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub id: DeviceId,
    /// Id assigned by the vendor service API.
    pub service_id: Option<Uuid>,
    pub name: String,
    pub model: String,
    pub occupant: Option<Occupant>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
}

impl GatewayInfo {
    /// Minimal record for a gateway first seen without directory data.
    pub fn unnamed(id: DeviceId) -> Self {
        GatewayInfo {
            name: id.to_string(),
            id,
            service_id: None,
            model: String::new(),
            occupant: None,
            ip_address: None,
            mac_address: None,
        }
    }
}

/// Descriptive information about a device behind a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub service_id: Option<Uuid>,
    pub kind: DeviceKind,
    pub name: String,
    pub model: String,
}

impl DeviceInfo {
    pub fn thermostat(id: DeviceId, name: impl Into<String>) -> Self {
        DeviceInfo {
            id,
            service_id: None,
            kind: DeviceKind::Thermostat,
            name: name.into(),
            model: String::new(),
        }
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Immutable view of a gateway at the time of the read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub info: GatewayInfo,
    /// Child device ids in directory order.
    pub children: Vec<DeviceId>,
    pub attributes: AttributeBag,
}

impl GatewaySnapshot {
    pub fn id(&self) -> &DeviceId {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

/// Immutable view of a device at the time of the read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub info: DeviceInfo,
    /// Back-reference to the owning gateway.
    pub gateway_id: DeviceId,
    pub attributes: AttributeBag,
}

impl DeviceSnapshot {
    pub fn id(&self) -> &DeviceId {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.info.kind
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp(v: f64) -> AttributeValue {
        AttributeValue::Temperature(v)
    }

    #[test]
    fn test_merge_is_last_value_wins() {
        let mut bag = AttributeBag::default();
        let deltas = [
            AttributeMap::from([
                (Attribute::TargetTemperature, temp(18.0)),
                (Attribute::CurrentTemperature, temp(17.5)),
            ]),
            AttributeMap::from([(Attribute::TargetTemperature, temp(19.0))]),
            AttributeMap::from([(Attribute::SystemMode, SystemMode::Heat.into())]),
            AttributeMap::from([(Attribute::TargetTemperature, temp(21.0))]),
        ];

        for delta in &deltas {
            bag.merge(delta);
        }

        assert_eq!(bag.target_temperature(), Some(21.0));
        assert_eq!(bag.current_temperature(), Some(17.5));
        assert_eq!(bag.system_mode(), Some(SystemMode::Heat));
        assert_eq!(bag.len(), 3);
    }

    #[test]
    fn test_merge_reports_only_changed_keys() {
        let mut bag = AttributeBag::from_map(AttributeMap::from([
            (Attribute::TargetTemperature, temp(18.0)),
            (Attribute::CurrentTemperature, temp(17.5)),
        ]));

        let changed = bag.merge(&AttributeMap::from([
            (Attribute::TargetTemperature, temp(18.0)),
            (Attribute::CurrentTemperature, temp(17.0)),
        ]));
        assert_eq!(changed, ChangeSet::from([Attribute::CurrentTemperature]));

        let echo = bag.merge(&AttributeMap::from([(
            Attribute::CurrentTemperature,
            temp(17.0),
        )]));
        assert!(echo.is_empty());
    }

    #[test]
    fn test_replace_marks_dropped_keys_changed() {
        let mut bag = AttributeBag::from_map(AttributeMap::from([
            (Attribute::TargetTemperature, temp(18.0)),
            (Attribute::RunningState, AttributeValue::State(RunningState::Idle)),
        ]));

        let changed = bag.replace(AttributeMap::from([(
            Attribute::TargetTemperature,
            temp(18.0),
        )]));

        assert_eq!(changed, ChangeSet::from([Attribute::RunningState]));
        assert_eq!(bag.running_state(), None);
    }

    #[test]
    fn test_attribute_names_round_trip() {
        for attribute in Attribute::ALL {
            assert_eq!(attribute.as_str().parse::<Attribute>(), Ok(attribute));
        }
        assert!("volume".parse::<Attribute>().is_err());
    }

    #[test]
    fn test_system_mode_codes() {
        assert_eq!(SystemMode::from_code(4), Some(SystemMode::Heat));
        assert_eq!(SystemMode::from_code(0), Some(SystemMode::Off));
        assert_eq!(SystemMode::from_code(3), None);
        assert_eq!("HEAT".parse::<SystemMode>(), Ok(SystemMode::Heat));
    }

    #[test]
    fn test_available_defaults_to_false() {
        let bag = AttributeBag::default();
        assert!(!bag.available());
    }
}
