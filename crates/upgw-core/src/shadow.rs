//! # Shadow Document Codec
//!
//! Topic naming and JSON encode/decode for the cloud device shadow.
//!
//! ## Topic Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  $aws/things/{thing}/shadow/...                         │
//! │                                                                         │
//! │   publish:     get                 update                               │
//! │   subscribe:   get/accepted        update/accepted                      │
//! │                get/rejected        update/rejected                      │
//! │                                                                         │
//! │   get/accepted     → full snapshot of state.reported                    │
//! │   update/accepted  → partial state (desired echo and/or reported delta) │
//! │   */rejected       → { code, message, clientToken }                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Property Keys
//!
//! Thermostat properties live under `state.{reported,desired}["11"].properties`.
//! Temperatures travel as integer hundredths of a degree.
//!
//! | Attribute            | Reported key                          | Desired key                            |
//! |----------------------|---------------------------------------|----------------------------------------|
//! | target_temperature   | `ep1:sTherS:HeatingSetpoint_x100`     | `ep1:sTherS:SetHeatingSetpoint_x100`   |
//! | current_temperature  | `ep1:sTherS:LocalTemperature_x100`    |                                        |
//! | min_temperature      | `ep1:sTherS:MinHeatSetpoint_x100`     |                                        |
//! | max_temperature      | `ep1:sTherS:MaxHeatSetpoint_x100`     |                                        |
//! | system_mode          | `ep1:sTherS:RunningMode`              | `ep1:sTherS:SetSystemMode`             |
//! | running_state        | `ep1:sTherS:RunningState`             |                                        |
//! | serial_number        | `ep1:sPowerMS:RadSerialNum`           |                                        |
//! | manufacturer         | `ep1:sBasicS:ManufactureName`         |                                        |
//! | firmware_version     | `ep1:sZDO:FirmwareVersion`            |                                        |

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::{DecodeError, DecodeResult};
use crate::types::{Attribute, AttributeMap, AttributeValue, DeviceId, RunningState, SystemMode};

const TOPIC_PREFIX: &str = "$aws/things/";
const SHADOW_SEGMENT: &str = "shadow";
const ENDPOINT_KEY: &str = "11";
const PROPERTIES_KEY: &str = "properties";

const REPORTED_KEYS: [(&str, Attribute); 9] = [
    ("ep1:sTherS:HeatingSetpoint_x100", Attribute::TargetTemperature),
    ("ep1:sTherS:LocalTemperature_x100", Attribute::CurrentTemperature),
    ("ep1:sTherS:MinHeatSetpoint_x100", Attribute::MinTemperature),
    ("ep1:sTherS:MaxHeatSetpoint_x100", Attribute::MaxTemperature),
    ("ep1:sTherS:RunningMode", Attribute::SystemMode),
    ("ep1:sTherS:RunningState", Attribute::RunningState),
    ("ep1:sPowerMS:RadSerialNum", Attribute::SerialNumber),
    ("ep1:sBasicS:ManufactureName", Attribute::Manufacturer),
    ("ep1:sZDO:FirmwareVersion", Attribute::FirmwareVersion),
];

const DESIRED_KEYS: [(&str, Attribute); 2] = [
    ("ep1:sTherS:SetHeatingSetpoint_x100", Attribute::TargetTemperature),
    ("ep1:sTherS:SetSystemMode", Attribute::SystemMode),
];

// =============================================================================
// Topics
// =============================================================================

/// Shadow operation a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowCommand {
    Get,
    Update,
}

impl ShadowCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ShadowCommand::Get => "get",
            ShadowCommand::Update => "update",
        }
    }
}

/// Result half of a response topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowOutcome {
    Accepted,
    Rejected,
}

impl ShadowOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ShadowOutcome::Accepted => "accepted",
            ShadowOutcome::Rejected => "rejected",
        }
    }
}

/// A parsed shadow topic.
///
/// `outcome` is `None` for the request topics the client publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShadowTopic {
    pub thing: DeviceId,
    pub command: ShadowCommand,
    pub outcome: Option<ShadowOutcome>,
}

impl ShadowTopic {
    pub fn request(thing: DeviceId, command: ShadowCommand) -> Self {
        ShadowTopic {
            thing,
            command,
            outcome: None,
        }
    }

    pub fn response(thing: DeviceId, command: ShadowCommand, outcome: ShadowOutcome) -> Self {
        ShadowTopic {
            thing,
            command,
            outcome: Some(outcome),
        }
    }

    /// Parses `$aws/things/{thing}/shadow/{get|update}[/{accepted|rejected}]`.
    pub fn parse(topic: &str) -> DecodeResult<Self> {
        let unrecognized = || DecodeError::UnrecognizedTopic(topic.to_string());

        let rest = topic.strip_prefix(TOPIC_PREFIX).ok_or_else(unrecognized)?;
        let mut parts = rest.split('/');

        let thing = parts.next().filter(|t| !t.is_empty()).ok_or_else(unrecognized)?;
        if parts.next() != Some(SHADOW_SEGMENT) {
            return Err(unrecognized());
        }
        let command = match parts.next() {
            Some("get") => ShadowCommand::Get,
            Some("update") => ShadowCommand::Update,
            _ => return Err(unrecognized()),
        };
        let outcome = match parts.next() {
            None => None,
            Some("accepted") => Some(ShadowOutcome::Accepted),
            Some("rejected") => Some(ShadowOutcome::Rejected),
            Some(_) => return Err(unrecognized()),
        };
        if parts.next().is_some() {
            return Err(unrecognized());
        }

        Ok(ShadowTopic {
            thing: DeviceId::new(thing),
            command,
            outcome,
        })
    }
}

impl fmt::Display for ShadowTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}",
            TOPIC_PREFIX,
            self.thing,
            SHADOW_SEGMENT,
            self.command.as_str()
        )?;
        if let Some(outcome) = self.outcome {
            write!(f, "/{}", outcome.as_str())?;
        }
        Ok(())
    }
}

/// The four response topics a client must subscribe to for one device.
pub fn subscription_topics(thing: &DeviceId) -> Vec<String> {
    let mut topics = Vec::with_capacity(4);
    for command in [ShadowCommand::Get, ShadowCommand::Update] {
        for outcome in [ShadowOutcome::Accepted, ShadowOutcome::Rejected] {
            topics.push(ShadowTopic::response(thing.clone(), command, outcome).to_string());
        }
    }
    topics
}

// =============================================================================
// Decoding
// =============================================================================

/// A property that was present but could not be interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedValue {
    pub key: String,
    pub value: Value,
}

/// Attributes extracted from one side (reported or desired) of a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedState {
    pub attributes: AttributeMap,
    /// Properties dropped because their value had the wrong shape.
    pub skipped: Vec<SkippedValue>,
}

/// Body of a `*/accepted` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptedDocument {
    pub reported: Option<DecodedState>,
    pub desired: Option<DecodedState>,
    pub version: Option<u64>,
    /// When the service produced the document.
    pub timestamp: Option<DateTime<Utc>>,
    pub client_token: Option<String>,
}

/// Body of a `*/rejected` message.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedDocument {
    pub code: i64,
    pub message: String,
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShadowResponse {
    Accepted(AcceptedDocument),
    Rejected(RejectedDocument),
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowMessage {
    pub thing: DeviceId,
    pub command: ShadowCommand,
    pub response: ShadowResponse,
}

impl ShadowMessage {
    pub fn client_token(&self) -> Option<&str> {
        match &self.response {
            ShadowResponse::Accepted(doc) => doc.client_token.as_deref(),
            ShadowResponse::Rejected(doc) => doc.client_token.as_deref(),
        }
    }
}

#[derive(Deserialize)]
struct RawAccepted {
    #[serde(default)]
    state: RawState,
    version: Option<u64>,
    timestamp: Option<i64>,
    #[serde(rename = "clientToken")]
    client_token: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawState {
    reported: Option<Value>,
    desired: Option<Value>,
}

#[derive(Deserialize)]
struct RawRejected {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(rename = "clientToken")]
    client_token: Option<String>,
}

/// Decodes an inbound shadow response.
///
/// Fails on a topic that is not a response topic or a payload that is not a
/// shadow document. Individual property values that cannot be interpreted do
/// not fail the decode; they are returned in [`DecodedState::skipped`].
pub fn decode_message(topic: &str, payload: &[u8]) -> DecodeResult<ShadowMessage> {
    let parsed = ShadowTopic::parse(topic)?;
    let outcome = parsed
        .outcome
        .ok_or_else(|| DecodeError::UnrecognizedTopic(topic.to_string()))?;

    let response = match outcome {
        ShadowOutcome::Accepted => {
            let raw: RawAccepted = serde_json::from_slice(payload)?;
            ShadowResponse::Accepted(AcceptedDocument {
                reported: raw
                    .state
                    .reported
                    .as_ref()
                    .map(|v| decode_properties(v, &REPORTED_KEYS, decode_reported)),
                desired: raw
                    .state
                    .desired
                    .as_ref()
                    .map(|v| decode_properties(v, &DESIRED_KEYS, decode_desired)),
                version: raw.version,
                timestamp: raw
                    .timestamp
                    .and_then(|secs| DateTime::from_timestamp(secs, 0)),
                client_token: raw.client_token,
            })
        }
        ShadowOutcome::Rejected => {
            let raw: RawRejected = serde_json::from_slice(payload)?;
            ShadowResponse::Rejected(RejectedDocument {
                code: raw.code,
                message: raw.message,
                client_token: raw.client_token,
            })
        }
    };

    Ok(ShadowMessage {
        thing: parsed.thing,
        command: parsed.command,
        response,
    })
}

fn properties(state: &Value) -> Option<&Map<String, Value>> {
    state
        .get(ENDPOINT_KEY)
        .and_then(|endpoint| endpoint.get(PROPERTIES_KEY))
        .and_then(Value::as_object)
}

fn decode_properties(
    state: &Value,
    keys: &[(&str, Attribute)],
    convert: fn(Attribute, &Value) -> Option<AttributeValue>,
) -> DecodedState {
    let mut decoded = DecodedState::default();
    let Some(props) = properties(state) else {
        return decoded;
    };

    for (key, attribute) in keys {
        let Some(raw) = props.get(*key) else {
            continue;
        };
        if raw.is_null() {
            continue;
        }
        match convert(*attribute, raw) {
            Some(value) => {
                decoded.attributes.insert(*attribute, value);
            }
            None => decoded.skipped.push(SkippedValue {
                key: (*key).to_string(),
                value: raw.clone(),
            }),
        }
    }
    decoded
}

/// Numbers arrive either as JSON numbers or as numeric strings.
fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn as_code(value: &Value) -> Option<i64> {
    let n = as_number(value)?;
    (n.fract() == 0.0).then_some(n as i64)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn decode_reported(attribute: Attribute, value: &Value) -> Option<AttributeValue> {
    match attribute {
        Attribute::TargetTemperature
        | Attribute::CurrentTemperature
        | Attribute::MinTemperature
        | Attribute::MaxTemperature => {
            as_number(value).map(|hundredths| AttributeValue::Temperature(hundredths / 100.0))
        }
        Attribute::SystemMode => as_code(value)
            .and_then(SystemMode::from_code)
            .map(AttributeValue::Mode),
        Attribute::RunningState => as_code(value)
            .and_then(RunningState::from_code)
            .map(AttributeValue::State),
        Attribute::SerialNumber | Attribute::Manufacturer | Attribute::FirmwareVersion => {
            as_text(value).map(AttributeValue::Text)
        }
        Attribute::Available => None,
    }
}

fn decode_desired(attribute: Attribute, value: &Value) -> Option<AttributeValue> {
    match attribute {
        Attribute::TargetTemperature => {
            as_number(value).map(|hundredths| AttributeValue::Temperature(hundredths / 100.0))
        }
        Attribute::SystemMode => as_code(value)
            .and_then(SystemMode::from_code)
            .map(AttributeValue::Mode),
        _ => None,
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Payload for a `get` request.
pub fn encode_get_request(client_token: &str) -> Vec<u8> {
    json!({ "clientToken": client_token }).to_string().into_bytes()
}

/// Payload for an `update` request carrying desired state.
///
/// Only writable attributes with a matching value variant are encoded; callers
/// validate before encoding.
pub fn encode_update_request(changes: &AttributeMap, client_token: &str) -> Vec<u8> {
    let mut desired = Map::new();
    for (key, attribute) in DESIRED_KEYS {
        let encoded = match (attribute, changes.get(&attribute)) {
            (Attribute::TargetTemperature, Some(AttributeValue::Temperature(v))) => {
                json!((v * 100.0).round() as i64)
            }
            (Attribute::SystemMode, Some(AttributeValue::Mode(mode))) => json!(mode.code()),
            _ => continue,
        };
        desired.insert(key.to_string(), encoded);
    }

    json!({
        "state": { "desired": { "11": { "properties": desired } } },
        "clientToken": client_token,
    })
    .to_string()
    .into_bytes()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T1: &str = "T1";

    fn reported_payload(props: Value, token: Option<&str>) -> Vec<u8> {
        let mut doc = json!({
            "state": { "reported": { "11": { "properties": props } } },
            "version": 42,
            "timestamp": 1700000000,
        });
        if let Some(token) = token {
            doc["clientToken"] = json!(token);
        }
        doc.to_string().into_bytes()
    }

    #[test]
    fn test_topic_round_trip() {
        let topic = "$aws/things/T1/shadow/update/accepted";
        let parsed = ShadowTopic::parse(topic).unwrap();
        assert_eq!(parsed.thing, DeviceId::new(T1));
        assert_eq!(parsed.command, ShadowCommand::Update);
        assert_eq!(parsed.outcome, Some(ShadowOutcome::Accepted));
        assert_eq!(parsed.to_string(), topic);

        let request = ShadowTopic::request(DeviceId::new(T1), ShadowCommand::Get);
        assert_eq!(request.to_string(), "$aws/things/T1/shadow/get");
    }

    #[test]
    fn test_rejects_foreign_topics() {
        for topic in [
            "$aws/things/T1/shadow/delete/accepted",
            "$aws/things/T1/jobs/get",
            "$aws/things//shadow/get",
            "$aws/things/T1/shadow/get/accepted/extra",
            "devices/T1/state",
        ] {
            assert!(
                matches!(ShadowTopic::parse(topic), Err(DecodeError::UnrecognizedTopic(_))),
                "{topic} should not parse"
            );
        }
    }

    #[test]
    fn test_subscription_topics() {
        let topics = subscription_topics(&DeviceId::new(T1));
        assert_eq!(
            topics,
            vec![
                "$aws/things/T1/shadow/get/accepted",
                "$aws/things/T1/shadow/get/rejected",
                "$aws/things/T1/shadow/update/accepted",
                "$aws/things/T1/shadow/update/rejected",
            ]
        );
    }

    #[test]
    fn test_decode_get_accepted_snapshot() {
        let payload = reported_payload(
            json!({
                "ep1:sTherS:HeatingSetpoint_x100": 1800,
                "ep1:sTherS:LocalTemperature_x100": "1750",
                "ep1:sTherS:RunningMode": 4,
                "ep1:sTherS:RunningState": 1,
                "ep1:sZDO:FirmwareVersion": "0x0102",
                "ep1:sPowerMS:RadSerialNum": 123456,
                "ep1:sBasicS:Unrelated": "ignored",
            }),
            Some("tok-1"),
        );

        let msg = decode_message("$aws/things/T1/shadow/get/accepted", &payload).unwrap();
        assert_eq!(msg.command, ShadowCommand::Get);
        assert_eq!(msg.client_token(), Some("tok-1"));

        let ShadowResponse::Accepted(doc) = msg.response else {
            panic!("expected accepted document");
        };
        assert_eq!(doc.version, Some(42));
        assert_eq!(doc.timestamp.map(|t| t.timestamp()), Some(1_700_000_000));
        let reported = doc.reported.unwrap();
        assert!(reported.skipped.is_empty());
        let attrs = reported.attributes;
        assert_eq!(
            attrs.get(&Attribute::TargetTemperature),
            Some(&AttributeValue::Temperature(18.0))
        );
        assert_eq!(
            attrs.get(&Attribute::CurrentTemperature),
            Some(&AttributeValue::Temperature(17.5))
        );
        assert_eq!(
            attrs.get(&Attribute::SystemMode),
            Some(&AttributeValue::Mode(SystemMode::Heat))
        );
        assert_eq!(
            attrs.get(&Attribute::RunningState),
            Some(&AttributeValue::State(RunningState::Heating))
        );
        assert_eq!(
            attrs.get(&Attribute::SerialNumber),
            Some(&AttributeValue::Text("123456".into()))
        );
        assert_eq!(attrs.len(), 6);
    }

    #[test]
    fn test_bad_values_are_skipped_not_fatal() {
        let payload = reported_payload(
            json!({
                "ep1:sTherS:HeatingSetpoint_x100": "warm",
                "ep1:sTherS:RunningMode": 3,
                "ep1:sTherS:LocalTemperature_x100": 2100,
            }),
            None,
        );

        let msg = decode_message("$aws/things/T1/shadow/update/accepted", &payload).unwrap();
        let ShadowResponse::Accepted(doc) = msg.response else {
            panic!("expected accepted document");
        };
        let reported = doc.reported.unwrap();
        assert_eq!(reported.attributes.len(), 1);
        assert_eq!(reported.skipped.len(), 2);
        assert!(reported
            .skipped
            .iter()
            .any(|s| s.key == "ep1:sTherS:RunningMode"));
    }

    #[test]
    fn test_decode_rejected() {
        let payload = br#"{"code":400,"message":"Invalid JSON","clientToken":"tok-9"}"#;
        let msg = decode_message("$aws/things/T1/shadow/update/rejected", payload).unwrap();
        assert_eq!(
            msg.response,
            ShadowResponse::Rejected(RejectedDocument {
                code: 400,
                message: "Invalid JSON".into(),
                client_token: Some("tok-9".into()),
            })
        );
    }

    #[test]
    fn test_decode_malformed_payload() {
        let err = decode_message("$aws/things/T1/shadow/get/accepted", b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload(_)));

        let err = decode_message("$aws/things/T1/shadow/get", b"{}").unwrap_err();
        assert!(matches!(err, DecodeError::UnrecognizedTopic(_)));
    }

    #[test]
    fn test_encode_update_request() {
        let changes = AttributeMap::from([
            (Attribute::TargetTemperature, AttributeValue::Temperature(20.5)),
            (Attribute::SystemMode, AttributeValue::Mode(SystemMode::Heat)),
        ]);
        let payload = encode_update_request(&changes, "tok-2");
        let doc: Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(doc["clientToken"], "tok-2");
        let props = &doc["state"]["desired"]["11"]["properties"];
        assert_eq!(props["ep1:sTherS:SetHeatingSetpoint_x100"], 2050);
        assert_eq!(props["ep1:sTherS:SetSystemMode"], 4);
    }

    #[test]
    fn test_update_echo_decodes_desired() {
        let changes = AttributeMap::from([(
            Attribute::TargetTemperature,
            AttributeValue::Temperature(20.0),
        )]);
        let payload = encode_update_request(&changes, "tok-3");

        let msg = decode_message("$aws/things/T1/shadow/update/accepted", &payload).unwrap();
        let ShadowResponse::Accepted(doc) = msg.response else {
            panic!("expected accepted document");
        };
        assert!(doc.reported.is_none());
        assert_eq!(doc.desired.unwrap().attributes, changes);
    }

    #[test]
    fn test_encode_get_request() {
        let doc: Value = serde_json::from_slice(&encode_get_request("tok-4")).unwrap();
        assert_eq!(doc, json!({ "clientToken": "tok-4" }));
    }
}
