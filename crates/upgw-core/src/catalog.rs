//! # Device Catalog
//!
//! Parsing of the vendor service API inventory responses.
//!
//! `occupants/slider_list` lists the gateways an account can see;
//! `occupants/slider_details` returns one gateway's tree of rooms and devices.
//! Devices may be nested arbitrarily deep under `items`. The gateway itself
//! also shows up in that tree (recognizable by its `occupants_permissions`)
//! and is not one of its own children.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DecodeError, DecodeResult};
use crate::types::{DeviceId, DeviceInfo, DeviceKind, GatewayInfo, Occupant};

/// Slider type string the service uses for gateways.
pub const GATEWAY_SLIDER_TYPE: &str = "gateway";

#[derive(Deserialize)]
struct RawListing {
    data: Vec<RawSlider>,
}

#[derive(Deserialize)]
struct RawSlider {
    #[serde(rename = "type")]
    kind: Option<String>,
    gateway: Option<RawGateway>,
}

#[derive(Deserialize)]
struct RawGateway {
    id: Uuid,
    device_code: Value,
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    name: Option<Value>,
    occupants_permissions: RawPermissions,
}

#[derive(Deserialize)]
struct RawPermissions {
    receiver_occupant: RawOccupant,
}

#[derive(Deserialize)]
struct RawOccupant {
    id: Uuid,
    identity_id: Value,
}

/// The service returns some string fields as numbers.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn opt_text(value: Option<&Value>) -> String {
    value.map(text).unwrap_or_default()
}

/// Parses the gateway list, ignoring sliders of other types.
pub fn parse_slider_list(body: &Value) -> DecodeResult<Vec<GatewayInfo>> {
    let listing = RawListing::deserialize(body)?;

    let mut gateways = Vec::new();
    for slider in listing.data {
        if slider.kind.as_deref() != Some(GATEWAY_SLIDER_TYPE) {
            continue;
        }
        let gateway = slider
            .gateway
            .ok_or_else(|| DecodeError::MissingField("gateway".to_string()))?;
        let occupant = gateway.occupants_permissions.receiver_occupant;

        gateways.push(GatewayInfo {
            id: DeviceId::new(text(&gateway.device_code)),
            service_id: Some(gateway.id),
            name: opt_text(gateway.name.as_ref()),
            model: opt_text(gateway.model.as_ref()),
            occupant: Some(Occupant {
                id: occupant.id,
                identity_id: text(&occupant.identity_id),
            }),
            ip_address: None,
            mac_address: None,
        });
    }
    Ok(gateways)
}

/// Parses a gateway's detail tree into its child devices, depth first.
pub fn parse_slider_details(body: &Value) -> DecodeResult<Vec<DeviceInfo>> {
    let data = body
        .get("data")
        .ok_or_else(|| DecodeError::MissingField("data".to_string()))?;

    let mut devices = Vec::new();
    collect_devices(data, &mut devices)?;
    Ok(devices)
}

fn collect_devices(node: &Value, out: &mut Vec<DeviceInfo>) -> DecodeResult<()> {
    let items = node
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| DecodeError::MissingField("items".to_string()))?;

    for item in items {
        if item.get("items").is_some() {
            collect_devices(item, out)?;
        } else if item.get("device_code").is_some() && item.get("occupants_permissions").is_none()
        {
            out.push(parse_device(item)?);
        }
    }
    Ok(())
}

fn parse_device(item: &Value) -> DecodeResult<DeviceInfo> {
    let field = |name: &str| {
        item.get(name)
            .ok_or_else(|| DecodeError::MissingField(name.to_string()))
    };

    let service_id = match field("id")? {
        Value::String(s) => Some(
            Uuid::parse_str(s).map_err(|e| DecodeError::InvalidPayload(e.to_string()))?,
        ),
        _ => None,
    };

    Ok(DeviceInfo {
        id: DeviceId::new(text(field("device_code")?)),
        service_id,
        kind: DeviceKind::Thermostat,
        name: opt_text(item.get("name")),
        model: opt_text(item.get("model")),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
