// ── Hub payload types ──
//
// Typed views over the JSON the hub returns. The hub is loose about
// shapes (numeric keys as strings, JSON documents embedded as strings,
// optional fields), so parsing here is tolerant: malformed entries are
// skipped rather than failing the whole reply.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Numeric field address inside a device ("1", "12", "203" on the wire).
pub type FieldAddress = u16;

// ── Device list ──────────────────────────────────────────────────────

/// One entry of `listObjects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    /// IEEE address, lowercase hex.
    pub id: String,
    #[serde(rename = "mnf", default = "unknown")]
    pub manufacturer: String,
    #[serde(rename = "mdl", default = "unknown")]
    pub model: String,
    #[serde(rename = "netid", default)]
    pub network_id: u32,
    #[serde(rename = "drv", default)]
    pub driver: Option<String>,
    /// Last time the hub heard from the device (hub clock).
    #[serde(rename = "lse", default)]
    pub last_seen: Option<f64>,
    #[serde(default)]
    pub lqi: Option<u16>,
    /// Hub-side health warning; the device is considered unreachable.
    #[serde(rename = "warn", default, deserialize_with = "truthy")]
    pub warning: bool,
}

fn unknown() -> String {
    "Unknown".into()
}

fn truthy<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    })
}

// ── Property values ──────────────────────────────────────────────────

/// A single field value as reported by `getState` or `object_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    #[serde(default)]
    pub value: Value,
    /// Hub timestamp; seconds or milliseconds depending on firmware.
    #[serde(default)]
    pub time: Option<f64>,
    /// `true` once the device confirmed a written value.
    #[serde(default)]
    pub ack: bool,
}

/// Collect `{"<address>": {value, time, ack}}` entries, ignoring anything
/// whose key is not numeric or whose body is not an object.
fn numeric_props(map: &serde_json::Map<String, Value>) -> BTreeMap<FieldAddress, PropertyValue> {
    map.iter()
        .filter_map(|(key, body)| {
            let address = key.parse::<FieldAddress>().ok()?;
            if !body.is_object() {
                return None;
            }
            let value = serde_json::from_value::<PropertyValue>(body.clone()).ok()?;
            Some((address, value))
        })
        .collect()
}

/// Full state of one device (`getState`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub properties: BTreeMap<FieldAddress, PropertyValue>,
    pub adapter_crc: Option<i64>,
}

impl DeviceState {
    pub fn from_value(body: &Value) -> Self {
        let Some(map) = body.as_object() else {
            return Self::default();
        };
        Self {
            properties: numeric_props(map),
            adapter_crc: map.get("adptr-crc").and_then(Value::as_i64),
        }
    }
}

/// Partial state push (`object_update` broadcast).
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUpdate {
    pub id: String,
    pub props: BTreeMap<FieldAddress, PropertyValue>,
}

impl ObjectUpdate {
    pub fn from_value(body: &Value) -> Option<Self> {
        let id = body.get("id")?.as_str()?.to_owned();
        let props = body
            .get("props")
            .and_then(Value::as_object)
            .map(numeric_props)
            .unwrap_or_default();
        Some(Self { id, props })
    }
}

// ── Attributes ───────────────────────────────────────────────────────

/// User-assigned attributes (`getAttributes`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceAttributes {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DeviceAttributes {
    /// The hub may return the attribute document either as an object or
    /// as a JSON string.
    pub fn from_value(body: &Value) -> Self {
        let parsed = match body {
            Value::String(raw) => serde_json::from_str::<Value>(raw).unwrap_or(Value::Null),
            other => other.clone(),
        };
        serde_json::from_value(parsed).unwrap_or_default()
    }
}

// ── Adapters ─────────────────────────────────────────────────────────

/// Presentation hints attached to an adapter param.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ViewParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    /// UI widget kind, e.g. `"dropdown"`.
    #[serde(rename = "type", default)]
    pub widget: Option<String>,
}

/// One field definition inside a driver adapter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdapterParam {
    pub address: FieldAddress,
    /// `"r"`, `"w"`, `"rw"` or empty.
    #[serde(default = "read_only")]
    pub access: String,
    /// `"bool"`, `"int"` or `"float"`.
    #[serde(rename = "type", default = "int_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Label → raw hub value.
    #[serde(default)]
    pub labels: BTreeMap<String, Value>,
    #[serde(rename = "viewParams", default)]
    pub view_params: ViewParams,
}

fn read_only() -> String {
    "r".into()
}

fn int_type() -> String {
    "int".into()
}

impl AdapterParam {
    pub fn is_readable(&self) -> bool {
        self.access.contains('r')
    }

    pub fn is_writable(&self) -> bool {
        self.access.contains('w')
    }
}

/// A driver description (`getAdapter`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceAdapter {
    pub driver: String,
    pub crc: i64,
    pub description: Option<String>,
    pub device_type: Option<String>,
    pub url: Option<String>,
    pub params: Vec<AdapterParam>,
}

impl DeviceAdapter {
    /// Parse a `getAdapter` result: `{crc, content}` where `content` is the
    /// adapter document, possibly serialized as a string.
    pub fn from_value(driver: &str, body: &Value) -> Self {
        let crc = body.get("crc").and_then(Value::as_i64).unwrap_or_default();
        let content = match body.get("content") {
            Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };

        let text = |key: &str| content.get(key).and_then(Value::as_str).map(str::to_owned);
        let params = content
            .get("params")
            .and_then(Value::as_array)
            .map(|raw| {
                raw.iter()
                    .filter_map(|p| serde_json::from_value::<AdapterParam>(p.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            driver: driver.to_owned(),
            crc,
            description: text("description"),
            device_type: text("type"),
            url: text("url"),
            params,
        }
    }

    pub fn param(&self, address: FieldAddress) -> Option<&AdapterParam> {
        self.params.iter().find(|p| p.address == address)
    }
}
