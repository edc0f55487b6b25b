// ── Device ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::device_id::DeviceId;
use super::property_table::{PropertySpec, PropertyTable};
use super::scalar::Scalar;
use super::FieldAddress;

/// Observed state of one named property.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub address: FieldAddress,
    pub current_value: Option<Scalar>,
    /// `false` while a command we sent is still unconfirmed.
    pub acknowledged: bool,
    /// Value written by the last unconfirmed command.
    pub pending_value: Option<Scalar>,
    pub last_updated: DateTime<Utc>,
}

impl Property {
    pub(crate) fn new(address: FieldAddress, at: DateTime<Utc>) -> Self {
        Self {
            address,
            current_value: None,
            acknowledged: true,
            pending_value: None,
            last_updated: at,
        }
    }
}

/// A Zigbee device as mirrored by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub device_id: DeviceId,
    /// Id the hub knows this device by; used for every hub request.
    pub hub_id: String,
    /// Display name; defaults to the device id until the hub provides one.
    pub friendly_name: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub link_quality: Option<u16>,
    pub model: String,
    pub manufacturer: String,
    pub driver: Option<String>,
    /// Adapter device type (`plug`, `switch`, ...).
    pub device_type: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub table: PropertyTable,
    /// Keyed by property name.
    pub properties: BTreeMap<String, Property>,
}

impl Device {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            friendly_name: device_id.to_string(),
            hub_id: device_id.to_string(),
            device_id,
            online: false,
            last_seen: None,
            link_quality: None,
            model: String::new(),
            manufacturer: String::new(),
            driver: None,
            device_type: None,
            description: None,
            url: None,
            table: PropertyTable::default(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn spec(&self, name: &str) -> Option<&PropertySpec> {
        self.table.by_name(name)
    }

    /// `(spec, property)` pairs for every property with a known value.
    pub fn values(&self) -> impl Iterator<Item = (&PropertySpec, &Scalar)> {
        self.properties.values().filter_map(|p| {
            let spec = self.table.get(p.address)?;
            Some((spec, p.current_value.as_ref()?))
        })
    }

    /// Aggregate JSON state: every known property value plus the
    /// friendly name and link quality.
    pub fn state_json(&self) -> Map<String, Value> {
        let mut out: Map<String, Value> = self
            .values()
            .map(|(spec, value)| (spec.name.clone(), value.to_json()))
            .collect();
        out.insert("name".into(), Value::String(self.friendly_name.clone()));
        if let Some(lqi) = self.link_quality {
            out.insert("linkquality".into(), Value::from(lqi));
        }
        out
    }
}
