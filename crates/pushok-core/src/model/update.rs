// ── Normalized hub input ──
//
// What the hub link hands to the registry once wire payloads have been
// decoded: still raw JSON values, but with timestamps resolved and
// identifiers normalized. The hub's own spelling of each id travels
// alongside, since every request back to the hub must use it.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::device_id::DeviceId;
use super::property_table::PropertyTable;
use super::FieldAddress;

/// One field value reported by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub address: FieldAddress,
    pub raw: Value,
    pub at: DateTime<Utc>,
    /// The device confirmed this value (command acknowledgment).
    pub ack: bool,
}

/// Partial state push for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    pub device_id: DeviceId,
    /// Id exactly as the hub spelled it.
    pub hub_id: String,
    pub fields: Vec<FieldUpdate>,
}

/// One device from a full hub snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceListing {
    pub device_id: DeviceId,
    /// Id exactly as the hub spelled it.
    pub hub_id: String,
    pub friendly_name: Option<String>,
    pub model: String,
    pub manufacturer: String,
    pub driver: Option<String>,
    pub device_type: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub link_quality: Option<u16>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Hub flagged the device as unreachable.
    pub warning: bool,
    /// Declared properties, when the driver adapter could be fetched.
    pub table: Option<PropertyTable>,
    pub state: Vec<FieldUpdate>,
}
