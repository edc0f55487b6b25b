// ── Topic router ──
//
// Owns the MQTT topic grammar in both directions. Inbound topics are
// parsed into `Command`s and resolved against the registry into typed
// property writes; outbound topics are built from device snapshots.
//
// Inbound priority, most specific first:
//   {base}/{device}/{property}/set   scalar, explicit property
//   {base}/{device}/{property}       scalar, explicit property
//   {base}/{device}/set              JSON object
//   {base}/{device}                  JSON object
// On the bare device topic the payload shape decides: only a JSON object
// is a command.

use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::model::{Device, DeviceId, FieldAddress, Scalar, is_reserved_segment};
use crate::registry::DeviceRegistry;

pub const BRIDGE_SEGMENT: &str = "bridge";

/// Which inbound grammar a command arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TopicFormat {
    PropertySet,
    PropertyDirect,
    DeviceSet,
    DeviceDirect,
}

/// A parsed inbound command, not yet checked against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Device id or friendly name, as it appeared in the topic.
    pub device: String,
    /// Absent for whole-device JSON commands.
    pub property: Option<String>,
    /// A scalar for property commands, an object otherwise.
    pub value: Value,
    pub format: TopicFormat,
}

/// One typed value to send to the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyWrite {
    pub device_id: DeviceId,
    /// Target id in the hub's own spelling.
    pub hub_id: String,
    pub property: String,
    pub address: FieldAddress,
    pub value: Scalar,
    /// Value as the hub expects it on the wire.
    pub wire: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn retained(topic: String, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    base: String,
    discovery_prefix: String,
}

impl TopicRouter {
    pub fn new(base: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_owned(),
            discovery_prefix: discovery_prefix.into().trim_end_matches('/').to_owned(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Topic filters covering every inbound command shape.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/+", self.base),
            format!("{}/+/+", self.base),
            format!("{}/+/+/set", self.base),
        ]
    }

    /// Parse an inbound message. `Ok(None)` for topics that are not
    /// commands (bridge topics, our own ack/name/availability topics).
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<Option<Command>, CoreError> {
        let Some(rest) = topic
            .strip_prefix(self.base.as_str())
            .and_then(|r| r.strip_prefix('/'))
        else {
            return Ok(None);
        };
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) || segments.first() == Some(&BRIDGE_SEGMENT) {
            return Ok(None);
        }
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let (device, property, format) = match segments.as_slice() {
            [device, property, "set"] if !is_reserved_segment(property) => {
                (*device, Some(*property), TopicFormat::PropertySet)
            }
            [device, "set"] => (*device, None, TopicFormat::DeviceSet),
            [device, property] if !is_reserved_segment(property) => {
                (*device, Some(*property), TopicFormat::PropertyDirect)
            }
            [device] => (*device, None, TopicFormat::DeviceDirect),
            _ => return Ok(None),
        };

        let text = std::str::from_utf8(payload)
            .map_err(|_| CoreError::translation(topic, "payload is not UTF-8"))?
            .trim();
        let value = if property.is_some() {
            scalar_payload(topic, text)?
        } else {
            object_payload(topic, text)?
        };

        Ok(Some(Command {
            device: device.to_owned(),
            property: property.map(str::to_owned),
            value,
            format,
        }))
    }

    /// Check a command against the registry and coerce every value to
    /// its property's type. All-or-nothing: one bad property rejects
    /// the whole command.
    pub fn resolve(
        &self,
        topic: &str,
        command: &Command,
        registry: &DeviceRegistry,
    ) -> Result<Vec<PropertyWrite>, CoreError> {
        let device = registry
            .resolve(&command.device)
            .ok_or_else(|| CoreError::translation(topic, format!("unknown device '{}'", command.device)))?;

        let pairs: Vec<(&str, &Value)> = match (&command.property, &command.value) {
            (Some(property), value) => vec![(property.as_str(), value)],
            (None, Value::Object(map)) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            (None, _) => return Err(CoreError::translation(topic, "expected a JSON object")),
        };
        if pairs.is_empty() {
            return Err(CoreError::translation(topic, "no properties in command"));
        }

        pairs
            .into_iter()
            .map(|(name, value)| {
                let spec = device
                    .spec(name)
                    .ok_or_else(|| CoreError::translation(topic, format!("unknown property '{name}'")))?;
                if !spec.accepts_commands() {
                    return Err(CoreError::translation(
                        topic,
                        format!("property '{}' is read-only", spec.name),
                    ));
                }
                let scalar = spec
                    .coerce(value)
                    .map_err(|reason| CoreError::translation(topic, reason))?;
                Ok(PropertyWrite {
                    device_id: device.device_id.clone(),
                    hub_id: device.hub_id.clone(),
                    property: spec.name.clone(),
                    address: spec.address,
                    wire: spec.encode(&scalar),
                    value: scalar,
                })
            })
            .collect()
    }

    // ── Outbound topics ──────────────────────────────────────────────

    pub fn state_topic(&self, id: &DeviceId) -> String {
        format!("{}/{id}", self.base)
    }

    pub fn property_topic(&self, id: &DeviceId, property: &str) -> String {
        format!("{}/{id}/{property}", self.base)
    }

    pub fn set_topic(&self, id: &DeviceId, property: &str) -> String {
        format!("{}/{id}/{property}/set", self.base)
    }

    pub fn ack_topic(&self, id: &DeviceId, property: &str) -> String {
        format!("{}/{id}/ack/{property}", self.base)
    }

    pub fn name_topic(&self, id: &DeviceId) -> String {
        format!("{}/{id}/name", self.base)
    }

    pub fn availability_topic(&self, id: &DeviceId) -> String {
        format!("{}/{id}/availability", self.base)
    }

    pub fn bridge_state_topic(&self) -> String {
        format!("{}/{BRIDGE_SEGMENT}/state", self.base)
    }

    pub fn bridge_devices_topic(&self) -> String {
        format!("{}/{BRIDGE_SEGMENT}/devices", self.base)
    }

    pub fn discovery_topic(&self, component: &str, id: &DeviceId, address: FieldAddress) -> String {
        format!("{}/{component}/{id}/{address}/config", self.discovery_prefix)
    }

    // ── Outbound messages ────────────────────────────────────────────

    pub fn state_message(&self, device: &Device) -> OutboundMessage {
        OutboundMessage::retained(
            self.state_topic(&device.device_id),
            Value::Object(device.state_json()).to_string(),
        )
    }

    /// `None` while the property has no known value.
    pub fn property_message(&self, device: &Device, property: &str) -> Option<OutboundMessage> {
        let value = device.property(property)?.current_value.as_ref()?;
        Some(OutboundMessage::retained(
            self.property_topic(&device.device_id, property),
            value.topic_text(),
        ))
    }

    pub fn ack_message(&self, device: &Device, property: &str) -> Option<OutboundMessage> {
        let prop = device.property(property)?;
        Some(OutboundMessage::retained(
            self.ack_topic(&device.device_id, property),
            if prop.acknowledged { "true" } else { "false" },
        ))
    }

    pub fn name_message(&self, device: &Device) -> OutboundMessage {
        OutboundMessage::retained(self.name_topic(&device.device_id), device.friendly_name.clone())
    }

    pub fn availability_message(&self, device: &Device) -> OutboundMessage {
        OutboundMessage::retained(
            self.availability_topic(&device.device_id),
            availability(device.online),
        )
    }

    /// Every state-side topic for one device: the JSON state, each
    /// property value, the name, availability and each ack flag.
    pub fn build_state_topics(&self, device: &Device) -> Vec<OutboundMessage> {
        let mut out = vec![self.state_message(device)];
        out.extend(
            device
                .properties
                .keys()
                .filter_map(|name| self.property_message(device, name)),
        );
        out.push(self.name_message(device));
        out.push(self.availability_message(device));
        out.extend(
            device
                .properties
                .keys()
                .filter_map(|name| self.ack_message(device, name)),
        );
        out
    }
}

pub(crate) fn availability(online: bool) -> &'static str {
    if online { "online" } else { "offline" }
}

/// Direct-set payloads: JSON scalars as-is, anything unparseable as a
/// plain string. Objects and arrays are rejected.
fn scalar_payload(topic: &str, text: &str) -> Result<Value, CoreError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(_) | Value::Array(_)) => Err(CoreError::translation(
            topic,
            "expected a scalar value, got a JSON structure",
        )),
        Ok(Value::Null) => Err(CoreError::translation(topic, "null is not a value")),
        Ok(value) => Ok(value),
        Err(_) => Ok(Value::String(text.to_owned())),
    }
}

fn object_payload(topic: &str, text: &str) -> Result<Value, CoreError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(Value::Object(map)),
        Ok(_) => Err(CoreError::translation(topic, "expected a JSON object")),
        Err(e) => Err(CoreError::translation(topic, format!("invalid JSON: {e}"))),
    }
}

/// Convenience for building an object command in tests and callers.
pub fn object_command(pairs: &[(&str, Value)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect::<Map<String, Value>>(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use pushok_api::DeviceAdapter;
    use serde_json::json;

    use super::*;
    use crate::model::{DeviceListing, PropertyTable};

    const PLUG: &str = "00158d0001234567";

    fn router() -> TopicRouter {
        TopicRouter::new("pushok_hub", "homeassistant")
    }

    fn registry() -> DeviceRegistry {
        let table = PropertyTable::from_adapter(&DeviceAdapter::from_value(
            "plug",
            &json!({"crc": 1, "content": {"params": [
                {"address": 1, "access": "rw", "type": "bool", "viewParams": {"name": "state"}},
                {"address": 2, "type": "float", "viewParams": {"name": "power"}},
                {"address": 3, "access": "rw", "min": 0, "max": 100,
                 "viewParams": {"name": "brightness"}}
            ]}}),
        ));
        let mut reg = DeviceRegistry::new();
        reg.apply_listing(
            DeviceListing {
                device_id: DeviceId::new(PLUG),
                hub_id: PLUG.into(),
                friendly_name: Some("Kitchen plug".into()),
                model: "TS011F".into(),
                manufacturer: "Tuya".into(),
                driver: Some("plug".into()),
                device_type: None,
                description: None,
                url: None,
                link_quality: None,
                last_seen: None,
                warning: false,
                table: Some(table),
                state: Vec::new(),
            },
            Utc::now(),
        );
        reg
    }

    fn writes(topic: &str, payload: &str) -> Result<Vec<PropertyWrite>, CoreError> {
        let r = router();
        let command = r.parse(topic, payload.as_bytes())?.unwrap();
        r.resolve(topic, &command, &registry())
    }

    #[test]
    fn all_four_shapes_produce_the_same_write() {
        let expected = vec![PropertyWrite {
            device_id: DeviceId::new(PLUG),
            hub_id: PLUG.into(),
            property: "state".into(),
            address: 1,
            value: Scalar::Bool(false),
            wire: json!(false),
        }];
        assert_eq!(writes("pushok_hub/00158d0001234567/state/set", "false").unwrap(), expected);
        assert_eq!(writes("pushok_hub/00158d0001234567/state", "false").unwrap(), expected);
        assert_eq!(
            writes("pushok_hub/00158d0001234567/set", r#"{"state": false}"#).unwrap(),
            expected
        );
        assert_eq!(
            writes("pushok_hub/00158d0001234567", r#"{"state": false}"#).unwrap(),
            expected
        );
        assert_eq!(writes("pushok_hub/Kitchen plug/state", "OFF").unwrap(), expected);
    }

    #[test]
    fn formats_are_identified() {
        let r = router();
        let format = |topic: &str, payload: &str| r.parse(topic, payload.as_bytes()).unwrap().unwrap().format;
        assert_eq!(format("pushok_hub/dev/state/set", "1"), TopicFormat::PropertySet);
        assert_eq!(format("pushok_hub/dev/state", "1"), TopicFormat::PropertyDirect);
        assert_eq!(format("pushok_hub/dev/set", "{}"), TopicFormat::DeviceSet);
        assert_eq!(format("pushok_hub/dev", r#"{"state":1}"#), TopicFormat::DeviceDirect);
        assert_eq!(TopicFormat::PropertySet.to_string(), "property_set");
    }

    #[test]
    fn bare_topic_needs_an_object() {
        let r = router();
        let err = r.parse("pushok_hub/dev", b"true").unwrap_err();
        assert!(matches!(err, CoreError::Translation { .. }));

        let err = r.parse("pushok_hub/dev/state", br#"{"state": true}"#).unwrap_err();
        assert!(matches!(err, CoreError::Translation { .. }));

        assert!(r.parse("pushok_hub/dev/set", b"{not json").is_err());
    }

    #[test]
    fn non_command_topics_are_ignored() {
        let r = router();
        assert_eq!(r.parse("pushok_hub/bridge/state", b"online").unwrap(), None);
        assert_eq!(r.parse("pushok_hub/dev/availability", b"online").unwrap(), None);
        assert_eq!(r.parse("pushok_hub/dev/name", b"Lamp").unwrap(), None);
        assert_eq!(r.parse("pushok_hub/dev/ack/state", b"true").unwrap(), None);
        assert_eq!(r.parse("other/dev/state", b"1").unwrap(), None);
        assert_eq!(r.parse("pushok_hub/dev/state", b"").unwrap(), None);
    }

    #[test]
    fn resolution_rejects_bad_commands_whole() {
        assert!(writes("pushok_hub/ffff/state", "true").is_err());
        assert!(writes("pushok_hub/00158d0001234567/colour", "red").is_err());
        assert!(writes("pushok_hub/00158d0001234567/power", "12").is_err());
        assert!(writes("pushok_hub/00158d0001234567/brightness", "150").is_err());
        let err = writes(
            "pushok_hub/00158d0001234567/set",
            r#"{"state": true, "brightness": "bright"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Translation { .. }));
        assert!(writes("pushok_hub/00158d0001234567/set", "{}").is_err());
    }

    #[test]
    fn multi_property_command() {
        let out = writes(
            "pushok_hub/00158d0001234567/set",
            &object_command(&[("state", json!("on")), ("brightness", json!(40))]).to_string(),
        )
        .unwrap();
        let mut names: Vec<&str> = out.iter().map(|w| w.property.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["brightness", "state"]);
        let brightness = out.iter().find(|w| w.property == "brightness").unwrap();
        assert_eq!(brightness.wire, json!(40));
        let state = out.iter().find(|w| w.property == "state").unwrap();
        assert_eq!(state.value, Scalar::Bool(true));
    }

    #[test]
    fn state_topics_cover_every_shape() {
        let mut reg = registry();
        let id = DeviceId::new(PLUG);
        reg.apply_push(
            &crate::model::PushUpdate {
                device_id: id.clone(),
                hub_id: id.to_string(),
                fields: vec![crate::model::FieldUpdate {
                    address: 2,
                    raw: json!(45.2),
                    at: Utc::now(),
                    ack: false,
                }],
            },
            Utc::now(),
        );
        let device = reg.get(&id).unwrap();
        let messages = router().build_state_topics(&device);
        assert!(messages.iter().all(|m| m.retain));

        let state: Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(state, json!({"name": "Kitchen plug", "power": 45.2}));

        let topics: Vec<(String, String)> = messages
            .into_iter()
            .skip(1)
            .map(|m| (m.topic, m.payload))
            .collect();
        assert_eq!(
            topics,
            vec![
                ("pushok_hub/00158d0001234567/power".to_owned(), "45.2".to_owned()),
                ("pushok_hub/00158d0001234567/name".into(), "Kitchen plug".into()),
                ("pushok_hub/00158d0001234567/availability".into(), "online".into()),
                ("pushok_hub/00158d0001234567/ack/power".into(), "true".into()),
            ]
        );
    }
}
