// ── Discovery publisher ──
//
// Home-Assistant-style MQTT discovery: one retained config message per
// declared, non-service property, describing the component type and the
// per-property state and command topics.

use serde_json::{Map, Value, json};

use crate::model::{Device, PropertySpec, ValueKind};
use crate::router::{OutboundMessage, TopicRouter};

const UNIT_MAP: &[(&str, &str)] = &[
    ("unit_C", "°C"),
    ("unit_F", "°F"),
    ("unit_%", "%"),
    ("unit_voltage", "V"),
    ("unit_mV", "mV"),
    ("unit_power", "W"),
    ("unit_mA", "mA"),
    ("unit_A", "A"),
    ("unit_energy", "kWh"),
    ("unit_lux", "lx"),
    ("unit_ppm", "ppm"),
    ("unit_ppb", "ppb"),
    ("unit_hPa", "hPa"),
    ("unit_Pa", "Pa"),
    ("unit_cm", "cm"),
    ("unit_m", "m"),
    ("unit_s", "s"),
    ("unit_min", "min"),
    ("unit_Hz", "Hz"),
    ("unit_dB", "dB"),
    ("unit_L", "L"),
    ("unit_mL", "mL"),
    ("unit_m3", "m³"),
    ("unit_ugm3", "µg/m³"),
];

const SENSOR_CLASSES: &[(&str, &str)] = &[
    ("temperature", "temperature"),
    ("temp", "temperature"),
    ("humidity", "humidity"),
    ("hum", "humidity"),
    ("pressure", "pressure"),
    ("battery", "battery"),
    ("voltage", "voltage"),
    ("current", "current"),
    ("power", "power"),
    ("energy", "energy"),
    ("illuminance", "illuminance"),
    ("lux", "illuminance"),
    ("co2", "carbon_dioxide"),
    ("pm25", "pm25"),
    ("pm10", "pm10"),
    ("voc", "volatile_organic_compounds"),
    ("frequency", "frequency"),
    ("signal_strength", "signal_strength"),
    ("distance", "distance"),
];

const BINARY_SENSOR_CLASSES: &[(&str, &str)] = &[
    ("state", "opening"),
    ("contact", "opening"),
    ("open", "opening"),
    ("door", "door"),
    ("window", "window"),
    ("motion", "motion"),
    ("presense", "occupancy"),
    ("presence", "occupancy"),
    ("occupancy", "occupancy"),
    ("smoke", "smoke"),
    ("gas", "gas"),
    ("co", "carbon_monoxide"),
    ("water_leak", "moisture"),
    ("leak", "moisture"),
    ("moisture", "moisture"),
    ("vibration", "vibration"),
    ("tamper", "tamper"),
    ("battery_low", "battery"),
    ("problem", "problem"),
];

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Display unit for a hub unit id; unknown ids pass through.
pub(crate) fn display_unit(unit: &str) -> &str {
    lookup(UNIT_MAP, unit).unwrap_or(unit)
}

/// `"target_temp"` → `"Target Temp"`.
fn title(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct DiscoveryPublisher {
    router: TopicRouter,
    enabled: bool,
}

impl DiscoveryPublisher {
    pub fn new(router: TopicRouter, enabled: bool) -> Self {
        Self { router, enabled }
    }

    /// Config messages for every discoverable property of `device`.
    pub fn device_configs(&self, device: &Device) -> Vec<OutboundMessage> {
        if !self.enabled {
            return Vec::new();
        }
        device
            .table
            .iter()
            .filter(|spec| spec.declared && !spec.is_service() && (spec.readable || spec.writable))
            .map(|spec| self.config(device, spec))
            .collect()
    }

    fn config(&self, device: &Device, spec: &PropertySpec) -> OutboundMessage {
        let id = &device.device_id;
        let component = component(spec);

        let mut device_info = json!({
            "identifiers": [id.as_str()],
            "name": device.friendly_name,
            "model": device.model,
            "manufacturer": device.manufacturer,
        });
        if let Some(url) = &device.url {
            device_info["configuration_url"] = json!(url);
        }

        let mut body = Map::new();
        body.insert("name".into(), json!(title(&spec.name)));
        body.insert("unique_id".into(), json!(format!("{id}_{}", spec.address)));
        body.insert("state_topic".into(), json!(self.router.property_topic(id, &spec.name)));
        body.insert(
            "availability".into(),
            json!([
                {"topic": self.router.bridge_state_topic()},
                {"topic": self.router.availability_topic(id)},
            ]),
        );
        body.insert("availability_mode".into(), json!("all"));
        body.insert("device".into(), device_info);

        if spec.writable {
            body.insert("command_topic".into(), json!(self.router.set_topic(id, &spec.name)));
        }

        match component {
            "switch" => {
                body.insert("payload_on".into(), json!("true"));
                body.insert("payload_off".into(), json!("false"));
                body.insert("state_on".into(), json!("true"));
                body.insert("state_off".into(), json!("false"));
                if let Some(class) = switch_class(device, spec) {
                    body.insert("device_class".into(), json!(class));
                }
            }
            "binary_sensor" => {
                body.insert("payload_on".into(), json!("true"));
                body.insert("payload_off".into(), json!("false"));
                if let Some(class) = lookup(BINARY_SENSOR_CLASSES, &spec.name) {
                    body.insert("device_class".into(), json!(class));
                }
            }
            "select" => {
                let options: Vec<&str> = spec.labels.iter().map(|l| l.label.as_str()).collect();
                body.insert("options".into(), json!(options));
            }
            "number" => {
                if let Some(min) = spec.min {
                    body.insert("min".into(), json!(min));
                }
                if let Some(max) = spec.max {
                    body.insert("max".into(), json!(max));
                }
                insert_unit(&mut body, spec);
            }
            _ => {
                if spec.kind == ValueKind::Number {
                    insert_unit(&mut body, spec);
                    if let Some(class) = lookup(SENSOR_CLASSES, &spec.name) {
                        body.insert("device_class".into(), json!(class));
                    }
                    body.insert("state_class".into(), json!("measurement"));
                }
            }
        }

        OutboundMessage::retained(
            self.router.discovery_topic(component, id, spec.address),
            Value::Object(body).to_string(),
        )
    }
}

fn insert_unit(body: &mut Map<String, Value>, spec: &PropertySpec) {
    if let Some(unit) = &spec.unit {
        body.insert("unit_of_measurement".into(), json!(display_unit(unit)));
    }
}

fn component(spec: &PropertySpec) -> &'static str {
    match (spec.kind, spec.writable) {
        (ValueKind::Bool, true) => "switch",
        (ValueKind::Bool, false) => "binary_sensor",
        (ValueKind::Enum, true) => "select",
        (ValueKind::Number, true) => "number",
        (ValueKind::Enum | ValueKind::Number, false) => "sensor",
    }
}

fn switch_class(device: &Device, spec: &PropertySpec) -> Option<&'static str> {
    let kind = device.device_type.as_deref().unwrap_or_default().to_lowercase();
    if kind.contains("plug") || kind.contains("socket") {
        return Some("outlet");
    }
    if kind.contains("switch") {
        return Some("switch");
    }
    match spec.name.as_str() {
        "outlet" => Some("outlet"),
        "switch" => Some("switch"),
        _ => None,
    }
}
