// ── Property type table ──
//
// Per-device mapping from numeric hub field addresses to named, typed
// properties. Built from the driver adapter when one is available;
// fields the adapter never declared get an inferred spec on first sight.

use std::collections::BTreeMap;

use pushok_api::{AdapterParam, DeviceAdapter, FieldAddress};
use serde_json::Value;

use super::scalar::{Scalar, ValueKind, number_json};

/// Addresses above this are hub-internal service fields; they are
/// tracked and published as state but never exposed through discovery.
pub const MAX_ENTITY_ADDRESS: FieldAddress = 200;

const RESERVED_SEGMENTS: [&str; 5] = ["set", "ack", "name", "availability", "bridge"];

/// Topic segments that can never be property names.
pub fn is_reserved_segment(segment: &str) -> bool {
    RESERVED_SEGMENTS.contains(&segment)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumLabel {
    pub label: String,
    pub raw: Value,
}

/// Everything the bridge knows about one field.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    pub name: String,
    pub address: FieldAddress,
    pub kind: ValueKind,
    pub readable: bool,
    pub writable: bool,
    /// `false` for specs inferred from a value the adapter never listed.
    pub declared: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Enum labels ordered by raw value.
    pub labels: Vec<EnumLabel>,
    pub unit: Option<String>,
    pub widget: Option<String>,
    pub description: Option<String>,
}

impl PropertySpec {
    pub fn from_param(param: &AdapterParam) -> Self {
        let kind = if param.param_type.eq_ignore_ascii_case("bool") {
            ValueKind::Bool
        } else if !param.labels.is_empty() {
            ValueKind::Enum
        } else {
            ValueKind::Number
        };

        let mut labels: Vec<EnumLabel> = param
            .labels
            .iter()
            .map(|(label, raw)| EnumLabel {
                label: label.clone(),
                raw: raw.clone(),
            })
            .collect();
        labels.sort_by(|a, b| raw_order(&a.raw, &b.raw));

        Self {
            name: param
                .view_params
                .name
                .as_deref()
                .map(slugify)
                .filter(|n| !n.is_empty() && !is_reserved_segment(n))
                .unwrap_or_else(|| fallback_name(param.address)),
            address: param.address,
            kind,
            readable: param.is_readable(),
            writable: param.is_writable(),
            declared: true,
            min: param.min,
            max: param.max,
            labels,
            unit: param.view_params.unit.clone().filter(|u| !u.is_empty()),
            widget: param.view_params.widget.clone(),
            description: param.description.clone(),
        }
    }

    /// Spec for a field seen only through its value.
    pub fn inferred(address: FieldAddress, raw: &Value) -> Self {
        let kind = match raw {
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::Enum,
            _ => ValueKind::Number,
        };
        Self {
            name: fallback_name(address),
            address,
            kind,
            readable: true,
            writable: false,
            declared: false,
            min: None,
            max: None,
            labels: Vec::new(),
            unit: None,
            widget: None,
            description: None,
        }
    }

    pub fn is_service(&self) -> bool {
        self.address > MAX_ENTITY_ADDRESS
    }

    /// Undeclared fields are passed through; declared ones must be writable.
    pub fn accepts_commands(&self) -> bool {
        self.writable || !self.declared
    }

    /// Hub value → typed value. `None` for null or shapeless values.
    pub fn decode(&self, raw: &Value) -> Option<Scalar> {
        match self.kind {
            ValueKind::Bool => match raw {
                Value::Bool(b) => Some(Scalar::Bool(*b)),
                Value::Number(n) => n.as_f64().map(|v| Scalar::Bool(v != 0.0)),
                Value::String(s) => parse_bool(s).map(Scalar::Bool),
                _ => None,
            },
            ValueKind::Number => match raw {
                Value::Number(n) => n.as_f64().map(Scalar::Number),
                Value::Bool(b) => Some(Scalar::Number(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s.trim().parse().ok().map(Scalar::Number),
                _ => None,
            },
            ValueKind::Enum => {
                if let Some(entry) = self.labels.iter().find(|l| raw_eq(&l.raw, raw)) {
                    return Some(Scalar::Enum(entry.label.clone()));
                }
                match raw {
                    Value::String(s) => Some(Scalar::Enum(s.clone())),
                    Value::Number(_) | Value::Bool(_) => Some(Scalar::Enum(raw.to_string())),
                    _ => None,
                }
            }
        }
    }

    /// Inbound command value → typed value, rejecting anything that does
    /// not fit the property's kind or range. The error is a human reason.
    pub fn coerce(&self, input: &Value) -> Result<Scalar, String> {
        match self.kind {
            ValueKind::Bool => match input {
                Value::Bool(b) => Ok(Scalar::Bool(*b)),
                Value::Number(n) if n.as_f64() == Some(1.0) => Ok(Scalar::Bool(true)),
                Value::Number(n) if n.as_f64() == Some(0.0) => Ok(Scalar::Bool(false)),
                Value::String(s) => parse_bool(s)
                    .map(Scalar::Bool)
                    .ok_or_else(|| format!("'{s}' is not a boolean for {}", self.name)),
                other => Err(format!("{other} is not a boolean for {}", self.name)),
            },
            ValueKind::Number => {
                let value = match input {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .filter(|v| v.is_finite())
                .ok_or_else(|| format!("{input} is not a number for {}", self.name))?;
                self.check_range(value)?;
                Ok(Scalar::Number(value))
            }
            ValueKind::Enum => self.coerce_enum(input),
        }
    }

    fn check_range(&self, value: f64) -> Result<(), String> {
        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        if below || above {
            let bound = |b: Option<f64>| b.map_or_else(|| "..".to_owned(), |v| number_json(v).to_string());
            return Err(format!(
                "{} is outside [{}, {}] for {}",
                number_json(value),
                bound(self.min),
                bound(self.max),
                self.name
            ));
        }
        Ok(())
    }

    fn coerce_enum(&self, input: &Value) -> Result<Scalar, String> {
        if self.labels.is_empty() {
            return match input {
                Value::String(s) => Ok(Scalar::Enum(s.clone())),
                Value::Number(_) | Value::Bool(_) => Ok(Scalar::Enum(input.to_string())),
                other => Err(format!("{other} is not a valid value for {}", self.name)),
            };
        }

        let found = match input {
            Value::String(s) => self
                .labels
                .iter()
                .find(|l| l.label == *s)
                .or_else(|| self.labels.iter().find(|l| l.label.eq_ignore_ascii_case(s)))
                .or_else(|| self.labels.iter().find(|l| raw_eq(&l.raw, input))),
            _ => self.labels.iter().find(|l| raw_eq(&l.raw, input)),
        };

        found.map(|l| Scalar::Enum(l.label.clone())).ok_or_else(|| {
            let options: Vec<&str> = self.labels.iter().map(|l| l.label.as_str()).collect();
            format!(
                "{input} is not one of [{}] for {}",
                options.join(", "),
                self.name
            )
        })
    }

    /// Typed value → hub wire value.
    pub fn encode(&self, value: &Scalar) -> Value {
        match value {
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Number(n) => number_json(*n),
            Scalar::Enum(label) => self
                .labels
                .iter()
                .find(|l| l.label == *label)
                .map_or_else(|| Value::String(label.clone()), |l| l.raw.clone()),
        }
    }
}

fn fallback_name(address: FieldAddress) -> String {
    format!("field_{address}")
}

/// Lowercase, underscores for anything that is not alphanumeric.
fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" => Some(true),
        "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn raw_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn raw_order(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

// ── Table ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyTable {
    specs: BTreeMap<FieldAddress, PropertySpec>,
}

impl PropertyTable {
    /// Declared specs for every adapter parameter. Duplicate display
    /// names are disambiguated with the field address.
    pub fn from_adapter(adapter: &DeviceAdapter) -> Self {
        let mut table = Self::default();
        for param in &adapter.params {
            let mut spec = PropertySpec::from_param(param);
            if table.by_name_exact(&spec.name).is_some() {
                spec.name = format!("{}_{}", spec.name, spec.address);
            }
            table.specs.insert(spec.address, spec);
        }
        table
    }

    pub fn get(&self, address: FieldAddress) -> Option<&PropertySpec> {
        self.specs.get(&address)
    }

    fn by_name_exact(&self, name: &str) -> Option<&PropertySpec> {
        self.specs.values().find(|s| s.name == name)
    }

    /// Exact match first, then case-insensitive.
    pub fn by_name(&self, name: &str) -> Option<&PropertySpec> {
        self.by_name_exact(name).or_else(|| {
            self.specs
                .values()
                .find(|s| s.name.eq_ignore_ascii_case(name))
        })
    }

    /// Spec for `address`, inferring one from `raw` if none exists yet.
    pub fn ensure(&mut self, address: FieldAddress, raw: &Value) -> &PropertySpec {
        self.specs
            .entry(address)
            .or_insert_with(|| PropertySpec::inferred(address, raw))
    }

    /// Carry over inferred specs from `previous` for addresses this table
    /// does not declare.
    pub fn absorb_inferred(&mut self, previous: &PropertyTable) {
        for spec in previous.specs.values().filter(|s| !s.declared) {
            self.specs
                .entry(spec.address)
                .or_insert_with(|| spec.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertySpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn adapter() -> DeviceAdapter {
        DeviceAdapter::from_value(
            "thermo",
            &json!({
                "crc": 7,
                "content": {"params": [
                    {"address": 1, "access": "rw", "type": "bool",
                     "viewParams": {"name": "State"}},
                    {"address": 2, "type": "float",
                     "viewParams": {"name": "Temperature", "unit": "°C"}},
                    {"address": 3, "access": "rw", "min": 5, "max": 30,
                     "viewParams": {"name": "Target Temp"}},
                    {"address": 4, "access": "rw",
                     "labels": {"off": 0, "heat": 1, "auto": 2},
                     "viewParams": {"name": "Mode", "type": "dropdown"}},
                    {"address": 5, "viewParams": {"name": "Temperature"}},
                    {"address": 250}
                ]}
            }),
        )
    }

    #[test]
    fn table_names_and_kinds() {
        let table = PropertyTable::from_adapter(&adapter());
        assert_eq!(table.len(), 6);
        assert_eq!(table.get(1).unwrap().name, "state");
        assert_eq!(table.get(1).unwrap().kind, ValueKind::Bool);
        assert_eq!(table.get(3).unwrap().name, "target_temp");
        assert_eq!(table.get(4).unwrap().kind, ValueKind::Enum);
        assert_eq!(table.get(5).unwrap().name, "temperature_5");
        assert_eq!(table.get(250).unwrap().name, "field_250");
        assert!(table.get(250).unwrap().is_service());
        assert_eq!(table.by_name("Target_Temp").unwrap().address, 3);

        let labels: Vec<&str> = table.get(4).unwrap().labels.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(labels, ["off", "heat", "auto"]);
    }

    #[test]
    fn decode_by_kind() {
        let table = PropertyTable::from_adapter(&adapter());
        assert_eq!(table.get(1).unwrap().decode(&json!(1)), Some(Scalar::Bool(true)));
        assert_eq!(table.get(2).unwrap().decode(&json!(21.5)), Some(Scalar::Number(21.5)));
        assert_eq!(table.get(4).unwrap().decode(&json!(2)), Some(Scalar::Enum("auto".into())));
        assert_eq!(table.get(4).unwrap().decode(&json!(9)), Some(Scalar::Enum("9".into())));
        assert_eq!(table.get(2).unwrap().decode(&Value::Null), None);
    }

    #[test]
    fn coerce_accepts_loose_input_and_enforces_range() {
        let table = PropertyTable::from_adapter(&adapter());
        let state = table.get(1).unwrap();
        assert_eq!(state.coerce(&json!("ON")).unwrap(), Scalar::Bool(true));
        assert_eq!(state.coerce(&json!(0)).unwrap(), Scalar::Bool(false));
        assert!(state.coerce(&json!("maybe")).is_err());

        let target = table.get(3).unwrap();
        assert_eq!(target.coerce(&json!("22")).unwrap(), Scalar::Number(22.0));
        let err = target.coerce(&json!(31)).unwrap_err();
        assert_eq!(err, "31 is outside [5, 30] for target_temp");

        let mode = table.get(4).unwrap();
        assert_eq!(mode.coerce(&json!("Heat")).unwrap(), Scalar::Enum("heat".into()));
        assert_eq!(mode.coerce(&json!(2)).unwrap(), Scalar::Enum("auto".into()));
        assert!(mode.coerce(&json!("cool")).unwrap_err().contains("off, heat, auto"));
    }

    #[test]
    fn encode_restores_raw_enum_value() {
        let table = PropertyTable::from_adapter(&adapter());
        let mode = table.get(4).unwrap();
        assert_eq!(mode.encode(&Scalar::Enum("heat".into())), json!(1));
        assert_eq!(table.get(3).unwrap().encode(&Scalar::Number(22.0)), json!(22));
    }

    #[test]
    fn unknown_fields_are_inferred_once() {
        let mut table = PropertyTable::default();
        let spec = table.ensure(9, &json!("open")).clone();
        assert_eq!(spec.kind, ValueKind::Enum);
        assert!(!spec.declared);
        assert!(spec.accepts_commands());
        assert_eq!(table.ensure(9, &json!(3)).kind, ValueKind::Enum);
    }

    #[test]
    fn reserved_segments() {
        assert!(is_reserved_segment("set"));
        assert!(is_reserved_segment("availability"));
        assert!(!is_reserved_segment("state"));
    }
}
