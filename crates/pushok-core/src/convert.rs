// ── API-to-domain conversions ──
//
// Turns raw `pushok_api` payloads into the normalized inputs the
// registry consumes: identifiers lowercased, timestamps resolved,
// adapters folded into property tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use pushok_api::{
    DeviceAdapter, DeviceAttributes, DeviceDescription, DeviceState, FieldAddress, ObjectUpdate,
    PropertyValue,
};

use crate::model::{DeviceId, DeviceListing, FieldUpdate, PropertyTable, PushUpdate};

/// Hub timestamps above this are milliseconds, below are seconds.
const MILLIS_THRESHOLD: f64 = 1e12;

/// Resolve a hub timestamp; falls back to `now` when absent or invalid.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn hub_time(time: Option<f64>, now: DateTime<Utc>) -> DateTime<Utc> {
    time.filter(|t| t.is_finite() && *t > 0.0)
        .and_then(|t| {
            let millis = if t > MILLIS_THRESHOLD { t } else { t * 1000.0 };
            DateTime::from_timestamp_millis(millis as i64)
        })
        .unwrap_or(now)
}

fn field_updates(
    props: &BTreeMap<FieldAddress, PropertyValue>,
    now: DateTime<Utc>,
) -> Vec<FieldUpdate> {
    props
        .iter()
        .map(|(address, pv)| FieldUpdate {
            address: *address,
            raw: pv.value.clone(),
            at: hub_time(pv.time, now),
            ack: pv.ack,
        })
        .collect()
}

pub fn push_update(update: &ObjectUpdate, now: DateTime<Utc>) -> PushUpdate {
    PushUpdate {
        device_id: DeviceId::new(&update.id),
        hub_id: update.id.clone(),
        fields: field_updates(&update.props, now),
    }
}

/// Assemble one snapshot entry from the four hub replies that describe
/// a device.
pub fn device_listing(
    desc: DeviceDescription,
    state: &DeviceState,
    attributes: DeviceAttributes,
    adapter: Option<&DeviceAdapter>,
    now: DateTime<Utc>,
) -> DeviceListing {
    // Snapshot values are current state, never command confirmations.
    let mut fields = field_updates(&state.properties, now);
    for field in &mut fields {
        field.ack = false;
    }

    DeviceListing {
        device_id: DeviceId::new(&desc.id),
        hub_id: desc.id,
        friendly_name: attributes.name,
        model: desc.model,
        manufacturer: desc.manufacturer,
        driver: desc.driver,
        device_type: adapter.and_then(|a| a.device_type.clone()),
        description: adapter.and_then(|a| a.description.clone()),
        url: adapter.and_then(|a| a.url.clone()),
        link_quality: desc.lqi,
        last_seen: desc.last_seen.map(|t| hub_time(Some(t), now)),
        warning: desc.warning,
        table: adapter.map(PropertyTable::from_adapter),
        state: fields,
    }
}
