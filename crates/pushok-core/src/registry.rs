// ── Device registry ──
//
// The single authoritative model of every device the hub has reported.
// Owned by the bridge loop, which is the only writer; readers observe
// consistent point-in-time snapshots through a `watch` channel that is
// rebuilt after every mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::model::{Device, DeviceId, DeviceListing, FieldUpdate, Property, PushUpdate, Scalar};

pub type DeviceSnapshot = Arc<Vec<Arc<Device>>>;

/// What a push changed, so the publisher can emit only the affected topics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PushOutcome {
    pub created: bool,
    pub came_online: bool,
    /// Properties whose value changed.
    pub changed: Vec<String>,
    /// Properties whose pending command was confirmed.
    pub acknowledged: Vec<String>,
}

impl PushOutcome {
    /// Changed or acknowledged properties, without duplicates.
    pub fn touched(&self) -> Vec<String> {
        let mut out = self.changed.clone();
        for name in &self.acknowledged {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        !self.created && !self.came_online && self.changed.is_empty() && self.acknowledged.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The confirmed value is the one last sent.
    Confirmed,
    /// A newer command is pending; the old confirmation does not count.
    Superseded,
    /// Nothing was pending for this property.
    NoPending,
    UnknownProperty,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ListingOutcome {
    pub created: bool,
    pub renamed: bool,
}

pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, Arc<Device>>,
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            devices: BTreeMap::new(),
            snapshot,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, device_id: &DeviceId) -> Option<Arc<Device>> {
        self.devices.get(device_id).cloned()
    }

    /// Consistent view of every device (cheap `Arc` clone).
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Resolve an inbound topic segment: device id first, then friendly
    /// name (exact, then case-insensitive).
    pub fn resolve(&self, segment: &str) -> Option<Arc<Device>> {
        if let Some(device) = self.devices.get(&DeviceId::new(segment)) {
            return Some(Arc::clone(device));
        }
        self.devices
            .values()
            .find(|d| d.friendly_name == segment)
            .or_else(|| {
                self.devices
                    .values()
                    .find(|d| d.friendly_name.eq_ignore_ascii_case(segment))
            })
            .cloned()
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Merge a partial push. Creates the device if unseen, marks it
    /// online and refreshes `last_seen`. Fields absent from the push keep
    /// their values; each field is applied last-write-wins on its
    /// timestamp. Fields flagged `ack` are command confirmations.
    pub fn apply_push(&mut self, update: &PushUpdate, now: DateTime<Utc>) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let entry = self.devices.entry(update.device_id.clone()).or_insert_with(|| {
            outcome.created = true;
            Arc::new(Device::new(update.device_id.clone()))
        });
        let device = Arc::make_mut(entry);
        if outcome.created {
            device.hub_id.clone_from(&update.hub_id);
        }

        device.last_seen = Some(now);
        if !device.online {
            device.online = true;
            outcome.came_online = true;
        }
        for field in &update.fields {
            apply_field(device, field, &mut outcome);
        }

        self.publish();
        outcome
    }

    /// Confirm a command: when `confirmed` is the pending value the
    /// property becomes acknowledged and the pending value is cleared.
    pub fn apply_command_ack(
        &mut self,
        device_id: &DeviceId,
        property: &str,
        confirmed: Scalar,
        at: DateTime<Utc>,
    ) -> AckOutcome {
        let Some(entry) = self.devices.get_mut(device_id) else {
            return AckOutcome::UnknownProperty;
        };
        let device = Arc::make_mut(entry);
        let Some(prop) = device.properties.get_mut(property) else {
            return AckOutcome::UnknownProperty;
        };
        let outcome = confirm(prop, confirmed, at);
        self.publish();
        outcome
    }

    /// Apply one device from a full hub snapshot. Never removes anything.
    pub fn apply_listing(&mut self, listing: DeviceListing, now: DateTime<Utc>) -> ListingOutcome {
        let mut outcome = ListingOutcome::default();
        let entry = self.devices.entry(listing.device_id.clone()).or_insert_with(|| {
            outcome.created = true;
            Arc::new(Device::new(listing.device_id.clone()))
        });
        let device = Arc::make_mut(entry);
        device.hub_id = listing.hub_id;

        if let Some(name) = listing.friendly_name.filter(|n| !n.trim().is_empty()) {
            if device.friendly_name != name {
                device.friendly_name = name;
                outcome.renamed = !outcome.created;
            }
        }
        device.model = listing.model;
        device.manufacturer = listing.manufacturer;
        device.driver = listing.driver;
        device.device_type = listing.device_type;
        device.description = listing.description;
        device.url = listing.url;
        if listing.link_quality.is_some() {
            device.link_quality = listing.link_quality;
        }
        device.last_seen = listing.last_seen.or(device.last_seen).or(Some(now));
        device.online = !listing.warning;

        if let Some(mut table) = listing.table {
            table.absorb_inferred(&device.table);
            device.table = table;
            rekey_properties(device);
        }

        let mut ignored = PushOutcome::default();
        for field in &listing.state {
            apply_field(device, field, &mut ignored);
        }

        self.publish();
        outcome
    }

    /// Record an outgoing command: the property becomes unacknowledged
    /// with `value` pending. Returns `false` for unknown devices.
    pub fn begin_command(
        &mut self,
        device_id: &DeviceId,
        property: &str,
        value: Scalar,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.devices.get_mut(device_id) else {
            return false;
        };
        let device = Arc::make_mut(entry);
        let Some(address) = device.table.by_name(property).map(|s| s.address) else {
            return false;
        };
        let prop = device
            .properties
            .entry(property.to_owned())
            .or_insert_with(|| Property::new(address, now));
        prop.acknowledged = false;
        prop.pending_value = Some(value);

        self.publish();
        true
    }

    /// Give up on a pending command. `acknowledged` stays `false`.
    /// Returns `true` if something was pending.
    pub fn expire_pending(&mut self, device_id: &DeviceId, property: &str) -> bool {
        let Some(entry) = self.devices.get_mut(device_id) else {
            return false;
        };
        let device = Arc::make_mut(entry);
        let Some(prop) = device.properties.get_mut(property) else {
            return false;
        };
        let was_pending = prop.pending_value.take().is_some();
        if was_pending {
            self.publish();
        }
        was_pending
    }

    /// Returns `true` if the device was online.
    pub fn mark_offline(&mut self, device_id: &DeviceId) -> bool {
        let changed = match self.devices.get_mut(device_id) {
            Some(entry) if entry.online => {
                Arc::make_mut(entry).online = false;
                true
            }
            _ => false,
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// Mark every device offline, keeping all property values. Returns
    /// the devices whose availability changed.
    pub fn mark_all_offline(&mut self) -> Vec<DeviceId> {
        let mut changed = Vec::new();
        for (id, entry) in &mut self.devices {
            if entry.online {
                Arc::make_mut(entry).online = false;
                changed.push(id.clone());
            }
        }
        if !changed.is_empty() {
            self.publish();
        }
        changed
    }

    fn publish(&self) {
        let values: Vec<Arc<Device>> = self.devices.values().cloned().collect();
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }
}

// ── Field merging ────────────────────────────────────────────────────

fn apply_field(device: &mut Device, field: &FieldUpdate, outcome: &mut PushOutcome) {
    let spec = device.table.ensure(field.address, &field.raw);
    let Some(value) = spec.decode(&field.raw) else {
        return;
    };
    let name = spec.name.clone();
    let prop = device
        .properties
        .entry(name.clone())
        .or_insert_with(|| Property::new(field.address, field.at));

    let before = prop.current_value.clone();
    if field.ack {
        if confirm(prop, value, field.at) == AckOutcome::Confirmed {
            outcome.acknowledged.push(name.clone());
        }
    } else {
        write_value(prop, value, field.at);
    }
    if prop.current_value != before {
        outcome.changed.push(name);
    }
}

/// Last-write-wins on the hub timestamp.
fn write_value(prop: &mut Property, value: Scalar, at: DateTime<Utc>) {
    if prop.current_value.is_some() && at < prop.last_updated {
        return;
    }
    prop.current_value = Some(value);
    prop.last_updated = at;
}

fn confirm(prop: &mut Property, confirmed: Scalar, at: DateTime<Utc>) -> AckOutcome {
    let outcome = match &prop.pending_value {
        Some(pending) if *pending == confirmed => {
            prop.pending_value = None;
            prop.acknowledged = true;
            AckOutcome::Confirmed
        }
        Some(_) => AckOutcome::Superseded,
        None => AckOutcome::NoPending,
    };
    write_value(prop, confirmed, at);
    outcome
}

/// Property names follow the table; re-key after the table changes.
fn rekey_properties(device: &mut Device) {
    let props = std::mem::take(&mut device.properties);
    for (old_name, prop) in props {
        let name = device
            .table
            .get(prop.address)
            .map_or(old_name, |spec| spec.name.clone());
        device.properties.insert(name, prop);
    }
}
