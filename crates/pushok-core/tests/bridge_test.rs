#![allow(clippy::unwrap_used)]

// End-to-end bridge scenarios: a recording MQTT sink and a fake hub
// commander around a real `Bridge`, driven event by event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use pushok_api::DeviceAdapter;
use pushok_core::{
    AckPolicy, Bridge, BrokerEvent, CoreError, DeviceId, DeviceListing, FieldUpdate, HubCommander,
    HubEvent, HubSnapshot, MqttSettings, MqttSink, OutboundMessage, PropertyTable, PropertyWrite,
    PushUpdate, ReconcileTrigger, Scalar,
};
use serde_json::{Value, json};
use tokio::time::Instant;

const PLUG: &str = "00158d0001234567";

// ── Fakes ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<OutboundMessage>>>);

impl Recorder {
    fn last(&self, topic: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| m.payload.clone())
    }

    fn history(&self, topic: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    fn topics(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|m| m.topic.clone()).collect()
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[async_trait]
impl MqttSink for Recorder {
    async fn publish(&self, message: OutboundMessage) -> Result<(), CoreError> {
        assert!(message.retain, "{} published unretained", message.topic);
        self.0.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeHub {
    sent: Arc<Mutex<Vec<PropertyWrite>>>,
    down: Arc<AtomicBool>,
}

impl FakeHub {
    fn sent(&self) -> Vec<PropertyWrite> {
        self.sent.lock().unwrap().clone()
    }
}

impl HubCommander for FakeHub {
    fn send_command(&self, write: &PropertyWrite) -> Result<(), CoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CoreError::Transport {
                message: "hub not connected".into(),
            });
        }
        self.sent.lock().unwrap().push(write.clone());
        Ok(())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

fn field(address: u16, raw: Value, ack: bool) -> FieldUpdate {
    FieldUpdate {
        address,
        raw,
        at: Utc::now(),
        ack,
    }
}

fn plug_listing() -> DeviceListing {
    let adapter = DeviceAdapter::from_value(
        "plug",
        &json!({"crc": 7, "content": {"type": "plug", "params": [
            {"address": 1, "access": "rw", "type": "bool", "viewParams": {"name": "state"}},
            {"address": 2, "type": "float", "viewParams": {"name": "power", "unit": "unit_power"}}
        ]}}),
    );
    DeviceListing {
        device_id: DeviceId::new(PLUG),
        hub_id: PLUG.into(),
        friendly_name: Some("Kitchen plug".into()),
        model: "TS011F".into(),
        manufacturer: "Tuya".into(),
        driver: Some("plug".into()),
        device_type: Some("plug".into()),
        description: None,
        url: None,
        link_quality: Some(120),
        last_seen: None,
        warning: false,
        table: Some(PropertyTable::from_adapter(&adapter)),
        state: vec![field(1, json!(true), false)],
    }
}

fn push(fields: Vec<FieldUpdate>) -> HubEvent {
    HubEvent::Push(PushUpdate {
        device_id: DeviceId::new(PLUG),
        hub_id: PLUG.into(),
        fields,
    })
}

fn message(topic: &str, payload: &str) -> BrokerEvent {
    BrokerEvent::Message {
        topic: topic.into(),
        payload: payload.as_bytes().to_vec(),
        retain: false,
    }
}

fn topic(suffix: &str) -> String {
    if suffix.is_empty() {
        format!("pushok_hub/{PLUG}")
    } else {
        format!("pushok_hub/{PLUG}/{suffix}")
    }
}

fn state_json(sink: &Recorder) -> Value {
    serde_json::from_str(&sink.last(&topic("")).unwrap()).unwrap()
}

async fn connected_bridge(ack: AckPolicy) -> (Bridge<Recorder, FakeHub>, Recorder, FakeHub) {
    let sink = Recorder::default();
    let hub = FakeHub::default();
    let mut bridge = Bridge::new(&MqttSettings::default(), ack, sink.clone(), hub.clone());
    bridge
        .handle_hub_event(HubEvent::Connected(HubSnapshot {
            devices: vec![plug_listing()],
        }))
        .await;
    (bridge, sink, hub)
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_publishes_everything_retained() {
    let (bridge, sink, _hub) = connected_bridge(AckPolicy::default()).await;

    assert_eq!(sink.last("pushok_hub/bridge/state").as_deref(), Some("online"));
    assert_eq!(sink.last(&topic("availability")).as_deref(), Some("online"));
    assert_eq!(sink.last(&topic("state")).as_deref(), Some("true"));
    assert_eq!(sink.last(&topic("ack/state")).as_deref(), Some("true"));
    assert_eq!(sink.last(&topic("name")).as_deref(), Some("Kitchen plug"));
    assert_eq!(
        state_json(&sink),
        json!({"state": true, "name": "Kitchen plug", "linkquality": 120})
    );

    let devices: Value = serde_json::from_str(&sink.last("pushok_hub/bridge/devices").unwrap()).unwrap();
    assert_eq!(devices[0]["ieee_address"], PLUG);
    assert!(
        sink.topics()
            .contains(&format!("homeassistant/switch/{PLUG}/1/config"))
    );
    assert_eq!(bridge.registry().len(), 1);
}

#[tokio::test]
async fn all_command_shapes_send_the_same_command() {
    let (mut bridge, _sink, hub) = connected_bridge(AckPolicy::default()).await;

    bridge.handle_broker_event(message(&topic("state"), "false")).await;
    bridge.handle_broker_event(message(&topic("state/set"), "false")).await;
    bridge.handle_broker_event(message(&topic("set"), r#"{"state": false}"#)).await;
    bridge.handle_broker_event(message(&topic(""), r#"{"state": false}"#)).await;

    let sent = hub.sent();
    assert_eq!(sent.len(), 4);
    let expected = PropertyWrite {
        device_id: DeviceId::new(PLUG),
        hub_id: PLUG.into(),
        property: "state".into(),
        address: 1,
        value: Scalar::Bool(false),
        wire: json!(false),
    };
    for write in sent {
        assert_eq!(write, expected);
    }
}

#[tokio::test]
async fn friendly_name_addresses_the_device() {
    let (mut bridge, _sink, hub) = connected_bridge(AckPolicy::default()).await;

    bridge
        .handle_broker_event(message("pushok_hub/Kitchen plug/set", r#"{"state": "OFF"}"#))
        .await;

    let sent = hub.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].device_id, DeviceId::new(PLUG));
    assert_eq!(sent[0].value, Scalar::Bool(false));
}

#[tokio::test]
async fn partial_push_keeps_other_properties() {
    let (mut bridge, sink, _hub) = connected_bridge(AckPolicy::default()).await;
    sink.clear();

    bridge.handle_hub_event(push(vec![field(2, json!(45.2), false)])).await;

    let state = state_json(&sink);
    assert_eq!(state["power"], json!(45.2));
    assert_eq!(state["state"], json!(true));
    assert_eq!(sink.last(&topic("power")).as_deref(), Some("45.2"));
    assert!(sink.last(&topic("availability")).is_none());
}

#[tokio::test]
async fn hub_drop_and_reconnect_flips_availability_only() {
    let (mut bridge, sink, _hub) = connected_bridge(AckPolicy::default()).await;
    let mut reports = bridge.subscribe_reconciliation();
    let before = state_json(&sink);

    bridge
        .handle_hub_event(HubEvent::Disconnected {
            reason: "connection reset".into(),
        })
        .await;
    assert_eq!(sink.last("pushok_hub/bridge/state").as_deref(), Some("offline"));
    assert_eq!(sink.last(&topic("availability")).as_deref(), Some("offline"));
    let device = bridge.registry().get(&DeviceId::new(PLUG)).unwrap();
    assert!(!device.online);
    assert_eq!(device.property("state").unwrap().current_value, Some(Scalar::Bool(true)));

    sink.clear();
    bridge
        .handle_hub_event(HubEvent::Connected(HubSnapshot {
            devices: vec![plug_listing()],
        }))
        .await;

    let report = reports.recv().await.unwrap();
    assert_eq!(report.trigger, ReconcileTrigger::HubConnected);
    assert!(report.is_complete());
    assert_eq!(sink.history("pushok_hub/bridge/state"), ["online"]);
    assert_eq!(sink.history(&topic("availability")), ["online"]);
    assert_eq!(sink.last(&topic("state")).as_deref(), Some("true"));
    assert_eq!(state_json(&sink), before);
}

#[tokio::test]
async fn ack_tracks_the_exact_value_last_sent() {
    let (mut bridge, sink, _hub) = connected_bridge(AckPolicy::default()).await;

    bridge.handle_broker_event(message(&topic("state/set"), "false")).await;
    assert_eq!(sink.last(&topic("ack/state")).as_deref(), Some("false"));
    assert_eq!(bridge.pending_acks(), 1);

    // A confirmation of some other value does not count.
    bridge.handle_hub_event(push(vec![field(1, json!(true), true)])).await;
    assert_eq!(sink.last(&topic("ack/state")).as_deref(), Some("false"));
    assert_eq!(bridge.pending_acks(), 1);

    bridge.handle_hub_event(push(vec![field(1, json!(false), true)])).await;
    assert_eq!(sink.last(&topic("ack/state")).as_deref(), Some("true"));
    assert_eq!(sink.last(&topic("state")).as_deref(), Some("false"));
    assert_eq!(bridge.pending_acks(), 0);

    let device = bridge.registry().get(&DeviceId::new(PLUG)).unwrap();
    let state = device.property("state").unwrap();
    assert!(state.acknowledged);
    assert_eq!(state.pending_value, None);
}

#[tokio::test]
async fn unconfirmed_command_is_retried_then_abandoned() {
    let policy = AckPolicy {
        timeout: Duration::from_secs(10),
        retries: 1,
    };
    let (mut bridge, sink, hub) = connected_bridge(policy).await;
    let start = Instant::now();

    bridge.handle_broker_event(message(&topic("state/set"), "OFF")).await;
    assert_eq!(hub.sent().len(), 1);

    bridge.handle_ack_deadlines(start + Duration::from_secs(11)).await;
    assert_eq!(hub.sent().len(), 2);
    assert_eq!(hub.sent()[0], hub.sent()[1]);

    bridge.handle_ack_deadlines(start + Duration::from_secs(22)).await;
    assert_eq!(hub.sent().len(), 2);
    assert_eq!(bridge.pending_acks(), 0);
    assert_eq!(sink.last(&topic("ack/state")).as_deref(), Some("false"));

    let device = bridge.registry().get(&DeviceId::new(PLUG)).unwrap();
    let state = device.property("state").unwrap();
    assert!(!state.acknowledged);
    assert_eq!(state.pending_value, None);
}

#[tokio::test]
async fn malformed_and_foreign_messages_are_dropped() {
    let (mut bridge, sink, hub) = connected_bridge(AckPolicy::default()).await;

    // Echo of our own retained state publish.
    let own_state = sink.last(&topic("")).unwrap();
    bridge.handle_broker_event(message(&topic(""), &own_state)).await;
    // Retained leftovers from a previous run.
    bridge
        .handle_broker_event(BrokerEvent::Message {
            topic: topic("state/set"),
            payload: b"true".to_vec(),
            retain: true,
        })
        .await;
    // Unknown property, wrong type, read-only property, unknown device.
    bridge.handle_broker_event(message(&topic("bogus/set"), "1")).await;
    bridge.handle_broker_event(message(&topic("state/set"), "maybe")).await;
    bridge.handle_broker_event(message(&topic("power/set"), "10")).await;
    bridge.handle_broker_event(message("pushok_hub/ffffffffffffffff/set", r#"{"state": true}"#)).await;
    // A multi-property command with one bad value sends nothing.
    bridge
        .handle_broker_event(message(&topic("set"), r#"{"state": true, "bogus": 1}"#))
        .await;

    assert!(hub.sent().is_empty());
    assert_eq!(bridge.pending_acks(), 0);
}

#[tokio::test]
async fn command_while_hub_down_changes_nothing() {
    let (mut bridge, sink, hub) = connected_bridge(AckPolicy::default()).await;
    hub.down.store(true, Ordering::SeqCst);
    sink.clear();

    bridge.handle_broker_event(message(&topic("state/set"), "false")).await;

    assert_eq!(bridge.pending_acks(), 0);
    assert!(sink.last(&topic("ack/state")).is_none());
}

#[tokio::test]
async fn push_for_unknown_device_creates_it() {
    let (mut bridge, sink, _hub) = connected_bridge(AckPolicy::default()).await;
    sink.clear();

    bridge
        .handle_hub_event(HubEvent::Push(PushUpdate {
            device_id: DeviceId::new("0x00158D00AABBCCDD"),
            hub_id: "0x00158D00AABBCCDD".into(),
            fields: vec![field(5, json!(21.5), false)],
        }))
        .await;

    assert_eq!(bridge.registry().len(), 2);
    assert_eq!(
        sink.last("pushok_hub/00158d00aabbccdd/availability").as_deref(),
        Some("online")
    );
    assert_eq!(
        sink.last("pushok_hub/00158d00aabbccdd/field_5").as_deref(),
        Some("21.5")
    );
    let devices: Value = serde_json::from_str(&sink.last("pushok_hub/bridge/devices").unwrap()).unwrap();
    assert_eq!(devices.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn broker_reconnect_republishes_from_registry() {
    let (mut bridge, sink, _hub) = connected_bridge(AckPolicy::default()).await;
    bridge
        .handle_hub_event(HubEvent::Disconnected {
            reason: "gone".into(),
        })
        .await;
    sink.clear();

    bridge.handle_broker_event(BrokerEvent::Connected).await;

    assert_eq!(sink.last("pushok_hub/bridge/state").as_deref(), Some("offline"));
    assert_eq!(sink.last(&topic("availability")).as_deref(), Some("offline"));
    assert_eq!(sink.last(&topic("state")).as_deref(), Some("true"));
}

#[tokio::test]
async fn publishes_replayed_after_broker_reconnect_are_not_commands() {
    let (mut bridge, _sink, hub) = connected_bridge(AckPolicy::default()).await;

    bridge
        .handle_broker_event(BrokerEvent::Disconnected {
            reason: "connection reset".into(),
        })
        .await;
    bridge.handle_hub_event(push(vec![field(1, json!(false), false)])).await;
    bridge.handle_hub_event(push(vec![field(1, json!(true), false)])).await;
    bridge.handle_broker_event(BrokerEvent::Connected).await;

    // Queued publishes from the outage arrive first, then the republish.
    for payload in ["false", "true", "true"] {
        bridge.handle_broker_event(message(&topic("state"), payload)).await;
    }

    assert!(hub.sent().is_empty());
    assert_eq!(bridge.pending_acks(), 0);
}

#[tokio::test]
async fn commands_use_the_hub_spelling_of_the_id() {
    let sink = Recorder::default();
    let hub = FakeHub::default();
    let mut bridge = Bridge::new(&MqttSettings::default(), AckPolicy::default(), sink, hub.clone());
    let listing = DeviceListing {
        device_id: DeviceId::new("00158D0001234567"),
        hub_id: "00158D0001234567".into(),
        ..plug_listing()
    };
    bridge
        .handle_hub_event(HubEvent::Connected(HubSnapshot {
            devices: vec![listing],
        }))
        .await;

    bridge.handle_broker_event(message(&topic("state/set"), "false")).await;

    let sent = hub.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].device_id.as_str(), PLUG);
    assert_eq!(sent[0].hub_id, "00158D0001234567");
}

#[tokio::test]
async fn shutdown_announces_offline() {
    let (mut bridge, sink, _hub) = connected_bridge(AckPolicy::default()).await;
    bridge.shutdown().await;
    assert_eq!(sink.last("pushok_hub/bridge/state").as_deref(), Some("offline"));
}
