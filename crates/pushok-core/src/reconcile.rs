// ── Reconciliation ──
//
// Full re-announcement after a (re)connect: bridge status, the bridge
// device list, then every known device's state, per-property, ack,
// name, availability and discovery topics. Each step is retried once
// and a failing device never stops the others. Completion is reported
// on a broadcast channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::model::DeviceId;
use crate::publish::{DiscoveryPublisher, MqttSink, Outbox, StatePublisher};
use crate::registry::DeviceSnapshot;
use crate::router::OutboundMessage;

const ATTEMPTS: usize = 2;
const REPORT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReconcileTrigger {
    HubConnected,
    BrokerConnected,
}

/// Terminal event of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub trigger: ReconcileTrigger,
    pub devices: usize,
    pub published: usize,
    pub bridge_announced: bool,
    pub failed_devices: Vec<DeviceId>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.bridge_announced && self.failed_devices.is_empty()
    }
}

pub struct Reconciler {
    state: StatePublisher,
    discovery: DiscoveryPublisher,
    reports: broadcast::Sender<ReconcileReport>,
}

impl Reconciler {
    pub fn new(state: StatePublisher, discovery: DiscoveryPublisher) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            state,
            discovery,
            reports,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileReport> {
        self.reports.subscribe()
    }

    /// Republish everything in `snapshot`. `hub_online` selects the
    /// bridge status; a broker reconnect while the hub is down still
    /// refreshes retained device topics, with the bridge `offline`.
    pub async fn run<S: MqttSink>(
        &self,
        trigger: ReconcileTrigger,
        hub_online: bool,
        snapshot: &DeviceSnapshot,
        outbox: &mut Outbox<S>,
    ) -> ReconcileReport {
        debug!(%trigger, devices = snapshot.len(), "reconciliation started");
        let mut report = ReconcileReport {
            trigger,
            devices: snapshot.len(),
            published: 0,
            bridge_announced: false,
            failed_devices: Vec::new(),
        };

        let bridge = vec![
            self.state.bridge_state(hub_online),
            self.state.bridge_devices(snapshot.iter().map(Arc::as_ref)),
        ];
        match publish_with_retry(outbox, &bridge).await {
            Ok(n) => {
                report.published += n;
                report.bridge_announced = true;
            }
            Err(e) => warn!(error = %e, "could not announce bridge status"),
        }

        for device in snapshot.iter() {
            let mut messages = self.state.full(device);
            messages.extend(self.discovery.device_configs(device));
            match publish_with_retry(outbox, &messages).await {
                Ok(n) => report.published += n,
                Err(e) => {
                    warn!(device_id = %device.device_id, error = %e, "device republish failed");
                    report.failed_devices.push(device.device_id.clone());
                }
            }
        }

        info!(
            %trigger,
            devices = report.devices,
            published = report.published,
            failed = report.failed_devices.len(),
            "reconciliation finished"
        );
        let _ = self.reports.send(report.clone());
        report
    }
}

/// Publish a group of messages in order, giving each one a second try
/// on failure. Stops at the first message that fails both times.
async fn publish_with_retry<S: MqttSink>(
    outbox: &mut Outbox<S>,
    messages: &[OutboundMessage],
) -> Result<usize, CoreError> {
    for message in messages {
        let mut attempt = 1;
        while let Err(e) = outbox.send(message.clone()).await {
            debug!(attempt, topic = %message.topic, error = %e, "publish attempt failed");
            if attempt == ATTEMPTS {
                return Err(e);
            }
            attempt += 1;
        }
    }
    Ok(messages.len())
}
