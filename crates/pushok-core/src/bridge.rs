// ── Bridge loop ──
//
// The single serializing loop. Hub events, broker events and ack
// deadlines all arrive here, so the registry has exactly one writer and
// every publish reflects a consistent device state.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ack::{AckExpiry, AckTracker};
use crate::broker::{self, BrokerEvent};
use crate::config::{AckPolicy, BridgeConfig, MqttSettings};
use crate::error::CoreError;
use crate::hub::{HUB_EVENT_CAPACITY, HubCommander, HubEvent, HubLink, HubSnapshot};
use crate::model::{DeviceId, PushUpdate};
use crate::publish::{DiscoveryPublisher, MqttSink, Outbox, StatePublisher};
use crate::reconcile::{ReconcileReport, ReconcileTrigger, Reconciler};
use crate::registry::{DeviceRegistry, DeviceSnapshot};
use crate::router::{OutboundMessage, PropertyWrite, TopicRouter};

/// Owns the device registry and everything that reads or writes it.
///
/// `S` delivers to the broker and `H` delivers to the hub; both are traits
/// so the loop can be driven directly in tests, one event at a time.
pub struct Bridge<S, H> {
    registry: DeviceRegistry,
    router: TopicRouter,
    state: StatePublisher,
    discovery: DiscoveryPublisher,
    reconciler: Reconciler,
    outbox: Outbox<S>,
    hub: H,
    acks: AckTracker,
    /// Selects the bridge status on a broker-triggered reconciliation.
    hub_connected: bool,
}

impl<S: MqttSink, H: HubCommander> Bridge<S, H> {
    /// Build a bridge with an empty registry. Nothing is published until
    /// the first hub or broker connect.
    pub fn new(mqtt: &MqttSettings, ack: AckPolicy, sink: S, hub: H) -> Self {
        let router = TopicRouter::new(mqtt.base_topic.clone(), mqtt.discovery_prefix.clone());
        let state = StatePublisher::new(router.clone());
        let discovery = DiscoveryPublisher::new(router.clone(), mqtt.discovery_enabled);
        Self {
            registry: DeviceRegistry::new(),
            reconciler: Reconciler::new(state.clone(), discovery.clone()),
            outbox: Outbox::new(sink, router.base()),
            router,
            state,
            discovery,
            hub,
            acks: AckTracker::new(ack),
            hub_connected: false,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The broker sink, for callers that need to disconnect it.
    pub fn sink(&self) -> &S {
        self.outbox.sink()
    }

    /// Registry snapshots, replaced after every mutation.
    pub fn subscribe_devices(&self) -> watch::Receiver<DeviceSnapshot> {
        self.registry.subscribe()
    }

    /// One report per finished reconciliation pass.
    pub fn subscribe_reconciliation(&self) -> broadcast::Receiver<ReconcileReport> {
        self.reconciler.subscribe()
    }

    /// Commands sent but not yet confirmed or abandoned.
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Process events until cancelled or until either link goes away,
    /// then announce the bridge offline.
    ///
    /// Polling is biased: cancellation, then hub events, then broker
    /// events, then ack deadlines.
    pub async fn run(
        mut self,
        mut hub_events: mpsc::Receiver<HubEvent>,
        mut broker_events: mpsc::UnboundedReceiver<BrokerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.acks.next_deadline();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = hub_events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_hub_event(event).await;
                }
                event = broker_events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_broker_event(event).await;
                }
                () = ack_deadline(deadline) => self.handle_ack_deadlines(Instant::now()).await,
            }
        }
        self.shutdown().await;
    }

    // ── Hub side ─────────────────────────────────────────────────────

    /// Apply one hub event to the registry and publish what changed.
    ///
    /// A snapshot merges into the registry and triggers a full
    /// reconciliation. A push publishes only the touched properties and
    /// settles matching acknowledgments. A disconnect marks every device
    /// offline but keeps its last known values.
    pub async fn handle_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected(snapshot) => self.on_hub_connected(snapshot).await,
            HubEvent::Push(update) => self.on_push(&update).await,
            HubEvent::Disconnected { reason } => self.on_hub_disconnected(&reason).await,
        }
    }

    /// Merge a fresh hub snapshot, then republish everything.
    async fn on_hub_connected(&mut self, snapshot: HubSnapshot) {
        self.hub_connected = true;
        let now = Utc::now();
        for listing in snapshot.devices {
            let device_id = listing.device_id.clone();
            let outcome = self.registry.apply_listing(listing, now);
            if outcome.created {
                debug!(device_id = %device_id, "device discovered");
            } else if outcome.renamed {
                info!(device_id = %device_id, "device renamed on the hub");
            }
        }
        let snapshot = self.registry.snapshot();
        self.reconciler
            .run(ReconcileTrigger::HubConnected, true, &snapshot, &mut self.outbox)
            .await;
    }

    /// Partial update for one device. An unknown id creates the device.
    async fn on_push(&mut self, update: &PushUpdate) {
        let outcome = self.registry.apply_push(update, Utc::now());
        let Some(device) = self.registry.get(&update.device_id) else {
            return;
        };
        for name in &outcome.acknowledged {
            self.acks.confirm(&device.device_id, name);
        }

        let mut messages = Vec::new();
        if outcome.created {
            info!(device_id = %device.device_id, "new device reported by hub");
            messages.extend(self.discovery.device_configs(&device));
            messages.push(self.state.bridge_devices(self.registry.snapshot().iter().map(Arc::as_ref)));
        }
        if outcome.came_online {
            messages.push(self.state.availability(&device));
        }
        let touched = outcome.touched();
        if !touched.is_empty() {
            messages.extend(self.state.property_changes(&device, &touched));
        }
        self.publish(messages).await;
    }

    async fn on_hub_disconnected(&mut self, reason: &str) {
        self.hub_connected = false;
        let went_offline = self.registry.mark_all_offline();
        warn!(reason, devices = went_offline.len(), "hub link lost; devices offline");

        let mut messages = vec![self.state.bridge_state(false)];
        messages.extend(
            went_offline
                .iter()
                .filter_map(|id| self.registry.get(id))
                .map(|device| self.state.availability(&device)),
        );
        self.publish(messages).await;
    }

    // ── Broker side ──────────────────────────────────────────────────

    /// Handle one broker event.
    ///
    /// A (re)connect republishes the registry. Echo records survive it,
    /// as publishes queued during the outage arrive afterwards. Retained messages and echoes of our own publishes are
    /// dropped; anything else is parsed as a command.
    pub async fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                let snapshot = self.registry.snapshot();
                self.reconciler
                    .run(
                        ReconcileTrigger::BrokerConnected,
                        self.hub_connected,
                        &snapshot,
                        &mut self.outbox,
                    )
                    .await;
            }
            BrokerEvent::Disconnected { reason } => debug!(reason = %reason, "broker session lost"),
            BrokerEvent::Message { topic, payload, retain } => {
                if retain {
                    trace!(topic = %topic, "ignoring retained message");
                    return;
                }
                if self.outbox.is_echo(&topic, &String::from_utf8_lossy(&payload)) {
                    trace!(topic = %topic, "ignoring echo of own publish");
                    return;
                }
                self.on_command(&topic, &payload).await;
            }
        }
    }

    /// Translate an inbound message into hub writes and send them.
    /// A message that fails to parse or resolve sends nothing.
    async fn on_command(&mut self, topic: &str, payload: &[u8]) {
        let writes = match self
            .router
            .parse(topic, payload)
            .and_then(|command| match command {
                Some(command) => self.router.resolve(topic, &command, &self.registry),
                None => Ok(Vec::new()),
            }) {
            Ok(writes) => writes,
            Err(e) => {
                warn!(error = %e, "dropping inbound message");
                return;
            }
        };

        for write in writes {
            self.dispatch(write).await;
        }
    }

    /// Send one write to the hub and mark the property unacknowledged
    /// until the hub confirms it.
    async fn dispatch(&mut self, write: PropertyWrite) {
        if let Err(e) = self.hub.send_command(&write) {
            warn!(device_id = %write.device_id, property = %write.property, error = %e, "command not sent");
            return;
        }
        if !self
            .registry
            .begin_command(&write.device_id, &write.property, write.value.clone(), Utc::now())
        {
            return;
        }
        let ack = self.ack_message(&write.device_id, &write.property);
        self.acks.track(write, Instant::now());
        self.publish(ack).await;
    }

    // ── Acknowledgments ──────────────────────────────────────────────

    /// Retry or abandon every command whose deadline is at or before
    /// `now`. An abandoned command clears the pending value and
    /// republishes the property's ack topic.
    pub async fn handle_ack_deadlines(&mut self, now: Instant) {
        for expiry in self.acks.expired(now) {
            match expiry {
                AckExpiry::Retry(write) => {
                    debug!(device_id = %write.device_id, property = %write.property, "re-sending unacknowledged command");
                    if let Err(e) = self.hub.send_command(&write) {
                        warn!(device_id = %write.device_id, error = %e, "command retry not sent");
                    }
                }
                AckExpiry::GaveUp(write) => {
                    self.registry.expire_pending(&write.device_id, &write.property);
                    let err = CoreError::AckTimeout {
                        device_id: write.device_id.to_string(),
                        property: write.property.clone(),
                    };
                    warn!(error = %err, "command unconfirmed");
                    let ack = self.ack_message(&write.device_id, &write.property);
                    self.publish(ack).await;
                }
            }
        }
    }

    // ── Output ───────────────────────────────────────────────────────

    fn ack_message(&self, device_id: &DeviceId, property: &str) -> Option<OutboundMessage> {
        let device = self.registry.get(device_id)?;
        self.state.ack(&device, property)
    }

    /// Broker failures are logged only; the next broker connect
    /// republishes everything.
    async fn publish(&mut self, messages: impl IntoIterator<Item = OutboundMessage>) {
        if let Err(e) = self.outbox.send_all(messages).await {
            warn!(error = %e, "publish failed");
        }
    }

    /// Announce the bridge offline. The retained last will covers an
    /// unclean exit.
    pub async fn shutdown(&mut self) {
        info!("bridge shutting down");
        let offline = self.state.bridge_state(false);
        self.publish([offline]).await;
    }
}

/// Sleeps until `at`, or forever when nothing is pending.
async fn ack_deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Wiring ───────────────────────────────────────────────────────────

/// Run the whole bridge until `cancel` fires.
///
/// Spawns the hub link and the broker event loop, drives a [`Bridge`]
/// over their channels, then disconnects from the broker and waits for
/// both tasks. Returns the hub link's fatal error (rejected credentials)
/// if that is what stopped it.
///
/// # Errors
///
/// Fails up front on unusable credentials or broker settings, and
/// afterwards with whatever ended the hub link.
pub async fn run_bridge(config: BridgeConfig, cancel: CancellationToken) -> Result<(), CoreError> {
    let router = TopicRouter::new(config.mqtt.base_topic.clone(), config.mqtt.discovery_prefix.clone());
    let (hub_tx, hub_rx) = mpsc::channel(HUB_EVENT_CAPACITY);
    let (link, hub) = HubLink::new(&config, hub_tx)?;
    let (sink, broker_link) = broker::connect(&config.mqtt, &router)?;
    let (broker_tx, broker_rx) = mpsc::unbounded_channel();

    let stop = cancel.child_token();
    let hub_task = tokio::spawn(link.run(stop.clone()));
    let broker_task = tokio::spawn(broker_link.run(broker_tx, stop.clone()));

    info!(
        base_topic = %config.mqtt.base_topic,
        hub = %config.credentials.host,
        broker = %config.mqtt.host,
        "bridge started"
    );
    Bridge::new(&config.mqtt, config.ack, sink.clone(), hub)
        .run(hub_rx, broker_rx, stop.clone())
        .await;

    if let Err(e) = sink.disconnect() {
        debug!(error = %e, "broker disconnect not queued");
    }
    stop.cancel();

    let hub_result = hub_task
        .await
        .map_err(|e| CoreError::Internal(format!("hub task failed: {e}")))?;
    if let Err(e) = broker_task.await {
        warn!(error = %e, "broker task failed");
    }
    hub_result
}
