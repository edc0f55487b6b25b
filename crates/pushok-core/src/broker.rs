// ── Broker link ──
//
// rumqttc client plus the event-loop task that drives it. The task
// re-subscribes on every ConnAck, forwards inbound publishes, and
// reports connection transitions. rumqttc reconnects on the next poll
// after an error; we only pace the retries.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::MqttSettings;
use crate::error::CoreError;
use crate::publish::MqttSink;
use crate::router::{OutboundMessage, TopicRouter, availability};

const REQUEST_CAPACITY: usize = 1024;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected { reason: String },
    Message { topic: String, payload: Vec<u8>, retain: bool },
}

/// Client options: keep-alive, optional login, and a retained
/// `{base}/bridge/state = offline` last will.
pub fn mqtt_options(settings: &MqttSettings, router: &TopicRouter) -> Result<MqttOptions, CoreError> {
    if settings.client_id.trim().is_empty() {
        return Err(CoreError::Config {
            message: "mqtt client id must not be empty".into(),
        });
    }
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    if let Some(username) = &settings.username {
        let password = settings
            .password
            .as_ref()
            .map(|p| p.expose_secret().to_owned())
            .unwrap_or_default();
        options.set_credentials(username.clone(), password);
    }
    options.set_last_will(LastWill::new(
        router.bridge_state_topic(),
        availability(false),
        QoS::AtLeastOnce,
        true,
    ));
    Ok(options)
}

/// Build the client half and the event-loop half.
pub fn connect(settings: &MqttSettings, router: &TopicRouter) -> Result<(MqttClientSink, BrokerLink), CoreError> {
    let options = mqtt_options(settings, router)?;
    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let link = BrokerLink {
        client: client.clone(),
        eventloop,
        subscriptions: router.subscriptions(),
    };
    Ok((MqttClientSink { client }, link))
}

// ── Sink ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MqttClientSink {
    client: AsyncClient,
}

impl MqttClientSink {
    /// Queue a clean disconnect; the event loop flushes it during its
    /// shutdown grace period.
    pub fn disconnect(&self) -> Result<(), CoreError> {
        Ok(self.client.try_disconnect()?)
    }
}

#[async_trait]
impl MqttSink for MqttClientSink {
    /// Never blocks the caller: a full request queue is a failed publish,
    /// and reconciliation repairs it on the next broker connect.
    async fn publish(&self, message: OutboundMessage) -> Result<(), CoreError> {
        trace!(topic = %message.topic, retain = message.retain, "publish");
        self.client
            .try_publish(message.topic, QoS::AtLeastOnce, message.retain, message.payload.into_bytes())?;
        Ok(())
    }
}

// ── Event loop ───────────────────────────────────────────────────────

pub struct BrokerLink {
    client: AsyncClient,
    eventloop: EventLoop,
    subscriptions: Vec<String>,
}

impl BrokerLink {
    /// Poll until cancelled, then keep polling briefly so queued
    /// publishes and the disconnect reach the broker.
    pub async fn run(mut self, events: mpsc::UnboundedSender<BrokerEvent>, cancel: CancellationToken) {
        let mut connected = false;

        loop {
            let polled = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        warn!(code = ?ack.code, "broker refused connection");
                        continue;
                    }
                    info!("broker connected");
                    self.subscribe();
                    connected = true;
                    let _ = events.send(BrokerEvent::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = events.send(BrokerEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    if connected {
                        connected = false;
                        let _ = events.send(BrokerEvent::Disconnected { reason: e.to_string() });
                    }
                    warn!(error = %e, "broker connection error");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.drain()).await.is_err() {
            debug!("broker shutdown grace elapsed");
        }
    }

    fn subscribe(&self) {
        for filter in &self.subscriptions {
            match self.client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                Ok(()) => debug!(filter = %filter, "subscribed"),
                Err(e) => warn!(filter = %filter, error = %e, "subscribe failed"),
            }
        }
    }

    async fn drain(&mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}
