// ── Outbound MQTT publishing ──
//
// Message construction lives in `StatePublisher` and `DiscoveryPublisher`;
// delivery goes through an `MqttSink`, wrapped by the `Outbox` that
// remembers what was sent so the broker's echo of it is not mistaken
// for a command.

mod discovery;
mod echo;
mod state;

use async_trait::async_trait;

pub use discovery::DiscoveryPublisher;
pub use echo::EchoFilter;
pub use state::StatePublisher;

use crate::error::CoreError;
use crate::model::is_reserved_segment;
use crate::router::{BRIDGE_SEGMENT, OutboundMessage};

/// Anything that can deliver a message to the broker.
#[async_trait]
pub trait MqttSink: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), CoreError>;
}

pub struct Outbox<S> {
    sink: S,
    base: String,
    echo: EchoFilter,
}

impl<S: MqttSink> Outbox<S> {
    pub fn new(sink: S, base: impl Into<String>) -> Self {
        Self {
            sink,
            base: base.into(),
            echo: EchoFilter::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Publish one message. Only a publish the sink accepted can come
    /// back as an echo, so nothing is remembered on failure.
    pub async fn send(&mut self, message: OutboundMessage) -> Result<(), CoreError> {
        let remember = self
            .is_command_topic(&message.topic)
            .then(|| (message.topic.clone(), message.payload.clone()));
        self.sink.publish(message).await?;
        if let Some((topic, payload)) = remember {
            self.echo.record(&topic, &payload);
        }
        Ok(())
    }

    /// Send in order, stopping at the first failure.
    pub async fn send_all(
        &mut self,
        messages: impl IntoIterator<Item = OutboundMessage>,
    ) -> Result<(), CoreError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Consume the echo of one of our own publishes.
    pub fn is_echo(&mut self, topic: &str, payload: &str) -> bool {
        self.echo.consume(topic, payload)
    }

    /// Topics we publish on that the router would also read as commands:
    /// `{base}/{device}` and `{base}/{device}/{property}`.
    fn is_command_topic(&self, topic: &str) -> bool {
        let Some(rest) = topic
            .strip_prefix(self.base.as_str())
            .and_then(|r| r.strip_prefix('/'))
        else {
            return false;
        };
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [device] => *device != BRIDGE_SEGMENT,
            [device, property] => *device != BRIDGE_SEGMENT && !is_reserved_segment(property),
            _ => false,
        }
    }
}
