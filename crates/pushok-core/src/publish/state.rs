// ── State publisher ──

use serde::Serialize;

use crate::model::Device;
use crate::router::{OutboundMessage, TopicRouter, availability};

/// Builds the state-side messages for registry changes.
#[derive(Debug, Clone)]
pub struct StatePublisher {
    router: TopicRouter,
}

#[derive(Debug, Serialize)]
struct DeviceSummary<'a> {
    ieee_address: &'a str,
    friendly_name: &'a str,
    model: &'a str,
    manufacturer: &'a str,
    online: bool,
    definition: Option<Definition<'a>>,
}

#[derive(Debug, Serialize)]
struct Definition<'a> {
    description: Option<&'a str>,
    model: &'a str,
    vendor: &'a str,
}

impl StatePublisher {
    pub fn new(router: TopicRouter) -> Self {
        Self { router }
    }

    /// Full JSON state plus, for each touched property, its value topic
    /// and its ack topic.
    pub fn property_changes(&self, device: &Device, touched: &[String]) -> Vec<OutboundMessage> {
        let mut out = vec![self.router.state_message(device)];
        for name in touched {
            out.extend(self.router.property_message(device, name));
            out.extend(self.router.ack_message(device, name));
        }
        out
    }

    /// Ack flag only, e.g. after a command is sent or gives up.
    pub fn ack(&self, device: &Device, property: &str) -> Option<OutboundMessage> {
        self.router.ack_message(device, property)
    }

    /// Availability transitions publish nothing else.
    pub fn availability(&self, device: &Device) -> OutboundMessage {
        self.router.availability_message(device)
    }

    pub fn name(&self, device: &Device) -> Vec<OutboundMessage> {
        vec![self.router.name_message(device), self.router.state_message(device)]
    }

    /// Every state topic of the device, used by reconciliation.
    pub fn full(&self, device: &Device) -> Vec<OutboundMessage> {
        self.router.build_state_topics(device)
    }

    pub fn bridge_state(&self, online: bool) -> OutboundMessage {
        OutboundMessage::retained(self.router.bridge_state_topic(), availability(online))
    }

    pub fn bridge_devices<'a>(&self, devices: impl IntoIterator<Item = &'a Device>) -> OutboundMessage {
        let summaries: Vec<DeviceSummary<'_>> = devices
            .into_iter()
            .map(|d| DeviceSummary {
                ieee_address: d.device_id.as_str(),
                friendly_name: &d.friendly_name,
                model: &d.model,
                manufacturer: &d.manufacturer,
                online: d.online,
                definition: d.driver.as_ref().map(|_| Definition {
                    description: d.description.as_deref(),
                    model: &d.model,
                    vendor: &d.manufacturer,
                }),
            })
            .collect();
        let payload = serde_json::to_string(&summaries).unwrap_or_else(|_| "[]".to_owned());
        OutboundMessage::retained(self.router.bridge_devices_topic(), payload)
    }
}
