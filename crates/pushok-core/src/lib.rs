// pushok-core: State-synchronization engine between pushok-api and an MQTT broker.

pub mod ack;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod convert;
pub mod error;
pub mod hub;
pub mod model;
pub mod publish;
pub mod reconcile;
pub mod registry;
pub mod router;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{Bridge, run_bridge};
pub use broker::{BrokerEvent, MqttClientSink};
pub use config::{AckPolicy, BridgeConfig, Credentials, MqttSettings, ReconnectPolicy};
pub use error::CoreError;
pub use hub::{HubCommander, HubEvent, HubHandle, HubLink, HubSnapshot, LinkState, register};
pub use publish::{DiscoveryPublisher, MqttSink, Outbox, StatePublisher};
pub use reconcile::{ReconcileReport, ReconcileTrigger};
pub use registry::{AckOutcome, DeviceRegistry, DeviceSnapshot, PushOutcome};
pub use router::{Command, OutboundMessage, PropertyWrite, TopicFormat, TopicRouter};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    Device, DeviceId, DeviceListing, FieldUpdate, Property, PropertySpec, PropertyTable,
    PushUpdate, Scalar, ValueKind,
};
