// pushok-api: Async Rust client for the Pushok Zigbee hub websocket API

pub mod auth;
pub mod error;
pub mod models;
pub mod protocol;
pub mod session;

pub use auth::HubIdentity;
pub use error::Error;
pub use models::{
    AdapterParam, DeviceAdapter, DeviceAttributes, DeviceDescription, DeviceState, FieldAddress,
    ObjectUpdate, PropertyValue, ViewParams,
};
pub use protocol::HubBroadcast;
pub use session::{AuthOutcome, HubSession, SessionConfig, SessionEvent};
