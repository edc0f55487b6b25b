// ── Runtime bridge configuration ──
//
// These types describe how to reach the hub and the broker and how the
// engine behaves on failure. They carry credential data but never touch
// disk; the binary builds a `BridgeConfig` and hands it in.

use std::time::Duration;

use pushok_api::{HubIdentity, SessionConfig};
use secrecy::{ExposeSecret, SecretString};

use crate::error::CoreError;

/// Hub address plus the registered key/user pair.
///
/// Owned by the hub link for the lifetime of a session; replaced
/// wholesale on re-registration, never mutated.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    /// P-256 private scalar, hex.
    pub private_key: SecretString,
    /// Base64 user id assigned at registration.
    pub user_id: String,
}

impl Credentials {
    pub fn identity(&self) -> Result<HubIdentity, CoreError> {
        Ok(HubIdentity::from_stored(
            self.private_key.expose_secret(),
            &self.user_id,
        )?)
    }

    pub(crate) fn session_config(&self, request_timeout: Duration) -> Result<SessionConfig, CoreError> {
        Ok(SessionConfig::new(&self.host, self.port, self.use_ssl)?
            .with_request_timeout(request_timeout))
    }
}

/// Broker connection and topic layout.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub client_id: String,
    pub base_topic: String,
    pub discovery_prefix: String,
    pub discovery_enabled: bool,
    pub keep_alive: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            client_id: "pushok_hub_bridge".into(),
            base_topic: "pushok_hub".into(),
            discovery_prefix: "homeassistant".into(),
            discovery_enabled: true,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Hub reconnection schedule: a fixed delay measured from the start of
/// the previous attempt, plus uniform random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            jitter: Duration::from_millis(2000),
        }
    }
}

/// How long to wait for a command acknowledgment and how many times to
/// re-send before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 0,
        }
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub credentials: Credentials,
    pub mqtt: MqttSettings,
    pub reconnect: ReconnectPolicy,
    pub ack: AckPolicy,
    /// Per-request hub timeout.
    pub request_timeout: Duration,
}
