//! Configuration for the Pushok MQTT bridge.
//!
//! TOML file + `PUSHOK_` environment overlay, hub key resolution
//! (env var → keyring → plaintext), persistence of registration output,
//! and translation to `pushok_core::BridgeConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pushok_core::{AckPolicy, BridgeConfig, Credentials, MqttSettings, ReconnectPolicy};

const KEYRING_SERVICE: &str = "pushok-mqtt";
const KEYRING_USER: &str = "private-key";
const MIN_KEEP_ALIVE_SECS: u64 = 5;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no hub credentials configured: {missing} is not set")]
    NoCredentials { missing: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub mqtt: MqttSection,

    #[serde(default)]
    pub bridge: BridgeSection,

    /// Default tracing filter when neither `RUST_LOG` nor `-v` is given.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub: HubSection::default(),
            mqtt: MqttSection::default(),
            bridge: BridgeSection::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HubSection {
    #[serde(default = "default_hub_host")]
    pub host: String,

    #[serde(default = "default_hub_port")]
    pub port: u16,

    #[serde(default)]
    pub use_ssl: bool,

    /// Hex private key (plaintext; prefer the keyring or an env var).
    pub private_key: Option<String>,

    /// Environment variable name holding the private key.
    pub private_key_env: Option<String>,

    /// Base64 user id assigned at registration.
    pub user_id: Option<String>,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            host: default_hub_host(),
            port: default_hub_port(),
            use_ssl: false,
            private_key: None,
            private_key_env: None,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    #[serde(default = "default_true")]
    pub discovery_enabled: bool,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            base_topic: default_base_topic(),
            discovery_prefix: default_discovery_prefix(),
            discovery_enabled: true,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BridgeSection {
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter_ms: u64,

    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    #[serde(default)]
    pub ack_retries: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_jitter_ms: default_reconnect_jitter(),
            ack_timeout_secs: default_ack_timeout(),
            ack_retries: 0,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_hub_host() -> String {
    "localhost".into()
}
fn default_hub_port() -> u16 {
    3001
}
fn default_mqtt_host() -> String {
    "localhost".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "pushok_hub_bridge".into()
}
fn default_base_topic() -> String {
    "pushok_hub".into()
}
fn default_discovery_prefix() -> String {
    "homeassistant".into()
}
fn default_true() -> bool {
    true
}
fn default_keep_alive() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    10
}
fn default_reconnect_jitter() -> u64 {
    2000
}
fn default_ack_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    5
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("net", "pushok", "pushok-mqtt").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("pushok-mqtt");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file (if present), then `PUSHOK_*` variables
/// with `__` separating sections (`PUSHOK_MQTT__BASE_TOPIC`).
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PUSHOK_").split("__"))
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    Ok(figment(path).extract()?)
}

// ── Validation and translation ──────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.host.trim().is_empty() {
            return Err(invalid("hub.host", "must not be empty"));
        }
        if self.hub.port == 0 {
            return Err(invalid("hub.port", "must not be 0"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(invalid("mqtt.client_id", "must not be empty"));
        }
        validate_topic("mqtt.base_topic", &self.mqtt.base_topic)?;
        validate_topic("mqtt.discovery_prefix", &self.mqtt.discovery_prefix)?;
        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(invalid(
                "mqtt.keep_alive_secs",
                format!("must be at least {MIN_KEEP_ALIVE_SECS}"),
            ));
        }
        if self.bridge.ack_timeout_secs == 0 {
            return Err(invalid("bridge.ack_timeout_secs", "must be positive"));
        }
        if self.bridge.request_timeout_secs == 0 {
            return Err(invalid("bridge.request_timeout_secs", "must be positive"));
        }
        Ok(())
    }

    /// Validate, resolve the hub key, and build the runtime config.
    pub fn into_bridge_config(self) -> Result<BridgeConfig, ConfigError> {
        self.validate()?;
        let private_key = resolve_private_key(&self.hub)?;
        let user_id = self
            .hub
            .user_id
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigError::NoCredentials {
                missing: "hub.user_id".into(),
            })?;

        Ok(BridgeConfig {
            credentials: Credentials {
                host: self.hub.host,
                port: self.hub.port,
                use_ssl: self.hub.use_ssl,
                private_key,
                user_id,
            },
            mqtt: MqttSettings {
                host: self.mqtt.host,
                port: self.mqtt.port,
                username: self.mqtt.username,
                password: self.mqtt.password.map(SecretString::from),
                client_id: self.mqtt.client_id,
                base_topic: self.mqtt.base_topic,
                discovery_prefix: self.mqtt.discovery_prefix,
                discovery_enabled: self.mqtt.discovery_enabled,
                keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            },
            reconnect: ReconnectPolicy {
                delay: Duration::from_secs(self.bridge.reconnect_delay_secs),
                jitter: Duration::from_millis(self.bridge.reconnect_jitter_ms),
            },
            ack: AckPolicy {
                timeout: Duration::from_secs(self.bridge.ack_timeout_secs),
                retries: self.bridge.ack_retries,
            },
            request_timeout: Duration::from_secs(self.bridge.request_timeout_secs),
        })
    }
}

/// MQTT topic prefixes: no wildcards, no empty levels.
fn validate_topic(field: &str, topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid(field, "must not contain MQTT wildcards"));
    }
    if topic.split('/').any(str::is_empty) {
        return Err(invalid(field, "must not have empty topic levels"));
    }
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the hub private key: `private_key_env` → keyring → plaintext.
pub fn resolve_private_key(hub: &HubSection) -> Result<SecretString, ConfigError> {
    let from_env = hub
        .private_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok());
    let from_keyring = if from_env.is_some() {
        None
    } else {
        keyring_lookup()
    };
    key_chain(hub, from_env, from_keyring)
}

fn keyring_lookup() -> Option<String> {
    keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .ok()?
        .get_password()
        .ok()
}

fn key_chain(
    hub: &HubSection,
    from_env: Option<String>,
    from_keyring: Option<String>,
) -> Result<SecretString, ConfigError> {
    from_env
        .or(from_keyring)
        .or_else(|| hub.private_key.clone())
        .filter(|k| !k.trim().is_empty())
        .map(SecretString::from)
        .ok_or_else(|| ConfigError::NoCredentials {
            missing: "hub.private_key".into(),
        })
}

// ── Persisting registration output ──────────────────────────────────

/// Where the private key ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStorage {
    Keyring,
    Plaintext,
}

/// Write registration output into the config file at `path`, keeping
/// every other setting already in it. The key goes to the system keyring
/// unless `plaintext` is set or the keyring is unavailable.
pub fn save_credentials(
    path: &Path,
    credentials: &Credentials,
    plaintext: bool,
) -> Result<KeyStorage, ConfigError> {
    let storage = if !plaintext && keyring_store(credentials.private_key.expose_secret()) {
        KeyStorage::Keyring
    } else {
        KeyStorage::Plaintext
    };
    write_credentials(path, credentials, storage)?;
    Ok(storage)
}

fn keyring_store(secret: &str) -> bool {
    keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .and_then(|entry| entry.set_password(secret))
        .is_ok()
}

fn write_credentials(
    path: &Path,
    credentials: &Credentials,
    storage: KeyStorage,
) -> Result<(), ConfigError> {
    let mut doc = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        raw.parse::<toml::Table>().map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        toml::Table::new()
    };

    let hub = doc
        .entry("hub")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let toml::Value::Table(hub) = hub else {
        return Err(invalid("hub", "expected a table"));
    };
    hub.insert("host".into(), credentials.host.clone().into());
    hub.insert("port".into(), i64::from(credentials.port).into());
    hub.insert("use_ssl".into(), credentials.use_ssl.into());
    hub.insert("user_id".into(), credentials.user_id.clone().into());
    match storage {
        KeyStorage::Plaintext => {
            hub.insert(
                "private_key".into(),
                credentials.private_key.expose_secret().to_owned().into(),
            );
        }
        KeyStorage::Keyring => {
            hub.remove("private_key");
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(&doc)?)?;
    restrict_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}
