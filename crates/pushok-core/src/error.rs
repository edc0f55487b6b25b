// ── Core error types ──
//
// The bridge's failure taxonomy. Transport-level errors from pushok-api
// and rumqttc are translated into these variants; callers decide what to
// do from the variant alone (`is_retryable` / `is_fatal`), never from a
// raw protocol error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Links ────────────────────────────────────────────────────────
    /// Hub session unavailable or lost. Retried by the hub link.
    #[error("Hub transport error: {message}")]
    Transport { message: String },

    /// Hub rejected our key/user pair. Never retried with the same
    /// credentials.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// MQTT client or broker failure.
    #[error("Broker error: {message}")]
    Broker { message: String },

    // ── Translation ──────────────────────────────────────────────────
    /// An inbound MQTT message could not be turned into a hub command.
    /// The message is dropped.
    #[error("Cannot translate message on {topic}: {reason}")]
    Translation { topic: String, reason: String },

    /// The hub never confirmed a command.
    #[error("No acknowledgment for {device_id}/{property} within the ack window")]
    AckTimeout { device_id: String, property: String },

    // ── Setup ────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn translation(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Translation {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Transport and broker failures recover by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Broker { .. })
    }

    /// Errors that must reach the process boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::Config { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<pushok_api::Error> for CoreError {
    fn from(err: pushok_api::Error) -> Self {
        use pushok_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::Authentication { message },
            Api::Registration { message } => CoreError::Authentication {
                message: format!("registration refused: {message}"),
            },
            Api::InvalidKey(reason) => CoreError::Config {
                message: format!("stored hub credentials are unusable: {reason}"),
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid hub address: {e}"),
            },
            Api::Crypto(reason) => CoreError::Transport {
                message: format!("handshake failed: {reason}"),
            },
            err @ (Api::WebSocketConnect(_)
            | Api::WebSocketClosed { .. }
            | Api::NotConnected
            | Api::Timeout { .. }
            | Api::Hub { .. }) => CoreError::Transport {
                message: err.to_string(),
            },
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("unexpected hub reply: {message}"))
            }
        }
    }
}

impl From<rumqttc::ClientError> for CoreError {
    fn from(err: rumqttc::ClientError) -> Self {
        CoreError::Broker {
            message: err.to_string(),
        }
    }
}
