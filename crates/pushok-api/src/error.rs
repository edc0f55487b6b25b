use thiserror::Error;

/// Top-level error type for the `pushok-api` crate.
///
/// Covers every failure mode of a hub session: authentication,
/// the websocket transport, request/response correlation, and payload
/// decoding. `pushok-core` maps these into the bridge's error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The hub rejected the key/user pair (unknown user, bad signature).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// `addUser` was refused (hub already has an administrator, etc.)
    #[error("Registration failed: {message}")]
    Registration { message: String },

    /// Stored key material could not be decoded.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// AES-GCM or ECDSA primitive failure during the handshake.
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ── Transport ───────────────────────────────────────────────────
    /// URL construction failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Websocket connection could not be established or broke mid-read.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// Websocket closed by the hub.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The session is gone (writer task stopped).
    #[error("Not connected to hub")]
    NotConnected,

    /// No response arrived for a request within the session timeout.
    #[error("Request {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    // ── Hub replies ─────────────────────────────────────────────────
    /// The hub answered a request with an error envelope.
    #[error("Hub rejected {method} (code {code}): {message}")]
    Hub {
        method: String,
        code: String,
        message: String,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if the hub refused our identity. Retrying with the
    /// same credentials will not help.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::InvalidKey(_))
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_)
                | Self::WebSocketClosed { .. }
                | Self::NotConnected
                | Self::Timeout { .. }
        )
    }

    pub(crate) fn deserialization(message: impl Into<String>, body: &serde_json::Value) -> Self {
        Self::Deserialization {
            message: message.into(),
            body: body.to_string(),
        }
    }
}
