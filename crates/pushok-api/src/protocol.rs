//! Hub wire envelopes.
//!
//! Every text frame is one JSON object. Requests carry a numeric `id`, a
//! method name `m` and optional params `p`; the hub answers with the same
//! `id` and either `result` or `error` + `msg`. Unsolicited frames wrap
//! their payload in a `broadcast` object keyed by `evt`.

use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;
use crate::models::ObjectUpdate;

/// Method names understood by the hub.
pub mod method {
    pub const PUB_KEY: &str = "pubKey";
    pub const CHALLENGE: &str = "challenge";
    pub const AUTHENTICATE: &str = "authenticate";
    pub const ADD_USER: &str = "addUser";
    pub const LIST_OBJECTS: &str = "listObjects";
    pub const GET_STATE: &str = "getState";
    pub const SET_STATE: &str = "setState";
    pub const GET_ATTRIBUTES: &str = "getAttributes";
    pub const GET_ADAPTER: &str = "getAdapter";
}

/// Object namespace for Zigbee end devices.
pub const ENTITY_ZIGBEE: &str = "zigbee";

/// Role requested by `addUser`.
pub const ROLE_ADMIN: u8 = 1;

/// Protocol version announced in `authenticate`.
pub const CLIENT_VERSION: &str = "0.1.0";

pub const EVT_OBJECT_UPDATE: &str = "object_update";

// ── Inbound ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Frame {
    Broadcast { broadcast: Value },
    Reply(Reply),
}

#[derive(Debug, Deserialize)]
pub(crate) struct Reply {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl Reply {
    /// Split the reply into the `result` payload or a [`Error::Hub`].
    pub fn into_result(self, method: &str) -> Result<Value, Error> {
        match self.error {
            Some(code) if !code.is_null() => Err(Error::Hub {
                method: method.to_owned(),
                code: match code {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                message: self.msg.unwrap_or_default(),
            }),
            _ => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// An unsolicited hub event.
#[derive(Debug, Clone, PartialEq)]
pub enum HubBroadcast {
    /// One or more property values of an object changed.
    ObjectUpdate(ObjectUpdate),
    /// Any other event, kept raw.
    Other { evt: String, body: Value },
}

impl HubBroadcast {
    pub(crate) fn from_value(body: Value) -> Self {
        let evt = body
            .get("evt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        if evt == EVT_OBJECT_UPDATE {
            if let Some(update) = ObjectUpdate::from_value(&body) {
                return Self::ObjectUpdate(update);
            }
        }
        Self::Other { evt, body }
    }
}
