//! Authenticated websocket session with a Pushok hub.
//!
//! A [`HubSession`] owns one websocket connection. A background I/O task
//! multiplexes outbound requests, keep-alive pings and inbound frames;
//! replies are correlated to callers by request id, unsolicited
//! broadcasts are forwarded on the [`SessionEvent`] stream. The stream
//! ends with a single [`SessionEvent::Closed`] when the connection goes
//! away for any reason.
//!
//! The session does not reconnect; that policy belongs to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::HubIdentity;
use crate::error::Error;
use crate::models::{DeviceAdapter, DeviceAttributes, DeviceDescription, DeviceState, FieldAddress};
use crate::protocol::{
    CLIENT_VERSION, ENTITY_ZIGBEE, Frame, HubBroadcast, ROLE_ADMIN, Reply, method,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── SessionConfig ────────────────────────────────────────────────────

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: Url,
    /// How long a request waits for its reply. Default: 5s.
    pub request_timeout: Duration,
    /// Websocket ping cadence. Default: 10s.
    pub ping_interval: Duration,
}

impl SessionConfig {
    /// `ws://host:port`, or `wss://` when `use_ssl` is set.
    pub fn new(host: &str, port: u16, use_ssl: bool) -> Result<Self, Error> {
        let scheme = if use_ssl { "wss" } else { "ws" };
        let url = Url::parse(&format!("{scheme}://{host}:{port}"))?;
        Ok(Self {
            url,
            request_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
        })
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// ── Session events ───────────────────────────────────────────────────

#[derive(Debug)]
pub enum SessionEvent {
    Broadcast(HubBroadcast),
    /// Terminal. `None` when the session was closed locally.
    Closed(Option<Error>),
}

/// Result of a successful `authenticate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub role: u8,
}

enum Pending {
    /// A caller is awaiting the reply.
    Waiter(oneshot::Sender<Reply>),
    /// Fire-and-forget; only failures are reported (logged).
    Detached(&'static str),
}

// ── HubSession ───────────────────────────────────────────────────────

pub struct HubSession {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<DashMap<u64, Pending>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for HubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSession")
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl HubSession {
    /// Open the websocket and spawn the I/O task.
    ///
    /// The returned receiver yields hub broadcasts until the connection
    /// ends. Cancelling `parent` closes the session.
    pub async fn connect(
        config: &SessionConfig,
        parent: &CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), Error> {
        tracing::debug!(url = %config.url, "connecting to hub");

        let (ws, _response) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        // Unbounded: the reader must never stall behind a slow consumer
        // while replies it is waiting for are queued behind broadcasts.
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(DashMap::new());
        let cancel = parent.child_token();

        tokio::spawn(drive(
            ws,
            outbound_rx,
            Arc::clone(&pending),
            event_tx,
            cancel.clone(),
            config.ping_interval,
        ));

        let session = Self {
            outbound: outbound_tx,
            pending,
            next_id: AtomicU64::new(0),
            request_timeout: config.request_timeout,
            cancel,
        };
        Ok((session, event_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Close the websocket. Outstanding requests fail with
    /// [`Error::NotConnected`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn encode(&self, method: &str, params: Option<&Value>) -> (u64, Message) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut frame = json!({ "id": id, "m": method });
        if let Some(params) = params {
            frame["p"] = params.clone();
        }
        (id, Message::text(frame.to_string()))
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, method: &'static str, params: Option<Value>) -> Result<Value, Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let (id, frame) = self.encode(method, params.as_ref());
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending::Waiter(tx));

        if self.outbound.send(frame).is_err() {
            self.pending.remove(&id);
            return Err(Error::NotConnected);
        }
        tracing::trace!(id, method, "hub request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(method),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout {
                    method: method.to_owned(),
                    timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Send a request without waiting. Returns once the frame is queued
    /// for the wire; an error reply is logged by the I/O task.
    pub fn send_detached(&self, method: &'static str, params: Value) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let (id, frame) = self.encode(method, Some(&params));
        self.pending.insert(id, Pending::Detached(method));
        if self.outbound.send(frame).is_err() {
            self.pending.remove(&id);
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Run `pubKey` → `challenge` → `authenticate` for `identity`.
    pub async fn authenticate(&self, identity: &HubIdentity) -> Result<AuthOutcome, Error> {
        let reply = self.request(method::PUB_KEY, None).await?;
        let gateway_key = reply
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::deserialization("pubKey reply has no key", &reply))?;
        let handshake = identity.handshake(gateway_key)?;

        let challenge = self
            .request(
                method::CHALLENGE,
                Some(json!({ "user_id": identity.user_id_b64() })),
            )
            .await
            .map_err(|e| match e {
                Error::Hub { message, .. } => Error::Authentication { message },
                other => other,
            })?;
        let challenge = challenge
            .as_str()
            .ok_or_else(|| Error::deserialization("challenge is not a string", &challenge))?;
        let password = handshake.respond(challenge)?;

        let result = self
            .request(
                method::AUTHENTICATE,
                Some(json!({ "password": password, "version": CLIENT_VERSION })),
            )
            .await
            .map_err(|e| match e {
                Error::Hub { message, .. } => Error::Authentication { message },
                other => other,
            })?;

        let authorized = result
            .get("authorized")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !authorized {
            return Err(Error::Authentication {
                message: "hub did not authorize this user".into(),
            });
        }
        let role = result
            .get("role")
            .and_then(Value::as_u64)
            .and_then(|r| u8::try_from(r).ok())
            .unwrap_or(0);
        tracing::debug!(role, "hub session authenticated");
        Ok(AuthOutcome { role })
    }

    /// Register `identity` as an administrator (`addUser`). Only accepted
    /// by hubs that are open for registration.
    pub async fn register(&self, identity: &HubIdentity) -> Result<(), Error> {
        let result = self
            .request(
                method::ADD_USER,
                Some(json!({
                    "user_id": identity.user_id_b64(),
                    "public_key": identity.public_key_b64(),
                    "role": ROLE_ADMIN,
                })),
            )
            .await
            .map_err(|e| match e {
                Error::Hub { code, message, .. } => Error::Registration {
                    message: format!("{message} (code {code})"),
                },
                other => other,
            })?;

        let accepted = match &result {
            Value::Bool(b) => *b,
            Value::Null => false,
            _ => true,
        };
        if accepted {
            Ok(())
        } else {
            Err(Error::Registration {
                message: "hub refused to add the user".into(),
            })
        }
    }

    // ── Objects ──────────────────────────────────────────────────────

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescription>, Error> {
        let result = self
            .request(method::LIST_OBJECTS, Some(json!({ "type": ENTITY_ZIGBEE })))
            .await?;
        let Some(entries) = result.as_array() else {
            return Err(Error::deserialization("listObjects result is not an array", &result));
        };

        Ok(entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(device) => Some(device),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unparseable device entry");
                    None
                }
            })
            .collect())
    }

    pub async fn get_state(&self, device_id: &str) -> Result<DeviceState, Error> {
        let result = self
            .request(
                method::GET_STATE,
                Some(json!({ "id": device_id, "type": ENTITY_ZIGBEE })),
            )
            .await?;
        Ok(DeviceState::from_value(&result))
    }

    pub async fn get_attributes(&self, device_id: &str) -> Result<DeviceAttributes, Error> {
        let result = self
            .request(
                method::GET_ATTRIBUTES,
                Some(json!({ "id": device_id, "type": ENTITY_ZIGBEE })),
            )
            .await?;
        Ok(DeviceAttributes::from_value(&result))
    }

    pub async fn get_adapter(&self, driver: &str) -> Result<DeviceAdapter, Error> {
        let result = self
            .request(method::GET_ADAPTER, Some(json!({ "drv": driver })))
            .await?;
        Ok(DeviceAdapter::from_value(driver, &result))
    }

    /// Queue a `setState` for one field. Confirmation arrives later as an
    /// `object_update` with `ack: true`.
    pub fn set_state(&self, device_id: &str, field: FieldAddress, value: Value) -> Result<(), Error> {
        self.send_detached(
            method::SET_STATE,
            json!({
                "id": device_id,
                "type": ENTITY_ZIGBEE,
                "field": field,
                "value": value,
            }),
        )
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── I/O task ─────────────────────────────────────────────────────────

async fn drive(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    pending: Arc<DashMap<u64, Pending>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    ping_interval: Duration,
) {
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break None;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break None };
                if let Err(e) = write.send(msg).await {
                    break Some(Error::WebSocketConnect(e.to_string()));
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                    break Some(Error::WebSocketConnect(e.to_string()));
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), &pending, &events),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((1005, String::new()), |f| {
                        (u16::from(f.code), f.reason.as_str().to_owned())
                    });
                    break Some(Error::WebSocketClosed { code, reason });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    tracing::trace!(len = bytes.len(), "ignoring binary hub frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(Error::WebSocketConnect(e.to_string())),
                None => {
                    break Some(Error::WebSocketClosed {
                        code: 1006,
                        reason: "stream ended".into(),
                    });
                }
            },
        }
    };

    match &reason {
        Some(e) => tracing::warn!(error = %e, "hub session ended"),
        None => tracing::debug!("hub session closed"),
    }

    cancel.cancel();
    // Dropping the waiters wakes their callers with NotConnected.
    pending.clear();
    let _ = events.send(SessionEvent::Closed(reason));
}

fn dispatch(
    text: &str,
    pending: &DashMap<u64, Pending>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable hub frame");
            return;
        }
    };

    match frame {
        Frame::Broadcast { broadcast } => {
            let _ = events.send(SessionEvent::Broadcast(HubBroadcast::from_value(broadcast)));
        }
        Frame::Reply(reply) => match pending.remove(&reply.id) {
            Some((_, Pending::Waiter(tx))) => {
                let _ = tx.send(reply);
            }
            Some((_, Pending::Detached(method))) => {
                if let Err(e) = reply.into_result(method) {
                    tracing::warn!(error = %e, "hub rejected request");
                }
            }
            None => tracing::trace!(id = reply.id, "reply for unknown request"),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn session_url_follows_ssl_flag() {
        let plain = SessionConfig::new("hub.local", 3001, false).unwrap();
        assert_eq!(plain.url.as_str(), "ws://hub.local:3001/");

        let tls = SessionConfig::new("iotgate.pushok.net", 443, true).unwrap();
        assert_eq!(tls.url.scheme(), "wss");
        assert_eq!(tls.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn detached_error_reply_is_consumed() {
        let pending = DashMap::new();
        pending.insert(4, Pending::Detached(method::SET_STATE));
        let (tx, _rx) = mpsc::unbounded_channel();

        dispatch(r#"{"id":4,"error":1,"msg":"bad field"}"#, &pending, &tx);
        assert!(pending.is_empty());
    }

    #[test]
    fn broadcast_is_forwarded() {
        let pending = DashMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(
            r#"{"broadcast":{"evt":"object_update","id":"abc","props":{}}}"#,
            &pending,
            &tx,
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Broadcast(HubBroadcast::ObjectUpdate(_)))
        ));
    }
}
