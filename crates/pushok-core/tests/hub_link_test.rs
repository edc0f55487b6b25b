#![allow(clippy::unwrap_used)]

// HubLink against a loopback mock hub that accepts any number of
// sessions and can drop them on request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use pushok_api::HubIdentity;
use pushok_core::{
    AckPolicy, BridgeConfig, CoreError, Credentials, DeviceId, HubCommander, HubEvent, HubLink,
    LinkState, MqttSettings, PropertyWrite, ReconnectPolicy, Scalar, register,
};

const DEV_NONCE: [u8; 32] = [0x33; 32];
const WAIT: Duration = Duration::from_secs(5);

// ── Mock hub ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Gateway {
    secret: Option<SecretKey>,
    user: Option<(String, PublicKey)>,
    /// Params of every `setState` received.
    writes: Vec<Value>,
}

impl Gateway {
    fn secret(&mut self) -> SecretKey {
        self.secret
            .get_or_insert_with(|| SecretKey::random(&mut rand::rngs::OsRng))
            .clone()
    }

    fn cipher(&mut self) -> Option<Aes256Gcm> {
        let secret = self.secret();
        let (_, public) = self.user.as_ref()?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
        Aes256Gcm::new_from_slice(shared.raw_secret_bytes()).ok()
    }

    fn verify(&mut self, password: &str) -> bool {
        let Some(cipher) = self.cipher() else {
            return false;
        };
        let Some((_, public)) = self.user.as_ref() else {
            return false;
        };
        let Ok(raw) = BASE64.decode(password) else {
            return false;
        };
        let Ok(plain) = cipher.decrypt(Nonce::from_slice(&DEV_NONCE[..12]), raw.as_ref()) else {
            return false;
        };
        let (der, user_nonce) = plain.split_at(plain.len() - 32);
        let Ok(signature) = Signature::from_der(der) else {
            return false;
        };
        let mut message = DEV_NONCE.to_vec();
        message.extend_from_slice(user_nonce);
        VerifyingKey::from(public).verify(&message, &signature).is_ok()
    }

    fn reply(&mut self, id: Value, method: &str, params: &Value) -> Option<Value> {
        let reply = match method {
            "pubKey" => {
                let point = self.secret().public_key().to_encoded_point(false);
                json!({"id": id, "result": {"key": BASE64.encode(point.as_bytes())}})
            }
            "challenge" => {
                let known = self.user.as_ref().is_some_and(|(user, _)| params["user_id"] == *user);
                match self.cipher() {
                    Some(cipher) if known => {
                        let sealed = cipher.encrypt(Nonce::from_slice(&[0u8; 12]), DEV_NONCE.as_ref()).unwrap();
                        json!({"id": id, "result": BASE64.encode(sealed)})
                    }
                    _ => json!({"id": id, "error": 403, "msg": "unknown user"}),
                }
            }
            "authenticate" => {
                let ok = self.verify(params["password"].as_str().unwrap_or_default());
                json!({"id": id, "result": {"authorized": ok, "role": 1}})
            }
            "addUser" => {
                let raw = BASE64.decode(params["public_key"].as_str().unwrap()).unwrap();
                self.user = Some((
                    params["user_id"].as_str().unwrap().to_owned(),
                    PublicKey::from_sec1_bytes(&raw).unwrap(),
                ));
                json!({"id": id, "result": true})
            }
            "listObjects" => json!({"id": id, "result": [
                {"id": "00158D0001234567", "mnf": "LUMI", "mdl": "plug", "drv": "plug", "lqi": 96}
            ]}),
            "getState" => json!({"id": id, "result": {"1": {"value": true}}}),
            "getAttributes" => json!({"id": id, "result": {"name": "Kitchen plug"}}),
            "getAdapter" => json!({"id": id, "result": {"crc": 1, "content": {"params": [
                {"address": 1, "access": "rw", "type": "bool", "viewParams": {"name": "state"}}
            ]}}}),
            "setState" => {
                self.writes.push(params.clone());
                return None;
            }
            _ => return None,
        };
        Some(reply)
    }
}

struct MockHub {
    port: u16,
    /// Drops every open session.
    kick: Arc<Notify>,
    gateway: Arc<Mutex<Gateway>>,
}

async fn spawn_hub(known_user: Option<&HubIdentity>) -> MockHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let kick = Arc::new(Notify::new());

    let mut gateway = Gateway::default();
    if let Some(identity) = known_user {
        let raw = BASE64.decode(identity.public_key_b64()).unwrap();
        gateway.user = Some((identity.user_id_b64(), PublicKey::from_sec1_bytes(&raw).unwrap()));
    }
    let gateway = Arc::new(Mutex::new(gateway));

    let kicker = Arc::clone(&kick);
    let shared = Arc::clone(&gateway);
    tokio::spawn(async move {
        let gateway = shared;
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let gateway = Arc::clone(&gateway);
            let kick = Arc::clone(&kicker);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                loop {
                    tokio::select! {
                        () = kick.notified() => break,
                        frame = ws.next() => {
                            let text = match frame {
                                Some(Ok(Message::Text(text))) => text,
                                Some(Ok(_)) => continue,
                                _ => break,
                            };
                            let request: Value = serde_json::from_str(text.as_str()).unwrap();
                            let params = request.get("p").cloned().unwrap_or(Value::Null);
                            let method = request["m"].as_str().unwrap_or_default().to_owned();
                            let reply = gateway.lock().unwrap().reply(request["id"].clone(), &method, &params);
                            if let Some(reply) = reply {
                                if ws.send(Message::text(reply.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            });
        }
    });

    MockHub { port, kick, gateway }
}

fn config(port: u16, identity: &HubIdentity) -> BridgeConfig {
    BridgeConfig {
        credentials: Credentials {
            host: "127.0.0.1".into(),
            port,
            use_ssl: false,
            private_key: identity.private_key_hex(),
            user_id: identity.user_id_b64(),
        },
        mqtt: MqttSettings::default(),
        reconnect: ReconnectPolicy {
            delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
        },
        ack: AckPolicy::default(),
        request_timeout: Duration::from_millis(500),
    }
}

async fn next(events: &mut mpsc::Receiver<HubEvent>) -> HubEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn connects_fetches_snapshot_and_reconnects_after_drop() {
    let identity = HubIdentity::generate();
    let hub = spawn_hub(Some(&identity)).await;
    let (tx, mut events) = mpsc::channel(16);
    let (link, handle) = HubLink::new(&config(hub.port, &identity), tx).unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(link.run(cancel.clone()));

    let HubEvent::Connected(snapshot) = next(&mut events).await else {
        panic!("expected a snapshot first");
    };
    assert_eq!(snapshot.devices.len(), 1);
    let plug = &snapshot.devices[0];
    assert_eq!(plug.device_id, DeviceId::new("00158d0001234567"));
    assert_eq!(plug.friendly_name.as_deref(), Some("Kitchen plug"));
    assert_eq!(plug.link_quality, Some(96));
    assert!(plug.table.as_ref().unwrap().by_name("state").unwrap().writable);
    assert_eq!(handle.state(), LinkState::Connected);

    let mut states = handle.subscribe_state();
    hub.kick.notify_waiters();
    assert!(matches!(next(&mut events).await, HubEvent::Disconnected { .. }));
    assert!(matches!(next(&mut events).await, HubEvent::Connected(_)));
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), LinkState::Connected);

    cancel.cancel();
    assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    assert_eq!(handle.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn set_state_carries_the_id_as_listed() {
    let identity = HubIdentity::generate();
    let hub = spawn_hub(Some(&identity)).await;
    let (tx, mut events) = mpsc::channel(16);
    let (link, handle) = HubLink::new(&config(hub.port, &identity), tx).unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(link.run(cancel.clone()));

    let HubEvent::Connected(snapshot) = next(&mut events).await else {
        panic!("expected a snapshot first");
    };
    let plug = &snapshot.devices[0];
    assert_eq!(plug.device_id.as_str(), "00158d0001234567");
    assert_eq!(plug.hub_id, "00158D0001234567");

    let write = PropertyWrite {
        device_id: plug.device_id.clone(),
        hub_id: plug.hub_id.clone(),
        property: "state".into(),
        address: 1,
        value: Scalar::Bool(false),
        wire: json!(false),
    };
    handle.send_command(&write).unwrap();

    let params = timeout(WAIT, async {
        loop {
            if let Some(params) = hub.gateway.lock().unwrap().writes.first().cloned() {
                break params;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(params["id"], "00158D0001234567");
    assert_eq!(params["field"], 1);
    assert_eq!(params["value"], false);

    cancel.cancel();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn rejected_credentials_stop_the_link() {
    let hub = spawn_hub(None).await;
    let (tx, mut events) = mpsc::channel(16);
    let (link, handle) = HubLink::new(&config(hub.port, &HubIdentity::generate()), tx).unwrap();

    let result = timeout(WAIT, link.run(CancellationToken::new())).await.unwrap();
    assert!(matches!(result, Err(CoreError::Authentication { .. })), "{result:?}");
    assert_eq!(handle.state(), LinkState::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn registration_yields_working_credentials() {
    let hub = spawn_hub(None).await;
    let credentials = register("127.0.0.1", hub.port, false, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(credentials.port, hub.port);

    let identity = credentials.identity().unwrap();
    let (tx, mut events) = mpsc::channel(16);
    let (link, _handle) = HubLink::new(&config(hub.port, &identity), tx).unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(link.run(cancel.clone()));

    assert!(matches!(next(&mut events).await, HubEvent::Connected(_)));
    cancel.cancel();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}
