// ── Hub link ──
//
// Keeps one authenticated hub session alive. Each attempt walks
// Disconnected → Connecting → Authenticating → Connected, fetches a full
// device snapshot, then forwards pushes until the session drops. Any
// failure returns to Disconnected and the next attempt starts no sooner
// than the configured delay (plus jitter) after the previous one began.
// Rejected credentials end the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pushok_api::{
    DeviceAdapter, Error as ApiError, HubBroadcast, HubIdentity, HubSession, SessionConfig,
    SessionEvent,
};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BridgeConfig, Credentials, ReconnectPolicy};
use crate::convert;
use crate::error::CoreError;
use crate::model::{DeviceListing, PushUpdate};
use crate::router::PropertyWrite;

pub const HUB_EVENT_CAPACITY: usize = 256;

// ── Observable state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// Full device list fetched right after authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSnapshot {
    pub devices: Vec<DeviceListing>,
}

/// Normalized events for the bridge loop.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Connected(HubSnapshot),
    Push(PushUpdate),
    Disconnected { reason: String },
}

// ── Command sending ──────────────────────────────────────────────────

/// Fire-and-forget delivery of property writes to the hub.
pub trait HubCommander: Send + Sync {
    /// Returns once the request is queued on the wire. Confirmation
    /// arrives later as a push.
    fn send_command(&self, write: &PropertyWrite) -> Result<(), CoreError>;
}

/// Cheap, cloneable access to whatever session is current.
#[derive(Debug, Clone)]
pub struct HubHandle {
    session: watch::Receiver<Option<Arc<HubSession>>>,
    state: watch::Receiver<LinkState>,
}

impl HubHandle {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

impl HubCommander for HubHandle {
    fn send_command(&self, write: &PropertyWrite) -> Result<(), CoreError> {
        let session = self.session.borrow().clone().ok_or_else(|| CoreError::Transport {
            message: "hub not connected".into(),
        })?;
        session.set_state(&write.hub_id, write.address, write.wire.clone())?;
        debug!(
            device_id = %write.device_id,
            property = %write.property,
            value = %write.value,
            "command sent to hub"
        );
        Ok(())
    }
}

// ── Link ─────────────────────────────────────────────────────────────

pub struct HubLink {
    identity: HubIdentity,
    session_config: SessionConfig,
    policy: ReconnectPolicy,
    events: mpsc::Sender<HubEvent>,
    state: watch::Sender<LinkState>,
    session: watch::Sender<Option<Arc<HubSession>>>,
}

impl HubLink {
    /// Validates the stored credentials up front; a malformed key is a
    /// configuration error, not something to retry.
    pub fn new(
        config: &BridgeConfig,
        events: mpsc::Sender<HubEvent>,
    ) -> Result<(Self, HubHandle), CoreError> {
        let identity = config.credentials.identity()?;
        let session_config = config.credentials.session_config(config.request_timeout)?;
        let (state, state_rx) = watch::channel(LinkState::Disconnected);
        let (session, session_rx) = watch::channel(None);

        let link = Self {
            identity,
            session_config,
            policy: config.reconnect,
            events,
            state,
            session,
        };
        let handle = HubHandle {
            session: session_rx,
            state: state_rx,
        };
        Ok((link, handle))
    }

    /// Run until cancelled or until the hub rejects our credentials.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), CoreError> {
        let mut last_attempt: Option<Instant> = None;

        let result = loop {
            if let Some(started) = last_attempt {
                let at = next_attempt(started, self.policy, jitter(self.policy.jitter));
                let wait = at.saturating_duration_since(Instant::now());
                info!(delay_ms = millis(wait), "waiting before hub reconnect");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break Ok(()),
                    () = tokio::time::sleep_until(at) => {}
                }
            }
            last_attempt = Some(Instant::now());

            match self.session_once(&cancel).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "hub rejected the bridge; not retrying");
                    break Err(e);
                }
                Err(e) => warn!(error = %e, "hub connection attempt failed"),
            }
            self.set_state(LinkState::Disconnected);

            if cancel.is_cancelled() {
                break Ok(());
            }
        };

        self.set_state(LinkState::Disconnected);
        debug!("hub link exiting");
        result
    }

    /// One connection lifetime: connect, authenticate, snapshot, forward
    /// pushes until the session ends.
    async fn session_once(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        let setup = async {
            self.set_state(LinkState::Connecting);
            let (session, events) = HubSession::connect(&self.session_config, cancel).await?;

            self.set_state(LinkState::Authenticating);
            let outcome = session.authenticate(&self.identity).await?;
            debug!(role = outcome.role, "hub authenticated");

            let snapshot = fetch_snapshot(&session).await?;
            Ok::<_, CoreError>((Arc::new(session), events, snapshot))
        };

        let (session, mut events, snapshot) = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = setup => result?,
        };

        info!(devices = snapshot.devices.len(), "hub connected");
        self.session.send_replace(Some(Arc::clone(&session)));
        self.set_state(LinkState::Connected);
        if self.events.send(HubEvent::Connected(snapshot)).await.is_err() {
            session.close();
            return Ok(());
        }

        let reason = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    session.close();
                    break "shutdown".to_owned();
                }
                event = events.recv() => match event {
                    Some(SessionEvent::Broadcast(HubBroadcast::ObjectUpdate(update))) => {
                        let push = convert::push_update(&update, Utc::now());
                        if self.events.send(HubEvent::Push(push)).await.is_err() {
                            session.close();
                            break "bridge stopped".to_owned();
                        }
                    }
                    Some(SessionEvent::Broadcast(HubBroadcast::Other { evt, .. })) => {
                        trace!(evt = %evt, "ignoring hub broadcast");
                    }
                    Some(SessionEvent::Closed(Some(e))) => break e.to_string(),
                    Some(SessionEvent::Closed(None)) | None => break "connection closed".to_owned(),
                }
            }
        };

        warn!(reason = %reason, "hub session ended");
        self.session.send_replace(None);
        self.set_state(LinkState::Disconnected);
        let _ = self.events.send(HubEvent::Disconnected { reason }).await;
        Ok(())
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "hub link state");
                *current = state;
                true
            }
        });
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// List every device with its state, attributes and (per driver, cached)
/// adapter. A single device whose details the hub refuses is still
/// listed; transport failures abort the snapshot.
async fn fetch_snapshot(session: &HubSession) -> Result<HubSnapshot, CoreError> {
    let now = Utc::now();
    let descriptions = session.list_devices().await?;
    let mut adapters: HashMap<String, Option<DeviceAdapter>> = HashMap::new();
    let mut devices = Vec::with_capacity(descriptions.len());

    for desc in descriptions {
        let state = tolerate(session.get_state(&desc.id).await, &desc.id, "state")?.unwrap_or_default();
        let attributes =
            tolerate(session.get_attributes(&desc.id).await, &desc.id, "attributes")?.unwrap_or_default();

        let adapter = match desc.driver.clone() {
            Some(driver) => {
                if !adapters.contains_key(&driver) {
                    let fetched = tolerate(session.get_adapter(&driver).await, &desc.id, "adapter")?;
                    adapters.insert(driver.clone(), fetched);
                }
                adapters.get(&driver).and_then(Option::as_ref)
            }
            None => None,
        };

        devices.push(convert::device_listing(desc, &state, attributes, adapter, now));
    }

    Ok(HubSnapshot { devices })
}

/// Hub-side refusals and odd payloads for one device are logged and
/// skipped; anything else is a transport failure.
fn tolerate<T>(result: Result<T, ApiError>, device_id: &str, what: &str) -> Result<Option<T>, CoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ (ApiError::Hub { .. } | ApiError::Deserialization { .. })) => {
            warn!(device_id, error = %e, "could not fetch device {what}");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

// ── Reconnect timing ─────────────────────────────────────────────────

fn next_attempt(previous_start: Instant, policy: ReconnectPolicy, jitter: Duration) -> Instant {
    previous_start + policy.delay + jitter
}

fn jitter(max: Duration) -> Duration {
    let max_ms = millis(max);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Registration ─────────────────────────────────────────────────────

/// One-time registration: generate a key pair, add it as an
/// administrator (accepted only by hubs open for registration), and
/// verify it by authenticating. The caller persists the result.
pub async fn register(
    host: &str,
    port: u16,
    use_ssl: bool,
    request_timeout: Duration,
) -> Result<Credentials, CoreError> {
    let session_config = SessionConfig::new(host, port, use_ssl)?.with_request_timeout(request_timeout);
    let cancel = CancellationToken::new();
    let identity = HubIdentity::generate();

    let (session, _events) = HubSession::connect(&session_config, &cancel).await?;
    session.register(&identity).await?;
    session.authenticate(&identity).await?;
    session.close();
    info!(host, port, "registered with hub");

    Ok(Credentials {
        host: host.to_owned(),
        port,
        use_ssl,
        private_key: identity.private_key_hex(),
        user_id: identity.user_id_b64(),
    })
}
