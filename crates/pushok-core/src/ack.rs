// ── Acknowledgment tracking ──
//
// Deadlines for commands the hub has not yet confirmed. One entry per
// (device, property); a newer command replaces the older one. Time is
// passed in explicitly so the bridge loop can drive it from a single
// `sleep_until` and tests can drive it by hand.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::config::AckPolicy;
use crate::model::DeviceId;
use crate::router::PropertyWrite;

#[derive(Debug, Clone, PartialEq)]
pub enum AckExpiry {
    /// Re-send the same value; the timer has been restarted.
    Retry(PropertyWrite),
    /// Retries exhausted.
    GaveUp(PropertyWrite),
}

#[derive(Debug)]
struct Pending {
    write: PropertyWrite,
    deadline: Instant,
    attempts: u32,
}

#[derive(Debug)]
pub struct AckTracker {
    policy: AckPolicy,
    pending: HashMap<(DeviceId, String), Pending>,
}

impl AckTracker {
    pub fn new(policy: AckPolicy) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
        }
    }

    pub fn track(&mut self, write: PropertyWrite, now: Instant) {
        let key = (write.device_id.clone(), write.property.clone());
        self.pending.insert(
            key,
            Pending {
                write,
                deadline: now + self.policy.timeout,
                attempts: 0,
            },
        );
    }

    /// Stop tracking a confirmed command. Returns `true` if it was tracked.
    pub fn confirm(&mut self, device_id: &DeviceId, property: &str) -> bool {
        self.pending
            .remove(&(device_id.clone(), property.to_owned()))
            .is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Everything whose deadline has passed at `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<AckExpiry> {
        let due: Vec<(DeviceId, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for key in due {
            let retry = match self.pending.get_mut(&key) {
                Some(p) if p.attempts < self.policy.retries => {
                    p.attempts += 1;
                    p.deadline = now + self.policy.timeout;
                    Some(p.write.clone())
                }
                _ => None,
            };
            match retry {
                Some(write) => out.push(AckExpiry::Retry(write)),
                None => {
                    if let Some(p) = self.pending.remove(&key) {
                        out.push(AckExpiry::GaveUp(p.write));
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
