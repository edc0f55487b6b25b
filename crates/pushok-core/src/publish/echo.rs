// ── Echo suppression ──
//
// The bridge subscribes to its own namespace, so the broker hands back
// every state publish on a topic that also accepts commands. Each such
// publish is remembered here and the matching inbound copy is consumed.
//
// Entries outlive broker sessions: publishes queued while the broker was
// away are delivered, and echoed, after the reconnect. They age out by
// per-topic depth instead.

use std::collections::{HashMap, VecDeque};

/// Per-topic memory depth. Older unmatched entries are dropped.
const DEPTH: usize = 16;

#[derive(Debug, Default)]
pub struct EchoFilter {
    sent: HashMap<String, VecDeque<String>>,
}

impl EchoFilter {
    pub fn record(&mut self, topic: &str, payload: &str) {
        let queue = self.sent.entry(topic.to_owned()).or_default();
        if queue.len() == DEPTH {
            queue.pop_front();
        }
        queue.push_back(payload.to_owned());
    }

    /// `true` if this inbound message is the echo of one of ours. Echoes
    /// arrive in publish order, so everything older than the match is
    /// discarded along with it.
    pub fn consume(&mut self, topic: &str, payload: &str) -> bool {
        let Some(queue) = self.sent.get_mut(topic) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|p| p == payload) else {
            return false;
        };
        queue.drain(..=pos);
        if queue.is_empty() {
            self.sent.remove(topic);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_is_consumed_once() {
        let mut echo = EchoFilter::default();
        echo.record("base/dev/state", "true");
        assert!(!echo.consume("base/dev/state", "false"));
        assert!(echo.consume("base/dev/state", "true"));
        assert!(!echo.consume("base/dev/state", "true"));
        assert!(echo.is_empty());
    }

    #[test]
    fn repeated_publishes_are_matched_in_order() {
        let mut echo = EchoFilter::default();
        echo.record("t", "1");
        echo.record("t", "2");
        echo.record("t", "1");
        assert!(echo.consume("t", "2"));
        assert!(echo.consume("t", "1"));
        assert!(!echo.consume("t", "1"));
    }

    #[test]
    fn depth_is_bounded() {
        let mut echo = EchoFilter::default();
        for i in 0..40 {
            echo.record("t", &i.to_string());
        }
        assert!(!echo.consume("t", "0"));
        assert!(echo.consume("t", "39"));
    }
}
