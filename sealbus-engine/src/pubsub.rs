//! Publish/subscribe abstraction.
//!
//! The engine does not care what carries its bytes. Anything that can
//! register callbacks per channel and publish best-effort satisfies the
//! contract; delivery may drop, duplicate, reorder, and the bytes
//! themselves are untrusted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A subscription callback: `(channel, payload)`.
///
/// Invoked on its own task per delivered message; implementations must not
/// run callbacks on the publisher's call stack.
pub type Callback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Minimal publish/subscribe contract the engine runs on.
///
/// Multiple callbacks per channel are permitted and all are invoked on
/// publish. `publish` is fire-and-forget: it returns without waiting for
/// delivery and may silently fail. `unsubscribe` removes every callback
/// registered for the channel.
pub trait PubSub: Send + Sync {
    /// Register a callback for a channel.
    fn subscribe(&self, channel: &str, callback: Callback);

    /// Remove every callback for a channel.
    fn unsubscribe(&self, channel: &str);

    /// Publish bytes to a channel, best effort.
    fn publish(&self, channel: &str, data: &[u8]);

    /// Tear down the transport connection.
    fn disconnect(&self);
}

/// In-process pub/sub fabric.
///
/// Connects engines living in the same process, mainly for tests and
/// single-host setups. Every `(callback, message)` pair is delivered on its
/// own tokio task, so the fabric exhibits the same reordering freedom a
/// real broker has.
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<Callback>>>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
        })
    }
}

impl PubSub for MemoryBus {
    fn subscribe(&self, channel: &str, callback: Callback) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.entry(channel.to_string()).or_default().push(callback);
    }

    fn unsubscribe(&self, channel: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.remove(channel);
    }

    fn publish(&self, channel: &str, data: &[u8]) {
        let callbacks = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            match topics.get(channel) {
                Some(callbacks) => callbacks.clone(),
                None => return,
            }
        };
        for callback in callbacks {
            let channel = channel.to_string();
            let data = data.to_vec();
            tokio::spawn(async move {
                callback(&channel, &data);
            });
        }
    }

    fn disconnect(&self) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = MemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for id in 0..3 {
            let tx = tx.clone();
            bus.subscribe(
                "topic",
                Arc::new(move |channel: &str, data: &[u8]| {
                    tx.send((id, channel.to_string(), data.to_vec())).ok();
                }),
            );
        }

        bus.publish("topic", b"payload");

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (id, channel, data) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(channel, "topic");
            assert_eq!(data, b"payload");
            seen.push(id);
        }
        seen.sort_unstable();
        assert_eq!(seen, [0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_all_callbacks() {
        let bus = MemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..2 {
            let tx = tx.clone();
            bus.subscribe(
                "topic",
                Arc::new(move |_: &str, _: &[u8]| {
                    tx.send(()).ok();
                }),
            );
        }
        bus.unsubscribe("topic");

        bus.publish("topic", b"payload");

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "callback fired after unsubscribe");
    }

    #[tokio::test]
    async fn test_publish_to_unknown_channel_is_a_no_op() {
        let bus = MemoryBus::new();
        bus.publish("nobody/listening", b"payload");
    }
}
