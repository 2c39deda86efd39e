//! A thread-safe topic broadcaster standing in for the store's change feed.
//!
//! Uses Tokio broadcast channels per topic. Listeners are counted per topic so
//! callers (and tests) can assert that a live view really let go of its
//! subscription on teardown.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// Type alias for topic name.
type Topic = String;

/// Sender for a topic's broadcast channel.
type Sender = broadcast::Sender<String>;

/// Receiver for a topic's broadcast channel.
pub type Receiver = broadcast::Receiver<String>;

const CHANNEL_CAPACITY: usize = 100;

/// Manages broadcast channels per topic.
///
/// - Lazily creates broadcast channels per topic on first subscription
/// - Removes topics whose subscriber count dropped to zero, after sending and
///   on every new subscription
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<HashMap<Topic, Sender>>>,
}

impl EventBus {
    /// Creates a new, empty `EventBus`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the given topic, creating it if necessary.
    pub async fn subscribe(&self, topic: &str) -> Receiver {
        let mut map = self.inner.write().await;
        prune_idle(&mut map);
        map.entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Broadcasts a message to all subscribers of `topic`.
    ///
    /// If the topic does not exist, it's a no-op.
    /// If the topic has zero subscribers after sending, it is removed.
    pub async fn broadcast<T: Into<String>>(&self, topic: &str, msg: T) {
        let mut map = self.inner.write().await;
        if let Some(sender) = map.get(topic) {
            let _ = sender.send(msg.into());
            if sender.receiver_count() == 0 {
                tracing::debug!("Removing topic '{topic}' due to no subscribers.");
                map.remove(topic);
            }
        }
    }

    /// Drops every topic nobody listens to. Returns how many went.
    pub async fn prune(&self) -> usize {
        let mut map = self.inner.write().await;
        prune_idle(&mut map)
    }

    /// Number of topics currently held.
    pub async fn topic_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Number of live receivers currently attached to `topic`.
    pub async fn listener_count(&self, topic: &str) -> usize {
        let map = self.inner.read().await;
        map.get(topic).map(|s| s.receiver_count()).unwrap_or(0)
    }
}

fn prune_idle(map: &mut HashMap<Topic, Sender>) -> usize {
    let before = map.len();
    map.retain(|topic, sender| {
        let keep = sender.receiver_count() > 0;
        if !keep {
            tracing::debug!("Removing idle topic '{topic}'.");
        }
        keep
    });
    before - map.len()
}
