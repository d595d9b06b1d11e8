//! Event sink implementations
//!
//! The host publishes lifecycle events (`plugin.loaded`, `plugin.unloaded`,
//! `plugin.hot_reloaded`, ...) through an [`EventSink`]. External systems
//! subscribe through the broadcast sink; tests and embedded uses can pass the
//! null sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use tessera_plugin_api::EventSink;

/// A published host event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEvent {
    /// Topic, dot-separated (`plugin.loaded`)
    pub topic: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// When the event was published
    pub timestamp: DateTime<Utc>,
}

/// Event sink backed by a tokio broadcast channel.
///
/// Slow subscribers lag and lose old events instead of blocking publishers.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<HostEvent>,
}

impl BroadcastEventSink {
    /// Create a sink with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all published events
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = HostEvent {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        // Err here means no subscribers, which is fine
        if self.tx.send(event).is_err() {
            tracing::trace!(topic = %topic, "event published with no subscribers");
        }
    }
}

/// Sink that discards every event
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _topic: &str, _payload: serde_json::Value) {}
}
