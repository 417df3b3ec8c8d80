//! Streaming event fan-out.
//!
//! One bounded broadcast channel per instance. Sending never blocks the
//! poll loop: a subscriber that falls behind by more than the channel
//! capacity observes a lag error and loses the overwritten events instead
//! of back-pressuring ingestion. Subscribers that join late only see
//! subsequent events — replay of finalized history is a store query, not a
//! publisher concern.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use agent_console_core::{ConversationRecord, MonitorEvent};

/// Per-instance broadcast hub for fragment and complete events.
pub struct StreamingPublisher {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<MonitorEvent>>>,
}

impl StreamingPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to one instance's event stream, creating the channel on
    /// first use.
    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<MonitorEvent> {
        let mut channels = self.channels.write().expect("publisher lock poisoned");
        channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish a partial, not-yet-attributed content preview.
    pub fn publish_fragment(&self, instance_id: &str, content: String, timestamp: DateTime<Utc>) {
        self.send(instance_id, MonitorEvent::fragment(instance_id, content, timestamp));
    }

    /// Publish a finalized, persisted message.
    pub fn publish_complete(&self, record: &ConversationRecord) {
        self.send(&record.instance_id, MonitorEvent::complete(record));
    }

    /// Number of live subscribers for an instance.
    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.channels
            .read()
            .expect("publisher lock poisoned")
            .get(instance_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop an instance's channel. Existing receivers see a `Closed` error
    /// on their next recv.
    pub fn remove(&self, instance_id: &str) {
        self.channels
            .write()
            .expect("publisher lock poisoned")
            .remove(instance_id);
    }

    fn send(&self, instance_id: &str, event: MonitorEvent) {
        let channels = self.channels.read().expect("publisher lock poisoned");
        if let Some(tx) = channels.get(instance_id) {
            // Err just means no subscriber is currently listening.
            let _ = tx.send(event);
        } else {
            trace!(instance_id, "no subscribers; event dropped");
        }
    }
}
