//! Publish channel for server-pushed events

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::Result;

/// One event as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub event: String,
    pub data: serde_json::Value,
}

/// Destination for server-pushed events
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &str, payload: serde_json::Value) -> Result<()>;
}

/// In-process fan-out over a tokio broadcast channel
///
/// Slow subscribers lag and skip events rather than holding back the sender.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl BroadcastPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        let event = PublishedEvent {
            event: event.to_string(),
            data: payload,
        };
        // No subscribers is fine
        if let Ok(receivers) = self.sender.send(event) {
            trace!(receivers, "Event published");
        }
        Ok(())
    }
}
