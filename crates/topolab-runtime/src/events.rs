//! Runtime event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle events published by the drivers.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Container created and attached.
    NodeCreated { name: String, timestamp: i64 },
    /// Container task started.
    NodeStarted { name: String, timestamp: i64 },
    /// Container task stopped.
    NodeStopped { name: String, timestamp: i64 },
    /// Container removed.
    NodeDeleted { name: String, timestamp: i64 },
}

impl RuntimeEvent {
    /// Container the event is about.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::NodeCreated { name, .. }
            | Self::NodeStarted { name, .. }
            | Self::NodeStopped { name, .. }
            | Self::NodeDeleted { name, .. } => name,
        }
    }
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub(crate) fn created(&self, name: &str) {
        self.publish(RuntimeEvent::NodeCreated {
            name: name.to_string(),
            timestamp: now(),
        });
    }

    pub(crate) fn started(&self, name: &str) {
        self.publish(RuntimeEvent::NodeStarted {
            name: name.to_string(),
            timestamp: now(),
        });
    }

    pub(crate) fn stopped(&self, name: &str) {
        self.publish(RuntimeEvent::NodeStopped {
            name: name.to_string(),
            timestamp: now(),
        });
    }

    pub(crate) fn deleted(&self, name: &str) {
        self.publish(RuntimeEvent::NodeDeleted {
            name: name.to_string(),
            timestamp: now(),
        });
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.created("clab-lab-srl1");
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RuntimeEvent::NodeCreated { .. }));
        assert_eq!(event.name(), "clab-lab-srl1");
    }

    #[test]
    fn publish_without_subscribers() {
        EventBus::new().deleted("gone");
    }
}
