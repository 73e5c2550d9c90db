//! Internal Event Bus for Dispatch Coordination
//!
//! A process-wide broadcast channel for lifecycle events. Publishing never
//! blocks and never fails; events with no subscribers are dropped.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DispatchEvent {
    /// A graph step began executing a node
    StepStarted { session_id: String, node: String },
    /// A step's mutations were committed
    StepCommitted { session_id: String, node: String, revision: u64 },
    /// The session halted on a human-input node
    SessionSuspended { session_id: String, node: String },
    SessionCompleted { session_id: String, revision: u64 },
    SessionFailed { session_id: String, node: String, error: String },
    SessionExpired { session_id: String },
    CapabilityActivated { name: String, version: String },
    CapabilityDeactivated { name: String, version: String },
}

pub struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }

    /// Create a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }
}

lazy_static::lazy_static! {
    /// Global singleton instance of the EventBus
    pub static ref EVENT_BUS: Arc<EventBus> = Arc::new(EventBus::new());
}

/// Helper macro to publish events globally
#[macro_export]
macro_rules! emit_event {
    ($event:expr) => {
        $crate::orchestrator::event_bus::EVENT_BUS.publish($event)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DispatchEvent::SessionExpired {
            session_id: "s1".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            DispatchEvent::SessionExpired {
                session_id: "s1".into()
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(DispatchEvent::CapabilityActivated {
            name: "greeter".into(),
            version: "1.0.0".into(),
        });
    }
}
