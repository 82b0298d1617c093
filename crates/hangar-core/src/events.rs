//! Domain events / metrics hooks (spec §2.G): emission points only, with
//! fan-out external. Handlers must be non-blocking relative to the
//! lifecycle path, so this is a bounded broadcast channel — slow or absent
//! subscribers drop events rather than stall a Supervisor.

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    ProviderStateChanged {
        provider_id: String,
        from: &'static str,
        to: &'static str,
    },
    ColdStart {
        provider_id: String,
    },
    CircuitOpened {
        group_id: String,
    },
    CircuitClosed {
        group_id: String,
    },
    ReloadCompleted {
        added: Vec<String>,
        removed: Vec<String>,
        updated: Vec<String>,
        unchanged: Vec<String>,
    },
    ReloadFailed {
        reason: String,
    },
}

/// Process-wide event bus. Cloning gives an independent sender handle;
/// `subscribe()` gives each listener its own bounded queue.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Emit an event. Never blocks: a full subscriber queue drops its
    /// oldest entries rather than backpressuring the caller.
    pub fn emit(&self, event: DomainEvent) {
        // send() only errors when there are no subscribers, which is a
        // normal and expected state (no exporter attached yet).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(DomainEvent::ColdStart {
            provider_id: "p1".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DomainEvent::ColdStart { provider_id } if provider_id == "p1"));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(DomainEvent::CircuitOpened {
            group_id: "g1".to_string(),
        });
    }
}
