//! Event publication.
//!
//! Workers publish follow-up events synchronously from inside their batch
//! loop; delivery is at-least-once and handlers are idempotent.

use std::sync::Mutex;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

use crate::event::Event;

pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);
}

/// Publishes onto a tokio channel drained by the event consumer.
#[derive(Clone)]
pub struct ChannelBus {
    tx: UnboundedSender<Event>,
}

impl ChannelBus {
    pub fn new() -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventBus for ChannelBus {
    fn publish(&self, event: Event) {
        debug!(event = event.name(), "event published");
        if let Err(e) = self.tx.send(event) {
            warn!(event = e.0.name(), "event consumer gone, dropping event");
        }
    }
}

/// Captures published events in memory.
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<Event>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_bus_delivers_in_order() {
        let (bus, mut rx) = ChannelBus::new();
        bus.publish(Event::RepoToIndex);
        bus.publish(Event::LostNode { node_id: 4 });
        assert_eq!(rx.recv().await, Some(Event::RepoToIndex));
        assert_eq!(rx.recv().await, Some(Event::LostNode { node_id: 4 }));
    }

    #[test]
    fn publish_after_consumer_dropped_is_harmless() {
        let (bus, rx) = ChannelBus::new();
        drop(rx);
        bus.publish(Event::OrphanedIndex);
    }

    #[test]
    fn recording_bus_take() {
        let bus = RecordingBus::new();
        bus.publish(Event::IndexToEvict);
        bus.publish(Event::IndexToEvict);
        assert_eq!(bus.count(&Event::IndexToEvict), 2);
        assert_eq!(bus.take().len(), 2);
        assert!(bus.events().is_empty());
    }
}
