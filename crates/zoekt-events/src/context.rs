//! Dependencies shared by every event handler.

use std::sync::Arc;

use tracing::debug;
use zoekt_core::{BatchOutcome, Gates, LimitsConfig, StaticGates};
use zoekt_state::{StateResult, StateStore};

use crate::bus::{EventBus, RecordingBus};
use crate::event::Event;

#[derive(Clone)]
pub struct WorkerContext {
    pub store: StateStore,
    pub limits: Arc<LimitsConfig>,
    pub gates: Arc<dyn Gates>,
    pub bus: Arc<dyn EventBus>,
}

impl WorkerContext {
    pub fn new(
        store: StateStore,
        limits: LimitsConfig,
        gates: Arc<dyn Gates>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            store,
            limits: Arc::new(limits),
            gates,
            bus,
        }
    }

    /// In-memory store wired to a [`RecordingBus`].
    pub fn in_memory(
        limits: LimitsConfig,
        gates: StaticGates,
    ) -> StateResult<(Self, Arc<RecordingBus>)> {
        let store = StateStore::open_in_memory()?;
        let bus = Arc::new(RecordingBus::new());
        let ctx = Self::new(store, limits, Arc::new(gates), bus.clone());
        Ok((ctx, bus))
    }

    /// Re-trigger `event` when the batch left work behind.
    pub fn republish_if_remaining(&self, outcome: &BatchOutcome, event: Event) {
        if outcome.should_republish() {
            debug!(
                event = event.name(),
                processed = outcome.processed,
                "more work remains, re-publishing"
            );
            self.bus.publish(event);
        }
    }

    /// Lost-node marking must be switched on, with indexing enabled and not paused.
    pub fn marking_lost_enabled(&self) -> bool {
        self.limits.lost_node_threshold().is_some()
            && self.gates.licensed_and_indexing_enabled()
            && !self.gates.indexing_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn republish_only_when_remaining() {
        let (ctx, bus) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        ctx.republish_if_remaining(&BatchOutcome::new(5, false), Event::OrphanedRepo);
        assert!(bus.events().is_empty());
        ctx.republish_if_remaining(&BatchOutcome::new(5, true), Event::OrphanedRepo);
        assert_eq!(bus.events(), vec![Event::OrphanedRepo]);
    }

    #[test]
    fn marking_lost_follows_config_and_gates() {
        let (ctx, _) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        assert!(ctx.marking_lost_enabled());

        let (paused, _) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::paused()).unwrap();
        assert!(!paused.marking_lost_enabled());

        let limits = LimitsConfig {
            mark_lost_enabled: false,
            ..LimitsConfig::default()
        };
        let (unset, _) = WorkerContext::in_memory(limits, StaticGates::default()).unwrap();
        assert!(!unset.marking_lost_enabled());
    }
}
