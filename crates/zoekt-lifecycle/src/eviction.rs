//! Eviction of indices that outgrew their reservation.
//!
//! Critical-watermark indices are first flagged `pending_eviction`. The
//! eviction pass then drops their replica, which orphans the replica's
//! sibling indices and hands them to the orphan and deletion workers.

use tracing::{debug, info};
use zoekt_core::{BatchOutcome, epoch_secs, split_batch};
use zoekt_events::{Event, WorkerContext};
use zoekt_state::{IndexState, Replica, StateResult, scopes};

use crate::transition::transition_indices;

pub struct PendingEvictionWorker {
    ctx: WorkerContext,
}

impl PendingEvictionWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let outcome = transition_indices(
            &self.ctx,
            |tx| scopes::indices_should_be_pending_eviction(tx),
            IndexState::PendingEviction,
        )?;
        if outcome.processed > 0 {
            info!(count = outcome.processed, "marked critical indices pending eviction");
        }
        self.ctx
            .republish_if_remaining(&outcome, Event::IndexMarkPendingEviction);
        Ok(outcome)
    }
}

pub struct EvictionWorker {
    ctx: WorkerContext,
}

impl EvictionWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let now = epoch_secs();
        let limit = self.ctx.limits.batch_size;
        let (outcome, replicas_removed) = self.ctx.store.write(|tx| {
            let (batch, remaining) = split_batch(
                scopes::indices_in_state(tx, IndexState::PendingEviction)?,
                limit,
            );
            let mut replicas_removed = 0;
            for mut index in batch.iter().cloned() {
                if let Some(replica_id) = index.replica_id.take() {
                    if tx.remove::<Replica>(replica_id)? {
                        replicas_removed += 1;
                    }
                }
                index.transition(IndexState::Evicted, now);
                tx.put(&index)?;
            }
            Ok((BatchOutcome::new(batch.len(), remaining), replicas_removed))
        })?;

        if outcome.processed > 0 {
            info!(count = outcome.processed, replicas_removed, "evicted indices");
        } else {
            debug!("no indices pending eviction");
        }
        self.ctx.republish_if_remaining(&outcome, Event::IndexToEvict);
        Ok(outcome)
    }
}
