//! Orphan detection.
//!
//! Indices lose their parent when the replica or enabled namespace goes
//! away; repositories when their project or index does. Both are flagged
//! `orphaned` and left for the deletion workers.

use tracing::info;
use zoekt_core::BatchOutcome;
use zoekt_events::{Event, WorkerContext};
use zoekt_state::{IndexState, RepositoryState, StateResult, scopes};

use crate::transition::{transition_indices, transition_repositories};

pub struct OrphanedIndexWorker {
    ctx: WorkerContext,
}

impl OrphanedIndexWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let outcome = transition_indices(
            &self.ctx,
            |tx| scopes::indices_should_be_marked_as_orphaned(tx),
            IndexState::Orphaned,
        )?;
        if outcome.processed > 0 {
            info!(count = outcome.processed, "marked indices as orphaned");
        }
        self.ctx.republish_if_remaining(&outcome, Event::OrphanedIndex);
        Ok(outcome)
    }
}

pub struct OrphanedRepoWorker {
    ctx: WorkerContext,
}

impl OrphanedRepoWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let outcome = transition_repositories(
            &self.ctx,
            |tx| scopes::repositories_should_be_marked_as_orphaned(tx),
            RepositoryState::Orphaned,
        )?;
        if outcome.processed > 0 {
            info!(count = outcome.processed, "marked repositories as orphaned");
        }
        self.ctx.republish_if_remaining(&outcome, Event::OrphanedRepo);
        Ok(outcome)
    }
}
