//! `initializing → ready` once every repository has finished.

use tracing::{debug, info};
use zoekt_core::BatchOutcome;
use zoekt_events::{Event, WorkerContext};
use zoekt_state::{IndexState, StateResult, scopes};

use crate::transition::transition_indices;

pub struct MarkReadyWorker {
    ctx: WorkerContext,
}

impl MarkReadyWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let outcome = transition_indices(
            &self.ctx,
            |tx| scopes::indices_ready_to_mark(tx),
            IndexState::Ready,
        )?;
        if outcome.processed > 0 {
            info!(count = outcome.processed, "marked indices as ready");
        } else {
            debug!("no initializing indices with finished repositories");
        }
        self.ctx
            .republish_if_remaining(&outcome, Event::IndexMarkedAsReady);
        Ok(outcome)
    }
}
