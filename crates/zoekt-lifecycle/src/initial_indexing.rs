//! Initial repository load for a freshly provisioned index.
//!
//! A `pending` index gets one `pending` repository per mirrored project of
//! its root namespace that falls inside the index's project-namespace range.
//! Creation is capped per invocation; the index only moves to
//! `initializing` once every target repository exists.

use std::collections::HashSet;

use tracing::{debug, info};
use zoekt_core::{BatchOutcome, epoch_secs, split_batch};
use zoekt_events::{Event, WorkerContext};
use zoekt_state::scopes;
use zoekt_state::{Index, IndexId, IndexState, ProjectId, Repository, Snapshot, StateResult};

pub struct InitialIndexingWorker {
    ctx: WorkerContext,
}

impl InitialIndexingWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self, index_id: IndexId) -> StateResult<BatchOutcome> {
        let now = epoch_secs();
        let limit = self.ctx.limits.initial_indexing_insert_limit;
        let retries = self.ctx.limits.repository_retries;

        let outcome = self.ctx.store.write(|tx| {
            let Some(mut index) = tx.get::<Index>(index_id)? else {
                return Ok(None);
            };
            if index.state != IndexState::Pending {
                return Ok(None);
            }

            let existing: HashSet<ProjectId> = tx
                .filter::<Repository, _>(|r| r.index_id == index.id)?
                .into_iter()
                .map(|r| r.project_id)
                .collect();
            let missing: Vec<_> =
                scopes::projects_in_range(tx, index.namespace_id, &index.metadata)?
                    .into_iter()
                    .filter(|p| !existing.contains(&p.id))
                    .collect();

            let (batch, remaining) = split_batch(missing, limit);
            for project in &batch {
                tx.insert(Repository::new(index.id, project, retries, now))?;
            }
            if !remaining {
                index.transition(IndexState::Initializing, now);
                tx.put(&index)?;
            }
            Ok(Some(BatchOutcome::new(batch.len(), remaining)))
        })?;

        let Some(outcome) = outcome else {
            debug!(index_id, "index missing or no longer pending, skipping initial indexing");
            return Ok(BatchOutcome::empty());
        };

        info!(
            index_id,
            created = outcome.processed,
            complete = !outcome.remaining,
            "initial indexing batch"
        );
        self.ctx
            .republish_if_remaining(&outcome, Event::InitialIndexing { index_id });
        Ok(outcome)
    }
}
