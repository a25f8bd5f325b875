//! Teardown of indices marked `orphaned` or `pending_deletion`.
//!
//! An index with no repositories is destroyed on the spot. Otherwise its
//! repositories are flagged `pending_deletion` in capped batches, the
//! dispatcher issues delete tasks for them, and the index is destroyed on a
//! later pass once the last repository is gone.

use tracing::{debug, info};
use zoekt_core::{BatchOutcome, epoch_secs, split_batch};
use zoekt_events::{Event, WorkerContext};
use zoekt_state::{Index, RepositoryState, StateResult, scopes};

pub struct IndexDeletionWorker {
    ctx: WorkerContext,
}

impl IndexDeletionWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let now = epoch_secs();
        let limit = self.ctx.limits.batch_size;
        let per_index = self.ctx.limits.repositories_per_index_batch;

        let (outcome, destroyed, flagged) = self.ctx.store.write(|tx| {
            let (batch, mut remaining) =
                split_batch(scopes::indices_needing_deletion_work(tx)?, limit);
            let mut destroyed = 0;
            let mut flagged = 0;
            for (index, repos) in &batch {
                if repos.is_empty() {
                    tx.remove::<Index>(index.id)?;
                    destroyed += 1;
                    continue;
                }
                let mut to_flag: Vec<_> = repos
                    .iter()
                    .filter(|r| r.state != RepositoryState::PendingDeletion)
                    .cloned()
                    .collect();
                to_flag.sort_by_key(|r| r.id);
                let (repo_batch, more) = split_batch(to_flag, per_index);
                for mut repo in repo_batch {
                    repo.transition(RepositoryState::PendingDeletion, now);
                    tx.put(&repo)?;
                    flagged += 1;
                }
                remaining |= more;
            }
            Ok((BatchOutcome::new(batch.len(), remaining), destroyed, flagged))
        })?;

        if outcome.processed > 0 {
            info!(
                indices = outcome.processed,
                destroyed, flagged, "processed indices marked for deletion"
            );
        } else {
            debug!("no indices marked for deletion need work");
        }
        self.ctx
            .republish_if_remaining(&outcome, Event::IndexMarkedAsToDelete);
        Ok(outcome)
    }
}
