//! Batched state transitions shared by the index workers.

use zoekt_core::{BatchOutcome, epoch_secs, split_batch};
use zoekt_events::WorkerContext;
use zoekt_state::{Index, IndexState, Repository, RepositoryState, StateResult, WriteTx};

/// Move up to `batch_size` indices returned by `select` into `to`.
pub(crate) fn transition_indices(
    ctx: &WorkerContext,
    select: impl FnOnce(&WriteTx) -> StateResult<Vec<Index>>,
    to: IndexState,
) -> StateResult<BatchOutcome> {
    let now = epoch_secs();
    let limit = ctx.limits.batch_size;
    ctx.store.write(|tx| {
        let (batch, remaining) = split_batch(select(tx)?, limit);
        for mut index in batch.iter().cloned() {
            index.transition(to, now);
            tx.put(&index)?;
        }
        Ok(BatchOutcome::new(batch.len(), remaining))
    })
}

/// Move up to `batch_size` repositories returned by `select` into `to`.
pub(crate) fn transition_repositories(
    ctx: &WorkerContext,
    select: impl FnOnce(&WriteTx) -> StateResult<Vec<Repository>>,
    to: RepositoryState,
) -> StateResult<BatchOutcome> {
    let now = epoch_secs();
    let limit = ctx.limits.batch_size;
    ctx.store.write(|tx| {
        let (batch, remaining) = split_batch(select(tx)?, limit);
        for mut repo in batch.iter().cloned() {
            repo.transition(to, now);
            tx.put(&repo)?;
        }
        Ok(BatchOutcome::new(batch.len(), remaining))
    })
}
