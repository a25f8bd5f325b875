//! Task dispatcher: turns eligible repositories into node tasks.
//!
//! Each task type has a ceiling on in-flight (`pending` + `processing`)
//! tasks. At or above the ceiling the dispatcher produces nothing and does
//! not re-publish; the next scheduler tick retries. Below it, at most
//! `min(batch_size, ceiling - in_flight)` tasks are created, one per
//! repository, on the node hosting the repository's index.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use zoekt_core::{BatchOutcome, epoch_secs, split_batch};
use zoekt_events::{Event, WorkerContext};
use zoekt_state::scopes;
use zoekt_state::{
    Index, IndexId, IndexState, Repository, RepositoryState, Snapshot, StateResult, Task,
    TaskType, WriteTx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The in-flight ceiling was reached; nothing was queued.
    Blocked { in_flight: usize },
    Dispatched(BatchOutcome),
}

impl DispatchOutcome {
    pub fn tasks_created(&self) -> usize {
        match self {
            DispatchOutcome::Blocked { .. } => 0,
            DispatchOutcome::Dispatched(outcome) => outcome.processed,
        }
    }
}

pub struct TaskDispatcher {
    ctx: WorkerContext,
}

impl TaskDispatcher {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Handle `RepoToIndex`.
    pub fn index_repositories(&self) -> StateResult<DispatchOutcome> {
        self.dispatch(TaskType::IndexRepo)
    }

    /// Handle `RepoMarkedAsToDelete`.
    pub fn delete_repositories(&self) -> StateResult<DispatchOutcome> {
        self.dispatch(TaskType::DeleteRepo)
    }

    fn dispatch(&self, task_type: TaskType) -> StateResult<DispatchOutcome> {
        let (ceiling, event) = match task_type {
            TaskType::IndexRepo => (self.ctx.limits.index_task_ceiling, Event::RepoToIndex),
            TaskType::DeleteRepo => (
                self.ctx.limits.delete_task_ceiling,
                Event::RepoMarkedAsToDelete,
            ),
        };
        let now = epoch_secs();
        let batch_size = self.ctx.limits.batch_size;
        let retries = self.ctx.limits.task_retries;

        let outcome = self.ctx.store.write(|tx| {
            let in_flight = scopes::in_flight_task_count(tx, task_type)?;
            if in_flight >= ceiling {
                return Ok(DispatchOutcome::Blocked { in_flight });
            }
            let indices: HashMap<IndexId, Index> = tx
                .all::<Index>()?
                .into_iter()
                .map(|idx| (idx.id, idx))
                .collect();
            let candidates = match task_type {
                TaskType::IndexRepo => indexable(tx, &indices)?,
                TaskType::DeleteRepo => {
                    purge_indexless(tx, &indices)?;
                    scopes::repositories_should_be_deleted(tx)?
                        .into_iter()
                        .filter(|r| indices.contains_key(&r.index_id))
                        .collect()
                }
            };

            let (batch, remaining) = split_batch(candidates, batch_size.min(ceiling - in_flight));
            let next_state = match task_type {
                TaskType::IndexRepo => RepositoryState::Initializing,
                TaskType::DeleteRepo => RepositoryState::PendingDeletion,
            };
            for mut repo in batch.iter().cloned() {
                let Some(index) = indices.get(&repo.index_id) else {
                    continue;
                };
                tx.insert(Task::new(index.node_id, &repo, task_type, retries, now))?;
                if repo.state != next_state {
                    repo.transition(next_state, now);
                    tx.put(&repo)?;
                }
            }
            Ok(DispatchOutcome::Dispatched(BatchOutcome::new(
                batch.len(),
                remaining,
            )))
        })?;

        match outcome {
            DispatchOutcome::Blocked { in_flight } => {
                warn!(?task_type, in_flight, ceiling, "task ceiling reached, skipping dispatch");
            }
            DispatchOutcome::Dispatched(batch) => {
                if batch.processed > 0 {
                    info!(?task_type, count = batch.processed, "created repository tasks");
                } else {
                    debug!(?task_type, "no repositories awaiting tasks");
                }
                self.ctx.republish_if_remaining(&batch, event);
            }
        }
        Ok(outcome)
    }
}

/// Repositories awaiting indexing whose index is still live.
fn indexable(tx: &WriteTx, indices: &HashMap<IndexId, Index>) -> StateResult<Vec<Repository>> {
    Ok(scopes::repositories_should_be_indexed(tx)?
        .into_iter()
        .filter(|r| {
            indices.get(&r.index_id).is_some_and(|idx| {
                !idx.state.is_marked_for_removal() && idx.state != IndexState::Evicted
            })
        })
        .collect())
}

/// Repositories marked for removal whose index is already gone have no node
/// to delete from; drop the rows directly.
fn purge_indexless(tx: &WriteTx, indices: &HashMap<IndexId, Index>) -> StateResult<usize> {
    let ids: Vec<u64> = tx
        .filter::<Repository, _>(|r| {
            r.state.is_marked_for_removal() && !indices.contains_key(&r.index_id)
        })?
        .into_iter()
        .map(|r| r.id)
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    let removed = tx.remove_many::<Repository>(&ids)?;
    debug!(removed, "removed repositories without an index");
    Ok(removed)
}
