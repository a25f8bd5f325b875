//! Retry accounting for failed repository tasks.
//!
//! `TaskFailed` is published once per failure by the callback handler and
//! never re-published.

use tracing::{debug, info};
use zoekt_core::epoch_secs;
use zoekt_events::WorkerContext;
use zoekt_state::{
    Repository, RepositoryId, RepositoryState, Snapshot, StateResult, Task, TaskId, TaskType,
};

pub struct TaskFailedWorker {
    ctx: WorkerContext,
}

impl TaskFailedWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Returns the repository's new state, or `None` if the repository is gone.
    ///
    /// - `delete_repo` failures go back to `pending_deletion`.
    /// - `index_repo` failures go back to `pending` while more than one retry
    ///   is left; the last failure marks the repository `failed`.
    pub fn handle(
        &self,
        repository_id: RepositoryId,
        task_id: TaskId,
    ) -> StateResult<Option<RepositoryState>> {
        let now = epoch_secs();
        let result = self.ctx.store.write(|tx| {
            let Some(mut repo) = tx.get::<Repository>(repository_id)? else {
                return Ok(None);
            };
            let task_type = tx
                .get::<Task>(task_id)?
                .map(|task| task.task_type)
                .unwrap_or(TaskType::IndexRepo);

            match task_type {
                TaskType::DeleteRepo => {
                    repo.retries_left = repo.retries_left.saturating_sub(1);
                    repo.transition(RepositoryState::PendingDeletion, now);
                }
                TaskType::IndexRepo if repo.retries_left > 1 => {
                    repo.retries_left -= 1;
                    repo.transition(RepositoryState::Pending, now);
                }
                TaskType::IndexRepo => {
                    repo.retries_left = 0;
                    repo.transition(RepositoryState::Failed, now);
                }
            }
            tx.put(&repo)?;
            Ok(Some(repo))
        })?;

        match &result {
            Some(repo) if repo.state == RepositoryState::Failed => {
                info!(
                    repository_id,
                    task_id,
                    project_id = repo.project_id,
                    "repository indexing failed with no retries left, marking as failed"
                );
            }
            Some(repo) => {
                debug!(
                    repository_id,
                    task_id,
                    retries_left = repo.retries_left,
                    state = ?repo.state,
                    "repository task failed, will retry"
                );
            }
            None => {
                debug!(repository_id, task_id, "repository gone, ignoring task failure");
            }
        }
        Ok(result.map(|repo| repo.state))
    }
}
