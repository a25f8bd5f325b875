//! Completion reports from the remote indexer.
//!
//! The indexer on each node reports every task it finishes. Successful
//! index tasks mark the repository `ready` and bump the index's
//! `last_indexed_at`, which makes its used-storage figures stale. Successful
//! delete tasks remove the repository row. Failures publish `TaskFailed`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zoekt_core::epoch_secs;
use zoekt_events::{Event, WorkerContext};
use zoekt_state::{
    Index, Repository, RepositoryState, Snapshot, StateResult, Task, TaskId, TaskState, TaskType,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskReport {
    Success {
        /// On-disk size of the indexed repository.
        #[serde(default)]
        size_bytes: i64,
    },
    Failure {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    UnknownTask,
    /// The task was already `done` or `failed`.
    AlreadyFinished,
    Completed,
    Failed,
}

pub struct TaskCallbackService {
    ctx: WorkerContext,
}

impl TaskCallbackService {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn process(&self, task_id: TaskId, report: &TaskReport) -> StateResult<CallbackOutcome> {
        let now = epoch_secs();
        let (outcome, failed_repo) = self.ctx.store.write(|tx| {
            let Some(mut task) = tx.get::<Task>(task_id)? else {
                return Ok((CallbackOutcome::UnknownTask, None));
            };
            if !task.state.is_in_flight() {
                return Ok((CallbackOutcome::AlreadyFinished, None));
            }
            task.updated_at = now;

            match report {
                TaskReport::Failure { .. } => {
                    task.state = TaskState::Failed;
                    tx.put(&task)?;
                    Ok((CallbackOutcome::Failed, Some(task.repository_id)))
                }
                TaskReport::Success { size_bytes } => {
                    task.state = TaskState::Done;
                    tx.put(&task)?;
                    match task.task_type {
                        TaskType::IndexRepo => {
                            if let Some(mut repo) = tx.get::<Repository>(task.repository_id)? {
                                repo.size_bytes = *size_bytes;
                                repo.indexed_at = Some(now);
                                repo.transition(RepositoryState::Ready, now);
                                tx.put(&repo)?;
                                if let Some(mut index) = tx.get::<Index>(repo.index_id)? {
                                    index.last_indexed_at = now;
                                    index.updated_at = now;
                                    tx.put(&index)?;
                                }
                            }
                        }
                        TaskType::DeleteRepo => {
                            tx.remove::<Repository>(task.repository_id)?;
                        }
                    }
                    Ok((CallbackOutcome::Completed, None))
                }
            }
        })?;

        match (outcome, failed_repo) {
            (CallbackOutcome::Failed, Some(repository_id)) => {
                if let TaskReport::Failure { error } = report {
                    info!(task_id, repository_id, %error, "indexer reported task failure");
                }
                self.ctx.bus.publish(Event::TaskFailed {
                    repository_id,
                    task_id,
                });
            }
            (CallbackOutcome::Completed, _) => debug!(task_id, "task completed"),
            (other, _) => debug!(task_id, ?other, "ignoring task report"),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zoekt_core::{LimitsConfig, StaticGates};
    use zoekt_state::Project;

    fn seed(ctx: &WorkerContext, task_type: TaskType) -> (Index, Repository, Task) {
        ctx.store
            .write(|tx| {
                let index = tx.insert(Index::new(1, 1, 0))?;
                let project = Project {
                    id: 1,
                    project_namespace_id: 1,
                    root_namespace_id: 1,
                };
                let mut repo = Repository::new(index.id, &project, 3, 0);
                repo.state = RepositoryState::Initializing;
                let repo = tx.insert(repo)?;
                let task = tx.insert(Task::new(1, &repo, task_type, 5, 0))?;
                Ok((index, repo, task))
            })
            .unwrap()
    }

    #[test]
    fn index_success_marks_repository_ready() {
        let (ctx, bus) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        let (index, repo, task) = seed(&ctx, TaskType::IndexRepo);
        let service = TaskCallbackService::new(ctx.clone());

        let outcome = service
            .process(task.id, &TaskReport::Success { size_bytes: 4096 })
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Completed);

        let repo: Repository = ctx.store.require(repo.id).unwrap();
        assert_eq!(repo.state, RepositoryState::Ready);
        assert_eq!(repo.size_bytes, 4096);
        let index: Index = ctx.store.require(index.id).unwrap();
        assert!(index.last_indexed_at > 0);
        assert!(index.used_storage_is_stale());
        assert!(bus.events().is_empty());

        let again = service
            .process(task.id, &TaskReport::Success { size_bytes: 1 })
            .unwrap();
        assert_eq!(again, CallbackOutcome::AlreadyFinished);
    }

    #[test]
    fn delete_success_removes_repository() {
        let (ctx, _) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        let (_, repo, task) = seed(&ctx, TaskType::DeleteRepo);
        TaskCallbackService::new(ctx.clone())
            .process(task.id, &TaskReport::Success { size_bytes: 0 })
            .unwrap();
        assert!(ctx.store.get::<Repository>(repo.id).unwrap().is_none());
        let task: Task = ctx.store.require(task.id).unwrap();
        assert_eq!(task.state, TaskState::Done);
    }

    #[test]
    fn failure_publishes_once() {
        let (ctx, bus) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        let (_, repo, task) = seed(&ctx, TaskType::IndexRepo);
        let service = TaskCallbackService::new(ctx);
        let report = TaskReport::Failure {
            error: "disk full".into(),
        };

        assert_eq!(service.process(task.id, &report).unwrap(), CallbackOutcome::Failed);
        assert_eq!(service.process(task.id, &report).unwrap(), CallbackOutcome::AlreadyFinished);
        assert_eq!(
            bus.events(),
            vec![Event::TaskFailed {
                repository_id: repo.id,
                task_id: task.id
            }]
        );
        assert_eq!(service.process(999, &report).unwrap(), CallbackOutcome::UnknownTask);
    }

    #[test]
    fn report_wire_format() {
        let report: TaskReport =
            serde_json::from_str(r#"{"status":"success","size_bytes":12}"#).unwrap();
        assert_eq!(report, TaskReport::Success { size_bytes: 12 });
    }
}
