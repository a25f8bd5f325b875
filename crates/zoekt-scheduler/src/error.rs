//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown scheduled task: {0}")]
    UnknownTask(String),

    #[error("state store error: {0}")]
    State(#[from] zoekt_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
