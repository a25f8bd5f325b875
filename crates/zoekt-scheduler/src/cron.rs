//! Cron entry point: one tick fans every scheduled task out as its own job.

use tokio::task::JoinSet;
use tracing::{debug, error};
use zoekt_events::WorkerContext;

use crate::service::SchedulingService;
use crate::task::ScheduledTask;

pub struct SchedulingWorker {
    ctx: WorkerContext,
}

impl SchedulingWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Returns false without doing anything while indexing is disabled or
    /// paused. Otherwise runs every task and waits for all of them.
    pub async fn perform(&self) -> bool {
        if !self.ctx.gates.licensed_and_indexing_enabled() {
            debug!("indexing not enabled, skipping scheduling tick");
            return false;
        }
        if self.ctx.gates.indexing_paused() {
            debug!("indexing paused, skipping scheduling tick");
            return false;
        }

        let service = SchedulingService::new(self.ctx.clone());
        let mut jobs = JoinSet::new();
        for task in ScheduledTask::ALL {
            let service = service.clone();
            jobs.spawn_blocking(move || (task, service.execute(task)));
        }
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((task, Err(e))) => {
                    error!(task = task.name(), error = %e, "scheduled task failed")
                }
                Err(e) => error!(error = %e, "scheduled task panicked"),
            }
        }
        true
    }
}
