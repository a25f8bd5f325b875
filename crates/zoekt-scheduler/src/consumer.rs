//! Event consumer: routes published events to their workers.
//!
//! Handlers are blocking store transactions, so each runs on the blocking
//! pool under a semaphore permit. An event with
//! [`Deduplication::UntilExecuted`] that arrives while an identical one is
//! queued or running is folded into it: the running copy executes once more
//! after it finishes, however many duplicates arrived. Handler errors are
//! logged; the event is not retried, the next scheduler tick re-discovers
//! the work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use zoekt_capacity::{
    ForceUpdateOverprovisionedWorker, NegativeUnclaimedStorageWorker, UpdateUsedStorageWorker,
};
use zoekt_cluster::LostNodeWorker;
use zoekt_dispatch::{TaskDispatcher, TaskFailedWorker};
use zoekt_events::{Deduplication, Event, WorkerContext};
use zoekt_lifecycle::{
    EvictionWorker, IndexDeletionWorker, InitialIndexingWorker, MarkReadyWorker,
    OrphanedIndexWorker, OrphanedRepoWorker, PendingEvictionWorker,
};
use zoekt_rollout::SaasRolloutWorker;
use zoekt_state::StateResult;

/// Run the worker for `event` to completion.
pub fn route(ctx: &WorkerContext, event: &Event) -> StateResult<()> {
    let ctx = ctx.clone();
    match event {
        Event::InitialIndexing { index_id } => {
            InitialIndexingWorker::new(ctx).handle(*index_id)?;
        }
        Event::IndexMarkedAsReady => {
            MarkReadyWorker::new(ctx).handle()?;
        }
        Event::IndexMarkPendingEviction => {
            PendingEvictionWorker::new(ctx).handle()?;
        }
        Event::IndexToEvict => {
            EvictionWorker::new(ctx).handle()?;
        }
        Event::IndexMarkedAsToDelete => {
            IndexDeletionWorker::new(ctx).handle()?;
        }
        Event::OrphanedIndex => {
            OrphanedIndexWorker::new(ctx).handle()?;
        }
        Event::OrphanedRepo => {
            OrphanedRepoWorker::new(ctx).handle()?;
        }
        Event::RepoToIndex => {
            TaskDispatcher::new(ctx).index_repositories()?;
        }
        Event::RepoMarkedAsToDelete => {
            TaskDispatcher::new(ctx).delete_repositories()?;
        }
        Event::TaskFailed {
            repository_id,
            task_id,
        } => {
            TaskFailedWorker::new(ctx).handle(*repository_id, *task_id)?;
        }
        Event::LostNode { node_id } => {
            LostNodeWorker::new(ctx).handle(*node_id)?;
        }
        Event::SaasRollout => {
            SaasRolloutWorker::new(ctx).handle()?;
        }
        Event::UpdateIndexUsedStorageBytes => {
            UpdateUsedStorageWorker::new(ctx).handle()?;
        }
        Event::ForceUpdateOverprovisionedIndex => {
            ForceUpdateOverprovisionedWorker::new(ctx).handle()?;
        }
        Event::NodeWithNegativeUnclaimedStorage { node_ids } => {
            NegativeUnclaimedStorageWorker::new(ctx).handle(node_ids)?;
        }
    }
    Ok(())
}

pub struct EventConsumer {
    ctx: WorkerContext,
    permits: Arc<Semaphore>,
    /// In-flight deduplicated events and whether a rerun was requested.
    in_flight: Arc<Mutex<HashMap<Event, bool>>>,
}

impl EventConsumer {
    pub fn new(ctx: WorkerContext, concurrency: usize) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume until the channel closes or `shutdown` flips to true, then
    /// wait for running handlers. Handlers still waiting for a permit at
    /// shutdown give up without running.
    pub async fn run(
        &self,
        mut events: UnboundedReceiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("event consumer started");
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                received = events.recv() => {
                    let Some(event) = received else { break };
                    self.spawn(&mut handlers, event, shutdown.clone());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "event handler task failed");
                    }
                }
            }
        }
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "event handler task failed");
            }
        }
        info!("event consumer stopped");
    }

    fn spawn(&self, handlers: &mut JoinSet<()>, event: Event, mut stop: watch::Receiver<bool>) {
        let dedup = event.deduplication() == Deduplication::UntilExecuted;
        if dedup && !self.claim(&event) {
            debug!(event = event.name(), "duplicate event folded into running copy");
            return;
        }
        let ctx = self.ctx.clone();
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();
        handlers.spawn(async move {
            let permit = tokio::select! {
                acquired = permits.acquire_owned() => acquired.ok(),
                _ = stop.wait_for(|stopped| *stopped) => None,
            };
            let Some(permit) = permit else {
                debug!(event = event.name(), "consumer stopping, event dropped");
                if dedup {
                    forget(&in_flight, &event);
                }
                return;
            };

            let name = event.name();
            let claimed = event.clone();
            let released = in_flight.clone();
            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                loop {
                    if let Err(e) = route(&ctx, &event) {
                        error!(event = event.name(), error = %e, "event handler failed");
                    }
                    if !dedup || !release(&in_flight, &event) {
                        break;
                    }
                    debug!(event = event.name(), "rerunning folded duplicate");
                }
            });
            if let Err(e) = worker.await {
                error!(event = name, error = %e, "event handler panicked");
                if dedup {
                    forget(&released, &claimed);
                }
            }
        });
    }

    /// Record `event` as in flight. If it already is, request a rerun and
    /// return false.
    fn claim(&self, event: &Event) -> bool {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match in_flight.get_mut(event) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                in_flight.insert(event.clone(), false);
                true
            }
        }
    }
}

/// Drop the claim on `event` without running it.
fn forget(in_flight: &Mutex<HashMap<Event, bool>>, event: &Event) {
    in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(event);
}

/// Finish one execution of `event`. Returns true if a rerun was requested
/// meanwhile, in which case the event stays claimed.
fn release(in_flight: &Mutex<HashMap<Event, bool>>, event: &Event) -> bool {
    let mut in_flight = in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match in_flight.get_mut(event) {
        Some(rerun) if *rerun => {
            *rerun = false;
            true
        }
        _ => {
            in_flight.remove(event);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zoekt_core::{LimitsConfig, StaticGates};
    use zoekt_events::{ChannelBus, EventBus};
    use zoekt_state::{Index, IndexState, Node};

    #[test]
    fn route_runs_the_matching_worker() {
        let (ctx, _) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        let node = ctx.store.insert(Node::new("u", "n", 0)).unwrap();
        let index = ctx.store.insert(Index::new(node.id, 1, 0)).unwrap();

        route(&ctx, &Event::OrphanedIndex).unwrap();
        let index: Index = ctx.store.require(index.id).unwrap();
        assert_eq!(index.state, IndexState::Orphaned);
    }

    #[test]
    fn duplicates_fold_into_one_rerun() {
        let (ctx, _) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        let consumer = EventConsumer::new(ctx, 2);
        assert!(consumer.claim(&Event::RepoToIndex));
        assert!(!consumer.claim(&Event::RepoToIndex));
        assert!(!consumer.claim(&Event::RepoToIndex));
        assert!(consumer.claim(&Event::OrphanedRepo));

        assert!(release(&consumer.in_flight, &Event::RepoToIndex));
        assert!(!release(&consumer.in_flight, &Event::RepoToIndex));
        // Released for good: the next copy is claimed afresh.
        assert!(consumer.claim(&Event::RepoToIndex));
    }

    #[tokio::test]
    async fn run_drains_until_channel_closes() {
        let (ctx, _) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        let node = ctx.store.insert(Node::new("u", "n", 0)).unwrap();
        ctx.store.insert(Index::new(node.id, 1, 0)).unwrap();

        let (bus, rx) = ChannelBus::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        bus.publish(Event::OrphanedIndex);
        bus.publish(Event::OrphanedIndex);
        drop(bus);

        EventConsumer::new(ctx.clone(), 2).run(rx, shutdown_rx).await;
        let index = ctx.store.all::<Index>().unwrap().remove(0);
        assert_eq!(index.state, IndexState::Orphaned);
    }

    #[tokio::test]
    async fn shutdown_completes_while_permits_are_exhausted() {
        let (ctx, _) =
            WorkerContext::in_memory(LimitsConfig::default(), StaticGates::default()).unwrap();
        let node = ctx.store.insert(Node::new("u", "n", 0)).unwrap();
        let index = ctx.store.insert(Index::new(node.id, 1, 0)).unwrap();

        let consumer = Arc::new(EventConsumer::new(ctx.clone(), 1));
        let held = consumer.permits.clone().acquire_owned().await.unwrap();

        let (bus, rx) = ChannelBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(rx, shutdown_rx).await })
        };
        bus.publish(Event::OrphanedIndex);
        bus.publish(Event::LostNode { node_id: node.id });
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), running)
            .await
            .expect("consumer did not stop")
            .unwrap();
        drop(held);

        // Nothing ran, and nothing is left claimed.
        let index: Index = ctx.store.require(index.id).unwrap();
        assert_eq!(index.state, IndexState::Pending);
        assert!(consumer.in_flight.lock().unwrap().is_empty());
        assert!(consumer.claim(&Event::OrphanedIndex));
    }
}
