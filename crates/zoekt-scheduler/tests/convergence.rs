//! End-to-end runs of the scheduling loop against an on-disk store.
//!
//! Each round runs every scheduled task once, then drains the published
//! events through the router until nothing is left, standing in for the
//! daemon's cron and consumer loops.

use std::sync::Arc;

use tempfile::TempDir;
use zoekt_cluster::{DiskStats, MembershipManager, TaskRequest};
use zoekt_core::{LimitsConfig, SECONDS_PER_DAY, StaticGates, epoch_secs};
use zoekt_dispatch::{TaskCallbackService, TaskReport};
use zoekt_events::{RecordingBus, WorkerContext};
use zoekt_scheduler::{ScheduledTask, SchedulingService, SchedulingWorker, route};
use zoekt_state::{
    EnabledNamespace, Index, IndexState, Namespace, Node, Project, Replica, ReplicaState,
    Repository, RepositoryState, StateStore, Subscription, Task, TaskState, TaskType,
};

struct Harness {
    _dir: TempDir,
    ctx: WorkerContext,
    bus: Arc<RecordingBus>,
    service: SchedulingService,
}

impl Harness {
    fn new(gates: StaticGates) -> Self {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&dir.path().join("state.redb")).unwrap();
        let bus = Arc::new(RecordingBus::new());
        let ctx = WorkerContext::new(store, LimitsConfig::default(), Arc::new(gates), bus.clone());
        let service = SchedulingService::new(ctx.clone());
        Self {
            _dir: dir,
            ctx,
            bus,
            service,
        }
    }

    fn round(&self) {
        for task in ScheduledTask::ALL {
            self.service.execute(task).unwrap();
        }
        loop {
            let events = self.bus.take();
            if events.is_empty() {
                break;
            }
            for event in &events {
                route(&self.ctx, event).unwrap();
            }
        }
    }

    /// Pull tasks as the node would and report them all successful.
    fn node_works_off_tasks(&self, uuid: &str) -> usize {
        let membership = MembershipManager::new(self.ctx.clone());
        let callbacks = TaskCallbackService::new(self.ctx.clone());
        let assignment = membership.task_request(&task_request(uuid)).unwrap();
        for task in &assignment.tasks {
            callbacks
                .process(task.id, &TaskReport::Success { size_bytes: 1000 })
                .unwrap();
        }
        assignment.tasks.len()
    }
}

fn task_request(uuid: &str) -> TaskRequest {
    TaskRequest {
        uuid: uuid.to_string(),
        node_name: format!("zoekt-{uuid}"),
        node_url: format!("http://{uuid}:6060"),
        search_url: None,
        disk: DiskStats {
            all: 50_000_000_000,
            free: 50_000_000_000,
            used: 0,
            indexed: 0,
        },
        task_count: Some(0),
        concurrency: Some(8),
        version: Some("1.0.0".to_string()),
        schema_version: None,
    }
}

fn seed_namespace(store: &StateStore, subscription: Subscription) {
    store
        .write(|tx| {
            tx.put(&Namespace {
                id: 1,
                parent_id: None,
                repository_size_bytes: 4000,
                subscription: Some(subscription),
            })?;
            for id in [10, 11] {
                tx.put(&Project {
                    id,
                    project_namespace_id: id,
                    root_namespace_id: 1,
                })?;
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn paid_namespace_converges_to_ready_replica() {
    let h = Harness::new(StaticGates::saas());
    seed_namespace(
        &h.ctx.store,
        Subscription {
            paid: true,
            trial: false,
            end_date: None,
        },
    );
    MembershipManager::new(h.ctx.clone())
        .task_request(&task_request("a"))
        .unwrap();

    let mut worked = 0;
    for _ in 0..8 {
        h.round();
        worked += h.node_works_off_tasks("a");
    }
    assert_eq!(worked, 2);

    let enabled = h.ctx.store.all::<EnabledNamespace>().unwrap();
    assert_eq!(enabled.len(), 1);
    let replicas = h.ctx.store.all::<Replica>().unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].state, ReplicaState::Ready);

    let indices = h.ctx.store.all::<Index>().unwrap();
    assert_eq!(indices.len(), 1);
    assert_eq!(indices[0].state, IndexState::Ready);
    assert_eq!(indices[0].used_storage_bytes, 2000);

    let repos = h.ctx.store.all::<Repository>().unwrap();
    assert_eq!(repos.len(), 2);
    assert!(repos.iter().all(|r| r.state == RepositoryState::Ready));
    assert!(h
        .ctx
        .store
        .all::<Task>()
        .unwrap()
        .iter()
        .all(|t| t.state == TaskState::Done));
}

#[test]
fn lapsed_subscription_tears_everything_down() {
    let h = Harness::new(StaticGates::saas());
    seed_namespace(
        &h.ctx.store,
        Subscription {
            paid: true,
            trial: false,
            end_date: None,
        },
    );
    MembershipManager::new(h.ctx.clone())
        .task_request(&task_request("a"))
        .unwrap();
    for _ in 0..8 {
        h.round();
        h.node_works_off_tasks("a");
    }
    assert_eq!(h.ctx.store.all::<Repository>().unwrap().len(), 2);

    // The subscription ended well past the grace period.
    let mut namespace: Namespace = h.ctx.store.require(1).unwrap();
    namespace.subscription = Some(Subscription {
        paid: true,
        trial: false,
        end_date: Some(epoch_secs() - 40 * SECONDS_PER_DAY),
    });
    h.ctx.store.put(&namespace).unwrap();

    for _ in 0..8 {
        h.round();
        h.node_works_off_tasks("a");
    }
    assert!(h.ctx.store.all::<EnabledNamespace>().unwrap().is_empty());
    assert!(h.ctx.store.all::<Replica>().unwrap().is_empty());
    assert!(h.ctx.store.all::<Index>().unwrap().is_empty());
    assert!(h.ctx.store.all::<Repository>().unwrap().is_empty());
    let deletes = h
        .ctx
        .store
        .all::<Task>()
        .unwrap()
        .into_iter()
        .filter(|t| t.task_type == TaskType::DeleteRepo)
        .count();
    assert_eq!(deletes, 2);
}

#[test]
fn lost_node_is_removed_with_its_indices() {
    let h = Harness::new(StaticGates::default());
    let (node, task) = h
        .ctx
        .store
        .write(|tx| {
            let mut node = Node::new("gone", "zoekt-gone", 0);
            node.last_seen_at = epoch_secs() - 2 * SECONDS_PER_DAY;
            let node = tx.insert(node)?;
            let index = tx.insert(Index::new(node.id, 1, 0))?;
            let project = Project {
                id: 10,
                project_namespace_id: 10,
                root_namespace_id: 1,
            };
            tx.put(&project)?;
            let repo = tx.insert(Repository::new(index.id, &project, 3, 0))?;
            let task = tx.insert(Task::new(node.id, &repo, TaskType::IndexRepo, 5, 0))?;
            Ok((node, task))
        })
        .unwrap();

    h.round();

    assert!(h.ctx.store.get::<Node>(node.id).unwrap().is_none());
    assert!(h.ctx.store.all::<Index>().unwrap().is_empty());
    assert!(h.ctx.store.all::<Repository>().unwrap().is_empty());
    assert!(h.ctx.store.get::<Task>(task.id).unwrap().is_some());
}

#[tokio::test]
async fn paused_indexing_leaves_state_alone() {
    let h = Harness::new(StaticGates::paused());
    h.ctx
        .store
        .insert(Node::new("gone", "zoekt-gone", 0))
        .unwrap();
    assert!(!SchedulingWorker::new(h.ctx.clone()).perform().await);
    assert!(h.bus.events().is_empty());
    assert_eq!(h.ctx.store.all::<Node>().unwrap().len(), 1);
}
