//! Membership manager: tracks search nodes through their task requests.
//!
//! Nodes never register explicitly. Every task request from a node's
//! indexer upserts the node by uuid, refreshes its disk figures and
//! `last_seen_at`, and hands back the tasks it should work on next.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zoekt_core::epoch_secs;
use zoekt_events::WorkerContext;
use zoekt_state::{Node, NodeId, Snapshot, StateResult, Task, TaskState, scopes};

/// Polling interval handed to an idle node.
pub const TASK_PULL_FREQUENCY_DEFAULT_MS: u64 = 10_000;
/// Polling interval handed to a node with a backlog.
pub const TASK_PULL_FREQUENCY_INCREASED_MS: u64 = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskStats {
    pub all: i64,
    pub free: i64,
    pub used: i64,
    /// Bytes taken by the node's own index shards.
    pub indexed: i64,
}

/// Payload of a task request sent by a node's indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub uuid: String,
    pub node_name: String,
    pub node_url: String,
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub disk: DiskStats,
    #[serde(default)]
    pub task_count: Option<u32>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub schema_version: Option<u32>,
}

/// Response to a task request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignment {
    pub node_id: NodeId,
    pub tasks: Vec<Task>,
    pub pull_frequency_ms: u64,
}

pub struct MembershipManager {
    ctx: WorkerContext,
}

impl MembershipManager {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Upsert the node identified by `request.uuid`.
    pub fn find_or_initialize_by_task_request(&self, request: &TaskRequest) -> StateResult<Node> {
        let now = epoch_secs();
        self.ctx.store.write(|tx| upsert_node(tx, request, now))
    }

    /// Tasks this node may run concurrently.
    ///
    /// An explicit override wins; otherwise the reported CPU count scaled by
    /// the configured ratio, clamped to the maximum. Nodes reporting nothing
    /// get the default.
    pub fn concurrency_limit(&self, node: &Node) -> u32 {
        let limits = &self.ctx.limits;
        if let Some(limit) = node.metadata.concurrency_override.filter(|o| *o > 0) {
            return limit;
        }
        let cpus = node.metadata.concurrency.unwrap_or(0) as f64;
        let calculated = (cpus * limits.cpu_to_tasks_ratio).round() as u32;
        if calculated == 0 {
            return limits.default_concurrency_limit;
        }
        calculated.min(limits.max_concurrency_limit)
    }

    /// Register the node and claim its next batch of pending tasks.
    pub fn task_request(&self, request: &TaskRequest) -> StateResult<TaskAssignment> {
        let now = epoch_secs();
        let assignment = self.ctx.store.write(|tx| {
            let node = upsert_node(tx, request, now)?;
            let limit = self.concurrency_limit(&node) as usize;

            let mut pending = tx.filter::<Task, _>(|t| {
                t.node_id == node.id && t.state == TaskState::Pending && t.perform_at <= now
            })?;
            pending.sort_by_key(|t| (t.perform_at, t.id));
            let backlog = pending.len();

            let mut tasks = Vec::new();
            for mut task in pending.into_iter().take(limit) {
                task.state = TaskState::Processing;
                task.updated_at = now;
                tx.put(&task)?;
                tasks.push(task);
            }
            let pull_frequency_ms = if backlog >= limit {
                TASK_PULL_FREQUENCY_INCREASED_MS
            } else {
                TASK_PULL_FREQUENCY_DEFAULT_MS
            };
            Ok(TaskAssignment {
                node_id: node.id,
                tasks,
                pull_frequency_ms,
            })
        })?;
        debug!(
            node_id = assignment.node_id,
            count = assignment.tasks.len(),
            pull_frequency_ms = assignment.pull_frequency_ms,
            "task request served"
        );
        Ok(assignment)
    }

    pub fn online_nodes(&self) -> StateResult<Vec<Node>> {
        let now = epoch_secs();
        let threshold = self.ctx.limits.online_threshold_secs;
        self.ctx
            .store
            .read(|tx| tx.filter::<Node, _>(|n| n.is_online(now, threshold)))
    }

    /// Nodes unseen for longer than the lost-node threshold.
    pub fn lost_nodes(&self) -> StateResult<Vec<Node>> {
        let now = epoch_secs();
        let threshold = self.ctx.limits.lost_node_threshold();
        self.ctx
            .store
            .read(|tx| scopes::lost_nodes(tx, now, threshold))
    }
}

fn upsert_node(tx: &zoekt_state::WriteTx, request: &TaskRequest, now: u64) -> StateResult<Node> {
    let existing = tx
        .filter::<Node, _>(|n| n.uuid == request.uuid)?
        .into_iter()
        .next();
    let is_new = existing.is_none();
    let mut node = existing.unwrap_or_else(|| Node::new(&request.uuid, &request.node_name, now));

    node.name = request.node_name.clone();
    node.index_base_url = request.node_url.clone();
    node.search_base_url = request
        .search_url
        .clone()
        .unwrap_or_else(|| request.node_url.clone());
    node.total_bytes = request.disk.all;
    node.used_bytes = request.disk.used;
    node.indexed_bytes = request.disk.indexed;
    node.last_seen_at = now;
    node.metadata.task_count = request.task_count;
    node.metadata.concurrency = request.concurrency;
    node.metadata.version = request.version.clone();
    if let Some(schema_version) = request.schema_version {
        node.schema_version = schema_version;
    }
    node.refresh_usable_storage_bytes(now);

    let node = if is_new {
        let node = tx.insert(node)?;
        info!(node_id = node.id, uuid = %node.uuid, name = %node.name, "search node registered");
        node
    } else {
        tx.put(&node)?;
        node
    };
    Ok(node)
}
