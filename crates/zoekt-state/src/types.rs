//! Domain types for the Zoekt orchestration store.
//!
//! Nodes host indices; an index belongs to a replica of an enabled
//! namespace and owns one repository row per project it covers. Tasks are
//! the work items handed to the remote indexer running on each node. The
//! `projects` and `namespaces` tables mirror records owned by the host
//! application.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

pub type NodeId = u64;
pub type EnabledNamespaceId = u64;
pub type ReplicaId = u64;
pub type IndexId = u64;
pub type RepositoryId = u64;
pub type TaskId = u64;
pub type ProjectId = u64;
pub type NamespaceId = u64;

/// Reservation for a freshly provisioned index: 10 GiB.
pub const DEFAULT_RESERVED_STORAGE_BYTES: i64 = 10 * 1024 * 1024 * 1024;

/// Floor applied to an index's used storage when its repositories report nothing.
pub const DEFAULT_USED_STORAGE_BYTES: i64 = 1024;

// ── Node ───────────────────────────────────────────────────────────

pub const NODE_WATERMARK_LIMIT_LOW: f64 = 0.70;
pub const NODE_WATERMARK_LIMIT_HIGH: f64 = 0.75;
pub const NODE_WATERMARK_LIMIT_CRITICAL: f64 = 0.85;

/// A search node running the remote indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Stable identity reported by the agent.
    pub uuid: String,
    pub name: String,
    pub index_base_url: String,
    pub search_base_url: String,
    pub total_bytes: i64,
    pub used_bytes: i64,
    /// Bytes on disk currently taken by this node's own indices.
    pub indexed_bytes: i64,
    pub usable_storage_bytes: i64,
    /// While set and in the future, `usable_storage_bytes` is not recomputed.
    pub usable_storage_bytes_locked_until: Option<u64>,
    pub last_seen_at: u64,
    pub schema_version: u32,
    pub metadata: NodeMetadata,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeMetadata {
    pub task_count: Option<u32>,
    /// CPU count reported by the agent.
    pub concurrency: Option<u32>,
    pub concurrency_override: Option<u32>,
    pub version: Option<String>,
}

impl Node {
    pub fn new(uuid: &str, name: &str, now: u64) -> Self {
        Self {
            id: 0,
            uuid: uuid.to_string(),
            name: name.to_string(),
            index_base_url: String::new(),
            search_base_url: String::new(),
            total_bytes: 0,
            used_bytes: 0,
            indexed_bytes: 0,
            usable_storage_bytes: 0,
            usable_storage_bytes_locked_until: None,
            last_seen_at: now,
            schema_version: 0,
            metadata: NodeMetadata::default(),
            created_at: now,
        }
    }

    pub fn free_bytes(&self) -> i64 {
        self.total_bytes - self.used_bytes
    }

    pub fn storage_percent_used(&self) -> f64 {
        if self.total_bytes <= 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }

    pub fn watermark_exceeded_low(&self) -> bool {
        self.storage_percent_used() >= NODE_WATERMARK_LIMIT_LOW
    }

    pub fn watermark_exceeded_high(&self) -> bool {
        self.storage_percent_used() >= NODE_WATERMARK_LIMIT_HIGH
    }

    pub fn watermark_exceeded_critical(&self) -> bool {
        self.storage_percent_used() >= NODE_WATERMARK_LIMIT_CRITICAL
    }

    /// Recompute `usable_storage_bytes = free + indexed` unless locked.
    /// An expired lock is cleared.
    pub fn refresh_usable_storage_bytes(&mut self, now: u64) {
        match self.usable_storage_bytes_locked_until {
            Some(until) if until > now => {}
            _ => {
                self.usable_storage_bytes_locked_until = None;
                self.usable_storage_bytes = self.free_bytes() + self.indexed_bytes;
            }
        }
    }

    /// Lost when unseen for longer than `threshold_secs`. A disabled
    /// threshold means no node is ever lost.
    pub fn is_lost(&self, now: u64, threshold_secs: Option<u64>) -> bool {
        match threshold_secs {
            Some(threshold) => now.saturating_sub(self.last_seen_at) > threshold,
            None => false,
        }
    }

    pub fn is_online(&self, now: u64, threshold_secs: u64) -> bool {
        now.saturating_sub(self.last_seen_at) <= threshold_secs
    }
}

// ── Enabled namespace / replica ────────────────────────────────────

/// A root namespace opted in to code search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnabledNamespace {
    pub id: EnabledNamespaceId,
    pub root_namespace_id: NamespaceId,
    pub search: bool,
    pub last_rollout_failed_at: Option<u64>,
    pub metadata: EnabledNamespaceMetadata,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnabledNamespaceMetadata {
    pub last_used_storage_bytes: Option<i64>,
    pub last_rollout_error: Option<String>,
}

impl EnabledNamespace {
    pub fn new(root_namespace_id: NamespaceId, now: u64) -> Self {
        Self {
            id: 0,
            root_namespace_id,
            search: true,
            last_rollout_failed_at: None,
            metadata: EnabledNamespaceMetadata::default(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Pending,
    Ready,
}

/// One full copy of an enabled namespace's data spread over indices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub id: ReplicaId,
    pub enabled_namespace_id: EnabledNamespaceId,
    pub namespace_id: NamespaceId,
    pub state: ReplicaState,
    pub created_at: u64,
}

// ── Index ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Pending,
    Initializing,
    Ready,
    PendingEviction,
    Evicted,
    Orphaned,
    PendingDeletion,
}

impl IndexState {
    /// States that precede `ready`.
    pub fn is_pre_ready(&self) -> bool {
        matches!(self, IndexState::Pending | IndexState::Initializing)
    }

    /// States on their way out of the system.
    pub fn is_marked_for_removal(&self) -> bool {
        matches!(self, IndexState::Orphaned | IndexState::PendingDeletion)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkLevel {
    Overprovisioned,
    #[default]
    Healthy,
    LowWatermarkExceeded,
    HighWatermarkExceeded,
    CriticalWatermarkExceeded,
}

/// Range of project-namespace ids an index is responsible for.
/// Either side may be open.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexMetadata {
    pub project_namespace_id_from: Option<NamespaceId>,
    pub project_namespace_id_to: Option<NamespaceId>,
}

impl IndexMetadata {
    pub fn range(from: Option<NamespaceId>, to: Option<NamespaceId>) -> Self {
        Self {
            project_namespace_id_from: from,
            project_namespace_id_to: to,
        }
    }

    pub fn covers(&self, project_namespace_id: NamespaceId) -> bool {
        self.project_namespace_id_from
            .is_none_or(|from| project_namespace_id >= from)
            && self
                .project_namespace_id_to
                .is_none_or(|to| project_namespace_id <= to)
    }
}

/// A shard of a replica's data stored on exactly one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Index {
    pub id: IndexId,
    pub enabled_namespace_id: Option<EnabledNamespaceId>,
    pub replica_id: Option<ReplicaId>,
    pub node_id: NodeId,
    /// Root namespace whose projects this index covers.
    pub namespace_id: NamespaceId,
    pub state: IndexState,
    pub reserved_storage_bytes: i64,
    pub used_storage_bytes: i64,
    pub used_storage_bytes_updated_at: u64,
    pub last_indexed_at: u64,
    pub watermark_level: WatermarkLevel,
    pub metadata: IndexMetadata,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Index {
    pub fn new(node_id: NodeId, namespace_id: NamespaceId, now: u64) -> Self {
        Self {
            id: 0,
            enabled_namespace_id: None,
            replica_id: None,
            node_id,
            namespace_id,
            state: IndexState::Pending,
            reserved_storage_bytes: DEFAULT_RESERVED_STORAGE_BYTES,
            used_storage_bytes: 0,
            used_storage_bytes_updated_at: 0,
            last_indexed_at: 0,
            watermark_level: WatermarkLevel::Healthy,
            metadata: IndexMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn free_storage_bytes(&self) -> i64 {
        self.reserved_storage_bytes - self.used_storage_bytes
    }

    /// Used-storage figures predate the last indexing pass.
    pub fn used_storage_is_stale(&self) -> bool {
        self.used_storage_bytes_updated_at <= self.last_indexed_at
    }

    pub fn transition(&mut self, state: IndexState, now: u64) {
        self.state = state;
        self.updated_at = now;
    }
}

// ── Repository ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    Pending,
    Initializing,
    Ready,
    Failed,
    Orphaned,
    PendingDeletion,
}

impl RepositoryState {
    /// Indexing has concluded, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(self, RepositoryState::Ready | RepositoryState::Failed)
    }

    pub fn is_marked_for_removal(&self) -> bool {
        matches!(
            self,
            RepositoryState::Orphaned | RepositoryState::PendingDeletion
        )
    }
}

/// One project's presence in one index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: RepositoryId,
    pub index_id: IndexId,
    pub project_id: ProjectId,
    pub project_namespace_id: NamespaceId,
    pub size_bytes: i64,
    pub state: RepositoryState,
    pub retries_left: u32,
    pub indexed_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Repository {
    pub fn new(index_id: IndexId, project: &Project, retries: u32, now: u64) -> Self {
        Self {
            id: 0,
            index_id,
            project_id: project.id,
            project_namespace_id: project.project_namespace_id,
            size_bytes: 0,
            state: RepositoryState::Pending,
            retries_left: retries,
            indexed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, state: RepositoryState, now: u64) {
        self.state = state;
        self.updated_at = now;
    }
}

// ── Task ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IndexRepo,
    DeleteRepo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Processing)
    }
}

/// A unit of work for the remote indexer on `node_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub node_id: NodeId,
    pub repository_id: RepositoryId,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub retries_left: u32,
    pub perform_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Task {
    pub fn new(
        node_id: NodeId,
        repository: &Repository,
        task_type: TaskType,
        retries: u32,
        now: u64,
    ) -> Self {
        Self {
            id: 0,
            node_id,
            repository_id: repository.id,
            project_id: repository.project_id,
            task_type,
            state: TaskState::Pending,
            retries_left: retries,
            perform_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Mirrored host records ──────────────────────────────────────────

/// A project as known to the host application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub project_namespace_id: NamespaceId,
    pub root_namespace_id: NamespaceId,
}

/// A namespace as known to the host application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Namespace {
    pub id: NamespaceId,
    /// `None` for root namespaces.
    pub parent_id: Option<NamespaceId>,
    pub repository_size_bytes: i64,
    pub subscription: Option<Subscription>,
}

impl Namespace {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub paid: bool,
    pub trial: bool,
    /// Unix seconds; `None` for subscriptions without an end date.
    pub end_date: Option<u64>,
}

impl Subscription {
    pub fn is_active(&self, now: u64) -> bool {
        self.paid && !self.trial && self.end_date.is_none_or(|end| end >= now)
    }

    /// Ended more than `grace_secs` ago.
    pub fn expired_beyond(&self, now: u64, grace_secs: u64) -> bool {
        self.end_date
            .is_some_and(|end| end.saturating_add(grace_secs) < now)
    }
}
