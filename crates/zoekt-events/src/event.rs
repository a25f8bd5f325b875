//! The closed set of events the orchestrator reacts to.

use serde::{Deserialize, Serialize};
use zoekt_state::{IndexId, NodeId, RepositoryId, TaskId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    InitialIndexing { index_id: IndexId },
    IndexMarkedAsReady,
    IndexMarkPendingEviction,
    IndexToEvict,
    IndexMarkedAsToDelete,
    OrphanedIndex,
    OrphanedRepo,
    RepoToIndex,
    RepoMarkedAsToDelete,
    TaskFailed {
        repository_id: RepositoryId,
        task_id: TaskId,
    },
    LostNode { node_id: NodeId },
    SaasRollout,
    UpdateIndexUsedStorageBytes,
    ForceUpdateOverprovisionedIndex,
    NodeWithNegativeUnclaimedStorage { node_ids: Vec<NodeId> },
}

/// How the consumer treats a duplicate of an event that is already queued
/// or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deduplication {
    /// Always run.
    None,
    /// Duplicates collapse into a single rerun after the running copy
    /// finishes.
    UntilExecuted,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::InitialIndexing { .. } => "initial_indexing",
            Event::IndexMarkedAsReady => "index_marked_as_ready",
            Event::IndexMarkPendingEviction => "index_mark_pending_eviction",
            Event::IndexToEvict => "index_to_evict",
            Event::IndexMarkedAsToDelete => "index_marked_as_to_delete",
            Event::OrphanedIndex => "orphaned_index",
            Event::OrphanedRepo => "orphaned_repo",
            Event::RepoToIndex => "repo_to_index",
            Event::RepoMarkedAsToDelete => "repo_marked_as_to_delete",
            Event::TaskFailed { .. } => "task_failed",
            Event::LostNode { .. } => "lost_node",
            Event::SaasRollout => "saas_rollout",
            Event::UpdateIndexUsedStorageBytes => "update_index_used_storage_bytes",
            Event::ForceUpdateOverprovisionedIndex => "force_update_overprovisioned_index",
            Event::NodeWithNegativeUnclaimedStorage { .. } => {
                "node_with_negative_unclaimed_storage"
            }
        }
    }

    /// Scope-driven batch events carry no payload worth running twice.
    /// Payload events (`TaskFailed`, `LostNode`, ...) always run; their
    /// handlers re-check the payload against current state.
    pub fn deduplication(&self) -> Deduplication {
        match self {
            Event::IndexMarkedAsReady
            | Event::IndexMarkPendingEviction
            | Event::IndexToEvict
            | Event::IndexMarkedAsToDelete
            | Event::OrphanedIndex
            | Event::OrphanedRepo
            | Event::RepoToIndex
            | Event::RepoMarkedAsToDelete
            | Event::SaasRollout
            | Event::UpdateIndexUsedStorageBytes
            | Event::ForceUpdateOverprovisionedIndex => Deduplication::UntilExecuted,
            Event::InitialIndexing { .. }
            | Event::TaskFailed { .. }
            | Event::LostNode { .. }
            | Event::NodeWithNegativeUnclaimedStorage { .. } => Deduplication::None,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serialization() {
        let event = Event::TaskFailed {
            repository_id: 3,
            task_id: 9,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"task_failed","repository_id":3,"task_id":9}"#);
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn batch_events_deduplicate() {
        assert_eq!(Event::RepoToIndex.deduplication(), Deduplication::UntilExecuted);
        assert_eq!(
            Event::LostNode { node_id: 1 }.deduplication(),
            Deduplication::None
        );
    }
}
