//! The fixed registry of periodic checks.

use std::fmt;
use std::str::FromStr;

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledTask {
    MarkIndicesAsReady,
    InitialIndexing,
    AutoIndexSelfManaged,
    UpdateReplicaStates,
    UpdateIndexUsedStorageBytes,
    IndexShouldBeMarkedAsOrphanedCheck,
    IndexToDeleteCheck,
    RepoShouldBeMarkedAsOrphanedCheck,
    RepoToDeleteCheck,
    LostNodesCheck,
    RepoToIndexCheck,
    IndicesToEvictCheck,
    IndexShouldBeMarkedAsPendingEvictionCheck,
    NodeWithNegativeUnclaimedStorageBytesCheck,
    ForceUpdateOverprovisionedIndex,
    IndexMismatchedWatermarkCheck,
    RemoveExpiredSubscriptions,
    SaasRollout,
    Provisioning,
    Eviction,
}

impl ScheduledTask {
    /// Every task, in the order the cron worker fans them out.
    pub const ALL: [ScheduledTask; 20] = [
        ScheduledTask::MarkIndicesAsReady,
        ScheduledTask::InitialIndexing,
        ScheduledTask::AutoIndexSelfManaged,
        ScheduledTask::UpdateReplicaStates,
        ScheduledTask::UpdateIndexUsedStorageBytes,
        ScheduledTask::IndexShouldBeMarkedAsOrphanedCheck,
        ScheduledTask::IndexToDeleteCheck,
        ScheduledTask::RepoShouldBeMarkedAsOrphanedCheck,
        ScheduledTask::RepoToDeleteCheck,
        ScheduledTask::LostNodesCheck,
        ScheduledTask::RepoToIndexCheck,
        ScheduledTask::IndicesToEvictCheck,
        ScheduledTask::IndexShouldBeMarkedAsPendingEvictionCheck,
        ScheduledTask::NodeWithNegativeUnclaimedStorageBytesCheck,
        ScheduledTask::ForceUpdateOverprovisionedIndex,
        ScheduledTask::IndexMismatchedWatermarkCheck,
        ScheduledTask::RemoveExpiredSubscriptions,
        ScheduledTask::SaasRollout,
        ScheduledTask::Provisioning,
        ScheduledTask::Eviction,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScheduledTask::MarkIndicesAsReady => "mark_indices_as_ready",
            ScheduledTask::InitialIndexing => "initial_indexing",
            ScheduledTask::AutoIndexSelfManaged => "auto_index_self_managed",
            ScheduledTask::UpdateReplicaStates => "update_replica_states",
            ScheduledTask::UpdateIndexUsedStorageBytes => "update_index_used_storage_bytes",
            ScheduledTask::IndexShouldBeMarkedAsOrphanedCheck => {
                "index_should_be_marked_as_orphaned_check"
            }
            ScheduledTask::IndexToDeleteCheck => "index_to_delete_check",
            ScheduledTask::RepoShouldBeMarkedAsOrphanedCheck => {
                "repo_should_be_marked_as_orphaned_check"
            }
            ScheduledTask::RepoToDeleteCheck => "repo_to_delete_check",
            ScheduledTask::LostNodesCheck => "lost_nodes_check",
            ScheduledTask::RepoToIndexCheck => "repo_to_index_check",
            ScheduledTask::IndicesToEvictCheck => "indices_to_evict_check",
            ScheduledTask::IndexShouldBeMarkedAsPendingEvictionCheck => {
                "index_should_be_marked_as_pending_eviction_check"
            }
            ScheduledTask::NodeWithNegativeUnclaimedStorageBytesCheck => {
                "node_with_negative_unclaimed_storage_bytes_check"
            }
            ScheduledTask::ForceUpdateOverprovisionedIndex => "force_update_overprovisioned_index",
            ScheduledTask::IndexMismatchedWatermarkCheck => "index_mismatched_watermark_check",
            ScheduledTask::RemoveExpiredSubscriptions => "remove_expired_subscriptions",
            ScheduledTask::SaasRollout => "saas_rollout",
            ScheduledTask::Provisioning => "provisioning",
            ScheduledTask::Eviction => "eviction",
        }
    }

    /// Minimum spacing between runs, for tasks that are throttled.
    pub fn execute_every_secs(&self) -> Option<u64> {
        match self {
            ScheduledTask::LostNodesCheck | ScheduledTask::IndexMismatchedWatermarkCheck => {
                Some(10 * 60)
            }
            _ => None,
        }
    }

    /// Key of the throttle mark in the `schedule_marks` table.
    pub fn cache_key(&self) -> String {
        let period = self
            .execute_every_secs()
            .map(|secs| secs.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "search/zoekt/scheduling_service:execute_every:{period}:{}",
            self.name()
        )
    }
}

impl FromStr for ScheduledTask {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScheduledTask::ALL
            .into_iter()
            .find(|task| task.name() == s)
            .ok_or_else(|| SchedulerError::UnknownTask(s.to_string()))
    }
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
