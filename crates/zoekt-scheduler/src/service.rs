//! Scheduling service: the periodic checks that feed the event pipeline.
//!
//! Each check inspects one scope and publishes the matching event only
//! when that scope is non-empty. A few tasks do their work inline instead
//! of through an event. Every check returns whether it found work.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info, warn};
use zoekt_capacity::indices_with_mismatched_watermark_levels;
use zoekt_core::epoch_secs;
use zoekt_events::{Event, WorkerContext};
use zoekt_rollout::{
    AutoIndexSelfManaged, ExpiredSubscriptionCleaner, ProvisioningPlanner, ProvisioningService,
    ReplicaStateWorker,
};
use zoekt_state::{
    EnabledNamespace, EnabledNamespaceId, IndexState, NODE_WATERMARK_LIMIT_HIGH, Namespace,
    NamespaceId, Node, NodeId, ReadTx, Replica, ReplicaId, Snapshot, StateResult, scopes,
};

use crate::error::SchedulerResult;
use crate::task::ScheduledTask;

#[derive(Clone)]
pub struct SchedulingService {
    ctx: WorkerContext,
}

impl SchedulingService {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Run `task`, honouring its execute-every throttle.
    pub fn execute(&self, task: ScheduledTask) -> SchedulerResult<bool> {
        if let Some(period) = task.execute_every_secs() {
            let now = epoch_secs();
            let key = task.cache_key();
            let acquired = self
                .ctx
                .store
                .write(|tx| tx.set_mark_if_absent(&key, now, now + period))?;
            if !acquired {
                debug!(task = task.name(), "ran within the last {period}s, skipping");
                return Ok(false);
            }
        }
        self.run(task)
    }

    /// Run `task` now, resetting its throttle.
    pub fn execute_without_cache(&self, task: ScheduledTask) -> SchedulerResult<bool> {
        let key = task.cache_key();
        self.ctx.store.write(|tx| tx.clear_mark(&key))?;
        self.execute(task)
    }

    fn run(&self, task: ScheduledTask) -> SchedulerResult<bool> {
        let did_work = match task {
            ScheduledTask::MarkIndicesAsReady => self.publish_if_any(
                Event::IndexMarkedAsReady,
                |tx| scopes::indices_ready_to_mark(tx),
            )?,
            ScheduledTask::InitialIndexing => self.initial_indexing()?,
            ScheduledTask::AutoIndexSelfManaged => {
                AutoIndexSelfManaged::new(self.ctx.clone()).execute()?.processed > 0
            }
            ScheduledTask::UpdateReplicaStates => {
                let changes = ReplicaStateWorker::new(self.ctx.clone()).execute()?;
                changes.marked_ready + changes.marked_pending > 0
            }
            ScheduledTask::UpdateIndexUsedStorageBytes => self.publish_if_any(
                Event::UpdateIndexUsedStorageBytes,
                |tx| scopes::indices_with_stale_used_storage(tx),
            )?,
            ScheduledTask::IndexShouldBeMarkedAsOrphanedCheck => self.publish_if_any(
                Event::OrphanedIndex,
                |tx| scopes::indices_should_be_marked_as_orphaned(tx),
            )?,
            ScheduledTask::IndexToDeleteCheck => self.publish_if_any(
                Event::IndexMarkedAsToDelete,
                |tx| scopes::indices_needing_deletion_work(tx),
            )?,
            ScheduledTask::RepoShouldBeMarkedAsOrphanedCheck => self.publish_if_any(
                Event::OrphanedRepo,
                |tx| scopes::repositories_should_be_marked_as_orphaned(tx),
            )?,
            ScheduledTask::RepoToDeleteCheck => self.publish_if_any(
                Event::RepoMarkedAsToDelete,
                |tx| scopes::repositories_should_be_deleted(tx),
            )?,
            ScheduledTask::LostNodesCheck => self.lost_nodes_check()?,
            ScheduledTask::RepoToIndexCheck => self.publish_if_any(
                Event::RepoToIndex,
                |tx| scopes::repositories_should_be_indexed(tx),
            )?,
            ScheduledTask::IndicesToEvictCheck => self.publish_if_any(Event::IndexToEvict, |tx| {
                scopes::indices_in_state(tx, IndexState::PendingEviction)
            })?,
            ScheduledTask::IndexShouldBeMarkedAsPendingEvictionCheck => self.publish_if_any(
                Event::IndexMarkPendingEviction,
                |tx| scopes::indices_should_be_pending_eviction(tx),
            )?,
            ScheduledTask::NodeWithNegativeUnclaimedStorageBytesCheck => {
                self.negative_unclaimed_storage_check()?
            }
            ScheduledTask::ForceUpdateOverprovisionedIndex => self.publish_if_any(
                Event::ForceUpdateOverprovisionedIndex,
                |tx| scopes::indices_overprovisioned_with_fresh_storage(tx),
            )?,
            ScheduledTask::IndexMismatchedWatermarkCheck => self.mismatched_watermark_check()?,
            ScheduledTask::RemoveExpiredSubscriptions => {
                ExpiredSubscriptionCleaner::new(self.ctx.clone())
                    .execute()?
                    .processed
                    > 0
            }
            ScheduledTask::SaasRollout => self.saas_rollout_check()?,
            ScheduledTask::Provisioning => self.provisioning()?,
            ScheduledTask::Eviction => self.eviction()?,
        };
        debug!(task = task.name(), did_work, "scheduled task finished");
        Ok(did_work)
    }

    fn publish_if_any<T>(
        &self,
        event: Event,
        scope: impl FnOnce(&ReadTx) -> StateResult<Vec<T>>,
    ) -> StateResult<bool> {
        let found = !self.ctx.store.read(scope)?.is_empty();
        if found {
            self.ctx.bus.publish(event);
        }
        Ok(found)
    }

    /// One `InitialIndexing` event per pending index on an online node,
    /// capped per node.
    fn initial_indexing(&self) -> StateResult<bool> {
        let now = epoch_secs();
        let threshold = self.ctx.limits.online_threshold_secs;
        let per_node = self.ctx.limits.initial_indexing_per_node;
        let mut pending = self
            .ctx
            .store
            .read(|tx| scopes::pending_indices_on_online_nodes(tx, now, threshold))?;
        pending.sort_by_key(|idx| idx.id);

        let mut by_node: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut published = 0;
        for index in pending {
            let count = by_node.entry(index.node_id).or_default();
            if *count >= per_node {
                continue;
            }
            *count += 1;
            self.ctx.bus.publish(Event::InitialIndexing { index_id: index.id });
            published += 1;
        }
        Ok(published > 0)
    }

    fn lost_nodes_check(&self) -> StateResult<bool> {
        if !self.ctx.marking_lost_enabled() {
            return Ok(false);
        }
        let now = epoch_secs();
        let threshold = self.ctx.limits.lost_node_threshold();
        let lost = self
            .ctx
            .store
            .read(|tx| scopes::lost_nodes(tx, now, threshold))?;
        for node in &lost {
            warn!(
                node_id = node.id,
                node_name = %node.name,
                last_seen_at = node.last_seen_at,
                "search node lost"
            );
            self.ctx.bus.publish(Event::LostNode { node_id: node.id });
        }
        Ok(!lost.is_empty())
    }

    fn negative_unclaimed_storage_check(&self) -> StateResult<bool> {
        let node_ids: Vec<NodeId> = self
            .ctx
            .store
            .read(|tx| scopes::nodes_with_negative_unclaimed_storage(tx))?
            .into_iter()
            .map(|node| node.id)
            .collect();
        if node_ids.is_empty() {
            return Ok(false);
        }
        self.ctx
            .bus
            .publish(Event::NodeWithNegativeUnclaimedStorage { node_ids });
        Ok(true)
    }

    fn mismatched_watermark_check(&self) -> StateResult<bool> {
        let mismatched = self
            .ctx
            .store
            .read(|tx| indices_with_mismatched_watermark_levels(tx))?;
        if mismatched.is_empty() {
            return Ok(false);
        }
        info!(count = mismatched.len(), "indices with mismatched watermark levels");
        Ok(true)
    }

    fn saas_rollout_check(&self) -> StateResult<bool> {
        if !self.ctx.gates.saas() {
            return Ok(false);
        }
        let now = epoch_secs();
        let pending = self.ctx.store.read(|tx| {
            let enabled: HashSet<NamespaceId> = tx
                .all::<EnabledNamespace>()?
                .into_iter()
                .map(|ns| ns.root_namespace_id)
                .collect();
            Ok(tx.all::<Namespace>()?.into_iter().any(|ns| {
                ns.is_root()
                    && !enabled.contains(&ns.id)
                    && ns.subscription.as_ref().is_some_and(|s| s.is_active(now))
            }))
        })?;
        if pending {
            self.ctx.bus.publish(Event::SaasRollout);
        }
        Ok(pending)
    }

    fn provisioning(&self) -> StateResult<bool> {
        let plan = ProvisioningPlanner::new(self.ctx.clone()).plan()?;
        if plan.is_empty() {
            return Ok(false);
        }
        ProvisioningService::new(self.ctx.clone()).execute(&plan)?;
        Ok(true)
    }

    /// Unassign namespaces from nodes at or above the high watermark until
    /// each node is expected to drop back under it. Search stays enabled;
    /// the namespace is provisioned again elsewhere.
    fn eviction(&self) -> StateResult<bool> {
        if !self.ctx.gates.saas() {
            return Ok(false);
        }
        let over: Vec<NodeId> = self
            .ctx
            .store
            .read(|tx| tx.filter::<Node, _>(|node| node.watermark_exceeded_high()))?
            .into_iter()
            .map(|node| node.id)
            .collect();
        if over.is_empty() {
            return Ok(false);
        }
        info!(
            task = ScheduledTask::Eviction.name(),
            watermark_limit_high = NODE_WATERMARK_LIMIT_HIGH,
            count = over.len(),
            "Detected nodes over watermark"
        );

        let mut unassigned = 0;
        for node_id in over {
            unassigned += self.unassign_from_node(node_id)?;
        }
        Ok(unassigned > 0)
    }

    /// Largest namespaces go first. Returns how many were unassigned.
    fn unassign_from_node(&self, node_id: NodeId) -> StateResult<usize> {
        self.ctx.store.write(|tx| {
            let Some(node) = tx.get::<Node>(node_id)? else {
                return Ok(0);
            };

            // Per enabled namespace: bytes used on this node and the
            // replicas that place it here.
            let mut on_node: HashMap<EnabledNamespaceId, (NamespaceId, i64, HashSet<ReplicaId>)> =
                HashMap::new();
            for index in scopes::indices_on_node(tx, node.id)? {
                let Some(enabled_id) = index.enabled_namespace_id else {
                    continue;
                };
                let entry = on_node
                    .entry(enabled_id)
                    .or_insert_with(|| (index.namespace_id, 0, HashSet::new()));
                entry.1 += index.used_storage_bytes;
                entry.2.extend(index.replica_id);
            }

            let mut candidates = Vec::with_capacity(on_node.len());
            for (enabled_id, (namespace_id, used, replicas)) in on_node {
                let size = tx
                    .get::<Namespace>(namespace_id)?
                    .map(|ns| ns.repository_size_bytes)
                    .unwrap_or(0);
                candidates.push((enabled_id, size, used, replicas));
            }
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let over_limit = |used_bytes: i64| {
                node.total_bytes > 0
                    && used_bytes as f64 / node.total_bytes as f64 >= NODE_WATERMARK_LIMIT_HIGH
            };
            let mut expected_used_bytes = node.used_bytes;
            let mut total_repository_size = 0;
            let mut chosen = Vec::new();
            for candidate in candidates {
                if !over_limit(expected_used_bytes) {
                    break;
                }
                expected_used_bytes -= candidate.1;
                total_repository_size += candidate.1;
                chosen.push(candidate);
            }
            if chosen.is_empty() {
                return Ok(0);
            }
            info!(
                task = ScheduledTask::Eviction.name(),
                node_id = node.id,
                watermark_limit_high = NODE_WATERMARK_LIMIT_HIGH,
                count = chosen.len(),
                node_used_bytes = node.used_bytes,
                node_expected_used_bytes = expected_used_bytes,
                total_repository_size,
                "Unassigning namespaces from node"
            );

            for (enabled_id, _, used, replicas) in &chosen {
                let replica_ids: Vec<ReplicaId> = replicas.iter().copied().collect();
                tx.remove_many::<Replica>(&replica_ids)?;
                if let Some(mut enabled) = tx.get::<EnabledNamespace>(*enabled_id)? {
                    enabled.metadata.last_used_storage_bytes = Some(*used);
                    tx.put(&enabled)?;
                }
            }
            Ok(chosen.len())
        })
    }
}
