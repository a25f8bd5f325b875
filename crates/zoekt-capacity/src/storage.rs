//! Storage bookkeeping workers.
//!
//! - [`UpdateUsedStorageWorker`] recomputes used bytes for stale indices and
//!   rebalances their reservation.
//! - [`ForceUpdateOverprovisionedWorker`] sheds excess reservation from
//!   ready indices without waiting for the next indexing pass.
//! - [`NegativeUnclaimedStorageWorker`] relieves over-committed nodes by
//!   flagging some of their ready indices for eviction.

use tracing::{debug, info};
use zoekt_core::{BatchOutcome, epoch_secs, split_batch};
use zoekt_events::{Event, WorkerContext};
use zoekt_state::scopes;
use zoekt_state::{
    DEFAULT_USED_STORAGE_BYTES, Index, IndexState, Node, NodeId, Snapshot, StateResult, WriteTx,
};

use crate::watermark::{appropriate_watermark_level, rebalanced_reservation};

/// Adjust the reservation and watermark level of `index` in place.
pub fn update_reservation(tx: &WriteTx, index: &mut Index) -> StateResult<()> {
    let unclaimed = match tx.get::<Node>(index.node_id)? {
        Some(node) => scopes::unclaimed_storage_bytes(tx, &node)?,
        None => 0,
    };
    index.reserved_storage_bytes = rebalanced_reservation(index, unclaimed);
    index.watermark_level =
        appropriate_watermark_level(index.used_storage_bytes, index.reserved_storage_bytes);
    Ok(())
}

pub struct UpdateUsedStorageWorker {
    ctx: WorkerContext,
}

impl UpdateUsedStorageWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let now = epoch_secs();
        let limit = self.ctx.limits.batch_size;
        let outcome = self.ctx.store.write(|tx| {
            let (batch, remaining) =
                split_batch(scopes::indices_with_stale_used_storage(tx)?, limit);
            let repos = scopes::repositories_by_index(tx)?;
            for mut index in batch.iter().cloned() {
                let used: i64 = repos
                    .get(&index.id)
                    .map(|list| list.iter().map(|r| r.size_bytes).sum())
                    .unwrap_or(0);
                index.used_storage_bytes = if used > 0 {
                    used
                } else {
                    DEFAULT_USED_STORAGE_BYTES
                };
                // Strictly after the last indexing pass, so the index leaves the stale scope.
                index.used_storage_bytes_updated_at = now.max(index.last_indexed_at + 1);
                update_reservation(tx, &mut index)?;
                index.updated_at = now;
                tx.put(&index)?;
            }
            Ok(BatchOutcome::new(batch.len(), remaining))
        })?;

        if outcome.processed > 0 {
            info!(count = outcome.processed, "refreshed index used storage");
        } else {
            debug!("no indices with stale used storage");
        }
        self.ctx
            .republish_if_remaining(&outcome, Event::UpdateIndexUsedStorageBytes);
        Ok(outcome)
    }
}

pub struct ForceUpdateOverprovisionedWorker {
    ctx: WorkerContext,
}

impl ForceUpdateOverprovisionedWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        let now = epoch_secs();
        let limit = self.ctx.limits.batch_size;
        let outcome = self.ctx.store.write(|tx| {
            let (batch, remaining) =
                split_batch(scopes::indices_overprovisioned_with_fresh_storage(tx)?, limit);
            for mut index in batch.iter().cloned() {
                update_reservation(tx, &mut index)?;
                index.updated_at = now;
                tx.put(&index)?;
            }
            Ok(BatchOutcome::new(batch.len(), remaining))
        })?;

        if outcome.processed > 0 {
            info!(count = outcome.processed, "shrunk overprovisioned index reservations");
        }
        self.ctx
            .republish_if_remaining(&outcome, Event::ForceUpdateOverprovisionedIndex);
        Ok(outcome)
    }
}

pub struct NegativeUnclaimedStorageWorker {
    ctx: WorkerContext,
}

impl NegativeUnclaimedStorageWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Flag up to `max_evictions_per_node` ready indices on each listed node
    /// that is still over-committed. Nodes left with ready indices and a
    /// negative balance are carried into a follow-up event.
    pub fn handle(&self, node_ids: &[NodeId]) -> StateResult<BatchOutcome> {
        let now = epoch_secs();
        let per_node = self.ctx.limits.max_evictions_per_node;
        let (marked, carried) = self.ctx.store.write(|tx| {
            let mut marked = 0;
            let mut carried = Vec::new();
            for node_id in node_ids {
                let Some(node) = tx.get::<Node>(*node_id)? else {
                    continue;
                };
                if scopes::unclaimed_storage_bytes(tx, &node)? >= 0 {
                    continue;
                }
                let mut ready: Vec<Index> = scopes::indices_on_node(tx, node.id)?
                    .into_iter()
                    .filter(|idx| idx.state == IndexState::Ready)
                    .collect();
                ready.sort_by(|a, b| {
                    b.reserved_storage_bytes
                        .cmp(&a.reserved_storage_bytes)
                        .then(a.id.cmp(&b.id))
                });
                let (batch, remaining) = split_batch(ready, per_node);
                for mut index in batch {
                    index.transition(IndexState::PendingEviction, now);
                    tx.put(&index)?;
                    marked += 1;
                }
                if remaining && scopes::unclaimed_storage_bytes(tx, &node)? < 0 {
                    carried.push(node.id);
                }
            }
            Ok((marked, carried))
        })?;

        if marked > 0 {
            info!(
                count = marked,
                nodes = node_ids.len(),
                "marked indices pending eviction on over-committed nodes"
            );
        }
        let outcome = BatchOutcome::new(marked, !carried.is_empty());
        self.ctx.republish_if_remaining(
            &outcome,
            Event::NodeWithNegativeUnclaimedStorage { node_ids: carried },
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use zoekt_core::{LimitsConfig, StaticGates};
    use zoekt_events::RecordingBus;
    use zoekt_state::{Project, Repository, WatermarkLevel};

    fn ctx_with(limits: LimitsConfig) -> (WorkerContext, Arc<RecordingBus>) {
        WorkerContext::in_memory(limits, StaticGates::default()).unwrap()
    }

    fn seed_node(ctx: &WorkerContext, usable: i64) -> Node {
        let mut node = Node::new("uuid", "node", epoch_secs());
        node.usable_storage_bytes = usable;
        ctx.store.insert(node).unwrap()
    }

    fn seed_index(ctx: &WorkerContext, node_id: NodeId, state: IndexState, reserved: i64) -> Index {
        let mut idx = Index::new(node_id, 1, 0);
        idx.state = state;
        idx.reserved_storage_bytes = reserved;
        ctx.store.insert(idx).unwrap()
    }

    fn seed_repo(ctx: &WorkerContext, index_id: u64, project_id: u64, size: i64) {
        let project = Project {
            id: project_id,
            project_namespace_id: project_id,
            root_namespace_id: 1,
        };
        let mut repo = Repository::new(index_id, &project, 3, 0);
        repo.size_bytes = size;
        ctx.store.insert(repo).unwrap();
    }

    #[test]
    fn refresh_sums_repository_sizes() {
        let (ctx, bus) = ctx_with(LimitsConfig::default());
        let node = seed_node(&ctx, 1_000_000);
        let idx = seed_index(&ctx, node.id, IndexState::Ready, 10_000);
        seed_repo(&ctx, idx.id, 1, 3000);
        seed_repo(&ctx, idx.id, 2, 2000);

        let outcome = UpdateUsedStorageWorker::new(ctx.clone()).handle().unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(bus.events().is_empty());

        let idx: Index = ctx.store.require(idx.id).unwrap();
        assert_eq!(idx.used_storage_bytes, 5000);
        assert!(!idx.used_storage_is_stale());
        assert_eq!(idx.watermark_level, WatermarkLevel::Healthy);

        // Fresh now, so a second pass has nothing to do.
        assert_eq!(UpdateUsedStorageWorker::new(ctx).handle().unwrap().processed, 0);
    }

    #[test]
    fn refresh_applies_floor_for_empty_index() {
        let (ctx, _) = ctx_with(LimitsConfig::default());
        let node = seed_node(&ctx, 0);
        let idx = seed_index(&ctx, node.id, IndexState::Pending, 10_000);
        UpdateUsedStorageWorker::new(ctx.clone()).handle().unwrap();
        let idx: Index = ctx.store.require(idx.id).unwrap();
        assert_eq!(idx.used_storage_bytes, DEFAULT_USED_STORAGE_BYTES);
        // Pending indices keep their reservation even when overprovisioned.
        assert_eq!(idx.reserved_storage_bytes, 10_000);
        assert_eq!(idx.watermark_level, WatermarkLevel::Overprovisioned);
    }

    #[test]
    fn refresh_grows_critical_reservation() {
        let (ctx, _) = ctx_with(LimitsConfig::default());
        let node = seed_node(&ctx, 100_000);
        let idx = seed_index(&ctx, node.id, IndexState::Ready, 10_000);
        seed_repo(&ctx, idx.id, 1, 9000);
        UpdateUsedStorageWorker::new(ctx.clone()).handle().unwrap();
        let idx: Index = ctx.store.require(idx.id).unwrap();
        assert_eq!(idx.reserved_storage_bytes, 22_500);
        assert_eq!(idx.watermark_level, WatermarkLevel::Healthy);
    }

    #[test]
    fn refresh_paginates() {
        let limits = LimitsConfig {
            batch_size: 2,
            ..LimitsConfig::default()
        };
        let (ctx, bus) = ctx_with(limits);
        let node = seed_node(&ctx, 0);
        for _ in 0..3 {
            seed_index(&ctx, node.id, IndexState::Ready, 10_000);
        }
        let worker = UpdateUsedStorageWorker::new(ctx);
        assert!(worker.handle().unwrap().remaining);
        assert_eq!(bus.take(), vec![Event::UpdateIndexUsedStorageBytes]);
        let last = worker.handle().unwrap();
        assert_eq!(last.processed, 1);
        assert!(bus.events().is_empty());
    }

    #[test]
    fn force_update_only_touches_ready_fresh_overprovisioned() {
        let (ctx, _) = ctx_with(LimitsConfig::default());
        let node = seed_node(&ctx, 0);
        let mk = |state: IndexState, level: WatermarkLevel, fresh: bool| {
            let mut idx = Index::new(node.id, 1, 0);
            idx.state = state;
            idx.used_storage_bytes = 4000;
            idx.reserved_storage_bytes = 100_000;
            idx.watermark_level = level;
            idx.last_indexed_at = 100;
            idx.used_storage_bytes_updated_at = if fresh { 200 } else { 50 };
            ctx.store.insert(idx).unwrap()
        };
        let target = mk(IndexState::Ready, WatermarkLevel::Overprovisioned, true);
        let stale = mk(IndexState::Ready, WatermarkLevel::Overprovisioned, false);
        let pending = mk(IndexState::Pending, WatermarkLevel::Overprovisioned, true);
        let healthy = mk(IndexState::Ready, WatermarkLevel::Healthy, true);

        let outcome = ForceUpdateOverprovisionedWorker::new(ctx.clone()).handle().unwrap();
        assert_eq!(outcome.processed, 1);

        let shrunk: Index = ctx.store.require(target.id).unwrap();
        assert_eq!(shrunk.reserved_storage_bytes, 10_000);
        assert_eq!(shrunk.used_storage_bytes, 4000);
        assert_eq!(shrunk.watermark_level, WatermarkLevel::Healthy);
        for id in [stale.id, pending.id, healthy.id] {
            let idx: Index = ctx.store.require(id).unwrap();
            assert_eq!(idx.reserved_storage_bytes, 100_000);
        }
    }

    #[test]
    fn negative_unclaimed_caps_evictions_per_node() {
        let limits = LimitsConfig {
            max_evictions_per_node: 2,
            ..LimitsConfig::default()
        };
        let (ctx, bus) = ctx_with(limits);
        let node = seed_node(&ctx, 1000);
        let ids: Vec<u64> = [600, 500, 400]
            .into_iter()
            .map(|reserved| seed_index(&ctx, node.id, IndexState::Ready, reserved).id)
            .collect();

        let worker = NegativeUnclaimedStorageWorker::new(ctx.clone());
        let first = worker.handle(&[node.id]).unwrap();
        assert_eq!(first.processed, 2);
        let events = bus.take();
        assert_eq!(
            events,
            vec![Event::NodeWithNegativeUnclaimedStorage {
                node_ids: vec![node.id]
            }]
        );

        let second = worker.handle(&[node.id]).unwrap();
        assert_eq!(second.processed, 1);
        assert!(bus.events().is_empty());
        for id in ids {
            let idx: Index = ctx.store.require(id).unwrap();
            assert_eq!(idx.state, IndexState::PendingEviction);
        }
    }

    #[test]
    fn negative_unclaimed_skips_recovered_nodes() {
        let (ctx, bus) = ctx_with(LimitsConfig::default());
        let node = seed_node(&ctx, 1_000_000);
        let idx = seed_index(&ctx, node.id, IndexState::Ready, 1000);
        let outcome = NegativeUnclaimedStorageWorker::new(ctx.clone())
            .handle(&[node.id, 999])
            .unwrap();
        assert_eq!(outcome.processed, 0);
        assert!(bus.events().is_empty());
        let idx: Index = ctx.store.require(idx.id).unwrap();
        assert_eq!(idx.state, IndexState::Ready);
    }
}
