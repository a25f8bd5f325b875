//! Cleanup of nodes that stopped reporting.
//!
//! Every precondition is re-checked when the event is handled, not when it
//! was published: the node may have reconnected or been removed in between.
//! The node, its indices and their repositories go in one transaction.
//! Tasks are left in place.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info};
use zoekt_core::epoch_secs;
use zoekt_events::WorkerContext;
use zoekt_state::{Index, IndexId, Node, NodeId, Repository, Snapshot, StateResult, scopes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostNodeOutcome {
    /// Lost-node marking is switched off.
    Disabled,
    /// The node is gone or has been seen recently.
    NotLost,
    Removed {
        deleted_indices: usize,
        deleted_repos: usize,
    },
}

pub struct LostNodeWorker {
    ctx: WorkerContext,
}

impl LostNodeWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self, node_id: NodeId) -> StateResult<LostNodeOutcome> {
        if !self.ctx.marking_lost_enabled() {
            debug!(node_id, "lost-node marking disabled, skipping");
            return Ok(LostNodeOutcome::Disabled);
        }
        let now = epoch_secs();
        let threshold = self.ctx.limits.lost_node_threshold();
        let started = Instant::now();

        let result = self.ctx.store.write(|tx| {
            let Some(node) = tx.get::<Node>(node_id)? else {
                return Ok(None);
            };
            if !node.is_lost(now, threshold) {
                return Ok(None);
            }
            let index_ids: Vec<IndexId> = scopes::indices_on_node(tx, node.id)?
                .into_iter()
                .map(|idx| idx.id)
                .collect();
            let owned: HashSet<IndexId> = index_ids.iter().copied().collect();
            let repo_ids: Vec<u64> = tx
                .filter::<Repository, _>(|r| owned.contains(&r.index_id))?
                .into_iter()
                .map(|r| r.id)
                .collect();

            let deleted_repos = tx.remove_many::<Repository>(&repo_ids)?;
            let deleted_indices = tx.remove_many::<Index>(&index_ids)?;
            tx.remove::<Node>(node.id)?;
            Ok(Some((node, deleted_indices, deleted_repos)))
        })?;

        let Some((node, deleted_indices, deleted_repos)) = result else {
            debug!(node_id, "node no longer lost, skipping cleanup");
            return Ok(LostNodeOutcome::NotLost);
        };
        info!(
            node_id,
            node_name = %node.name,
            deleted_repos_count = deleted_repos,
            deleted_indices_count = deleted_indices,
            transaction_duration_ms = started.elapsed().as_millis() as u64,
            "removed lost node"
        );
        Ok(LostNodeOutcome::Removed {
            deleted_indices,
            deleted_repos,
        })
    }
}
