//! Replica state follows the state of its indices.

use std::collections::HashMap;

use tracing::info;
use zoekt_events::WorkerContext;
use zoekt_state::{Index, IndexState, Replica, ReplicaId, ReplicaState, Snapshot, StateResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStateChanges {
    pub marked_ready: usize,
    pub marked_pending: usize,
}

pub struct ReplicaStateWorker {
    ctx: WorkerContext,
}

impl ReplicaStateWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// A replica is ready when it has indices and all of them are ready;
    /// otherwise it is pending.
    pub fn execute(&self) -> StateResult<ReplicaStateChanges> {
        let changes = self.ctx.store.write(|tx| {
            let mut all_ready: HashMap<ReplicaId, bool> = HashMap::new();
            for index in tx.all::<Index>()? {
                if let Some(replica_id) = index.replica_id {
                    let ready = all_ready.entry(replica_id).or_insert(true);
                    *ready &= index.state == IndexState::Ready;
                }
            }

            let mut changes = ReplicaStateChanges::default();
            for mut replica in tx.all::<Replica>()? {
                let target = if all_ready.get(&replica.id).copied().unwrap_or(false) {
                    ReplicaState::Ready
                } else {
                    ReplicaState::Pending
                };
                if replica.state == target {
                    continue;
                }
                replica.state = target;
                tx.put(&replica)?;
                match target {
                    ReplicaState::Ready => changes.marked_ready += 1,
                    ReplicaState::Pending => changes.marked_pending += 1,
                }
            }
            Ok(changes)
        })?;
        if changes != ReplicaStateChanges::default() {
            info!(
                marked_ready = changes.marked_ready,
                marked_pending = changes.marked_pending,
                "replica states updated"
            );
        }
        Ok(changes)
    }
}
