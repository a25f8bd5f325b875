//! Provisioning: places enabled namespaces onto search nodes.
//!
//! # Flow
//!
//! ```text
//! EnabledNamespace (no replicas)
//!        │ ProvisioningPlanner::plan
//!        ▼
//! NamespacePlan { replica ─▶ [IndexPlan { node, required bytes, range }] }
//!        │ ProvisioningService::execute
//!        ▼
//! Replica (pending) + Index (pending) ──▶ initial indexing
//! ```
//!
//! Planning reads a snapshot and tracks the space it has already promised
//! so two namespaces in the same plan never share the last free bytes of a
//! node. Execution re-checks capacity against live data: the plan may be
//! stale by the time it runs.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use zoekt_capacity::watermark::ideal_reserved_bytes;
use zoekt_core::epoch_secs;
use zoekt_events::WorkerContext;
use zoekt_state::{
    EnabledNamespace, EnabledNamespaceId, Index, IndexMetadata, Namespace, NamespaceId, Node,
    NodeId, Project, Replica, ReplicaState, Snapshot, StateError, StateResult, WriteTx, scopes,
};

/// Error recorded on an enabled namespace when no node can host it.
pub const NODE_CAPACITY_EXCEEDED: &str = "node_capacity_exceeded";

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("node {node_id} cannot fit {required_bytes} bytes ({unclaimed_bytes} unclaimed)")]
    NodeCapacityExceeded {
        node_id: NodeId,
        required_bytes: i64,
        unclaimed_bytes: i64,
    },

    #[error("no node can fit {required_bytes} bytes")]
    NoCapacity { required_bytes: i64 },

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("enabled namespace {0} not found")]
    EnabledNamespaceNotFound(EnabledNamespaceId),

    #[error("enabled namespace {0} already has a replica")]
    AlreadyProvisioned(EnabledNamespaceId),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ProvisioningError {
    /// Short code stored in the enabled namespace metadata.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeCapacityExceeded { .. } | Self::NoCapacity { .. } => NODE_CAPACITY_EXCEEDED,
            Self::NodeNotFound(_) => "node_not_found",
            Self::EnabledNamespaceNotFound(_) => "enabled_namespace_not_found",
            Self::AlreadyProvisioned(_) => "already_provisioned",
            Self::State(_) => "state_error",
        }
    }
}

/// Bytes to reserve so `repository_size_bytes` sits at the ideal usage
/// ratio. Empty namespaces still get the minimum reservation.
pub fn required_storage_bytes(repository_size_bytes: i64) -> i64 {
    ideal_reserved_bytes(repository_size_bytes)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPlan {
    pub node_id: NodeId,
    pub required_storage_bytes: i64,
    pub metadata: IndexMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaPlan {
    pub indices: Vec<IndexPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespacePlan {
    pub enabled_namespace_id: EnabledNamespaceId,
    pub namespace_id: NamespaceId,
    pub replicas: Vec<ReplicaPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFailure {
    pub enabled_namespace_id: EnabledNamespaceId,
    pub required_storage_bytes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningPlan {
    pub namespaces: Vec<NamespacePlan>,
    pub failures: Vec<PlanFailure>,
}

impl ProvisioningPlan {
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty() && self.failures.is_empty()
    }
}

pub struct ProvisioningPlanner {
    ctx: WorkerContext,
}

impl ProvisioningPlanner {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Plan `replica_count` replicas for each searchable enabled namespace
    /// that has no replica yet, up to `batch_size`. Replicas of one
    /// namespace never share a node. A namespace too large for any single
    /// node is split into project-namespace ranges, one index per node.
    pub fn plan(&self) -> StateResult<ProvisioningPlan> {
        let limits = &self.ctx.limits;
        let replica_count = limits.replica_count.max(1);
        self.ctx.store.read(|tx| {
            let mut candidates = Vec::new();
            for enabled in tx.filter::<EnabledNamespace, _>(|ns| ns.search)? {
                let has_replica = !tx
                    .filter::<Replica, _>(|r| r.enabled_namespace_id == enabled.id)?
                    .is_empty();
                if !has_replica {
                    candidates.push(enabled);
                }
            }
            candidates.sort_by_key(|ns| ns.id);
            candidates.truncate(limits.batch_size);

            let mut nodes = scopes::nodes_by_unclaimed_storage_desc(tx)?;
            let mut plan = ProvisioningPlan::default();
            for enabled in candidates {
                let size = tx
                    .get::<Namespace>(enabled.root_namespace_id)?
                    .map(|ns| ns.repository_size_bytes)
                    .unwrap_or(0);
                let projects = project_sizes(tx, enabled.root_namespace_id, size)?;

                // Promises are staged per namespace and kept only when every
                // replica found a home.
                let mut staged = nodes.clone();
                let mut used = HashSet::new();
                let replicas: Option<Vec<ReplicaPlan>> = (0..replica_count)
                    .map(|_| {
                        plan_replica(
                            &mut staged,
                            &mut used,
                            size,
                            &projects,
                            limits.max_indices_per_replica,
                        )
                    })
                    .collect();

                match replicas {
                    Some(replicas) => {
                        nodes = staged;
                        plan.namespaces.push(NamespacePlan {
                            enabled_namespace_id: enabled.id,
                            namespace_id: enabled.root_namespace_id,
                            replicas,
                        });
                    }
                    None => plan.failures.push(PlanFailure {
                        enabled_namespace_id: enabled.id,
                        required_storage_bytes: required_storage_bytes(size),
                    }),
                }
            }
            Ok(plan)
        })
    }
}

/// Projects of `root` ordered by project namespace id, each with its
/// repository size. Projects without a sized project namespace share the
/// root's size evenly.
fn project_sizes(
    tx: &impl Snapshot,
    root: NamespaceId,
    root_size_bytes: i64,
) -> StateResult<Vec<(NamespaceId, i64)>> {
    let mut projects = tx.filter::<Project, _>(|p| p.root_namespace_id == root)?;
    projects.sort_by_key(|p| (p.project_namespace_id, p.id));
    let even_share = root_size_bytes / projects.len().max(1) as i64;

    let mut sizes = Vec::with_capacity(projects.len());
    for project in projects {
        let size = match tx.get::<Namespace>(project.project_namespace_id)? {
            Some(ns) if !ns.is_root() => ns.repository_size_bytes,
            _ => even_share,
        };
        sizes.push((project.project_namespace_id, size));
    }
    Ok(sizes)
}

/// Place one replica onto nodes outside `used`. `nodes` stays sorted by
/// unclaimed bytes, largest first.
fn plan_replica(
    nodes: &mut [(Node, i64)],
    used: &mut HashSet<NodeId>,
    total_bytes: i64,
    projects: &[(NamespaceId, i64)],
    max_indices: usize,
) -> Option<ReplicaPlan> {
    let required = required_storage_bytes(total_bytes);
    let slot = largest_available(nodes, used)?;
    if nodes[slot].1 >= required {
        let node_id = promise(nodes, used, slot, required);
        return Some(ReplicaPlan {
            indices: vec![IndexPlan {
                node_id,
                required_storage_bytes: required,
                metadata: IndexMetadata::range(None, None),
            }],
        });
    }

    // Split: fill the roomiest free node with consecutive projects, then
    // move on. The last range is left open so later projects land in it.
    let mut indices = Vec::new();
    let mut rest = projects;
    while let Some(&(first, _)) = rest.first() {
        if indices.len() == max_indices {
            return None;
        }
        let slot = largest_available(nodes, used)?;
        let unclaimed = nodes[slot].1;
        let mut shard_bytes = 0;
        let mut taken = 0;
        for &(_, size) in rest {
            if required_storage_bytes(shard_bytes + size) > unclaimed {
                break;
            }
            shard_bytes += size;
            taken += 1;
        }
        if taken == 0 {
            return None;
        }
        let last = rest[taken - 1].0;
        rest = &rest[taken..];
        let to = (!rest.is_empty()).then_some(last);

        let shard_required = required_storage_bytes(shard_bytes);
        let node_id = promise(nodes, used, slot, shard_required);
        indices.push(IndexPlan {
            node_id,
            required_storage_bytes: shard_required,
            metadata: IndexMetadata::range(Some(first), to),
        });
    }
    (!indices.is_empty()).then_some(ReplicaPlan { indices })
}

fn largest_available(nodes: &[(Node, i64)], used: &HashSet<NodeId>) -> Option<usize> {
    nodes.iter().position(|(node, _)| !used.contains(&node.id))
}

fn promise(
    nodes: &mut [(Node, i64)],
    used: &mut HashSet<NodeId>,
    slot: usize,
    bytes: i64,
) -> NodeId {
    nodes[slot].1 -= bytes;
    let node_id = nodes[slot].0.id;
    used.insert(node_id);
    nodes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
    node_id
}

#[derive(Debug, Default)]
pub struct ProvisioningSummary {
    pub replicas_created: usize,
    pub indices_created: usize,
    pub errors: Vec<(EnabledNamespaceId, ProvisioningError)>,
}

pub struct ProvisioningService {
    ctx: WorkerContext,
}

impl ProvisioningService {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Apply `plan`. Each namespace is provisioned in its own transaction;
    /// a failure is recorded on the enabled namespace and does not stop the
    /// rest of the plan.
    pub fn execute(&self, plan: &ProvisioningPlan) -> StateResult<ProvisioningSummary> {
        let now = epoch_secs();
        let mut summary = ProvisioningSummary::default();

        for failure in &plan.failures {
            let error = ProvisioningError::NoCapacity {
                required_bytes: failure.required_storage_bytes,
            };
            self.record_failure(failure.enabled_namespace_id, &error, now)?;
            summary.errors.push((failure.enabled_namespace_id, error));
        }

        for namespace in &plan.namespaces {
            match self.provision(namespace, now) {
                Ok(indices) => {
                    summary.replicas_created += namespace.replicas.len();
                    summary.indices_created += indices;
                }
                Err(ProvisioningError::State(e)) => return Err(e),
                Err(error) => {
                    self.record_failure(namespace.enabled_namespace_id, &error, now)?;
                    summary.errors.push((namespace.enabled_namespace_id, error));
                }
            }
        }

        if summary.replicas_created > 0 || !summary.errors.is_empty() {
            info!(
                replicas_created = summary.replicas_created,
                indices_created = summary.indices_created,
                errors = summary.errors.len(),
                "provisioning finished"
            );
        }
        Ok(summary)
    }

    fn provision(&self, plan: &NamespacePlan, now: u64) -> Result<usize, ProvisioningError> {
        // The inner result carries validation failures; nothing has been
        // written when one is returned, so the transaction commits empty.
        self.ctx.store.write(|tx| {
            if let Err(e) = validate(tx, plan)? {
                return Ok(Err(e));
            }
            let mut indices = 0;
            for replica_plan in &plan.replicas {
                let replica = tx.insert(Replica {
                    id: 0,
                    enabled_namespace_id: plan.enabled_namespace_id,
                    namespace_id: plan.namespace_id,
                    state: ReplicaState::Pending,
                    created_at: now,
                })?;
                for index_plan in &replica_plan.indices {
                    let mut index = Index::new(index_plan.node_id, plan.namespace_id, now);
                    index.enabled_namespace_id = Some(plan.enabled_namespace_id);
                    index.replica_id = Some(replica.id);
                    index.reserved_storage_bytes = index_plan.required_storage_bytes;
                    index.metadata = index_plan.metadata.clone();
                    tx.insert(index)?;
                    indices += 1;
                }
            }
            let mut enabled: EnabledNamespace =
                tx.get(plan.enabled_namespace_id)?.ok_or_else(|| {
                    StateError::NotFound(format!("enabled namespace {}", plan.enabled_namespace_id))
                })?;
            enabled.last_rollout_failed_at = None;
            enabled.metadata.last_rollout_error = None;
            tx.put(&enabled)?;
            Ok(Ok(indices))
        })?
    }

    fn record_failure(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
        error: &ProvisioningError,
        now: u64,
    ) -> StateResult<()> {
        warn!(enabled_namespace_id, error = %error, "provisioning failed");
        self.ctx.store.write(|tx| {
            let Some(mut enabled) = tx.get::<EnabledNamespace>(enabled_namespace_id)? else {
                return Ok(());
            };
            enabled.last_rollout_failed_at = Some(now);
            enabled.metadata.last_rollout_error = Some(error.code().to_string());
            tx.put(&enabled)
        })
    }
}

/// Live checks: the enabled namespace still needs a replica, and each
/// target node still has room for everything planned onto it.
fn validate(tx: &WriteTx, plan: &NamespacePlan) -> StateResult<Result<(), ProvisioningError>> {
    if !tx.exists::<EnabledNamespace>(plan.enabled_namespace_id)? {
        return Ok(Err(ProvisioningError::EnabledNamespaceNotFound(
            plan.enabled_namespace_id,
        )));
    }
    let has_replica = !tx
        .filter::<Replica, _>(|r| r.enabled_namespace_id == plan.enabled_namespace_id)?
        .is_empty();
    if has_replica {
        return Ok(Err(ProvisioningError::AlreadyProvisioned(plan.enabled_namespace_id)));
    }

    let mut required_by_node: HashMap<NodeId, i64> = HashMap::new();
    for index_plan in plan.replicas.iter().flat_map(|r| &r.indices) {
        *required_by_node.entry(index_plan.node_id).or_default() +=
            index_plan.required_storage_bytes;
    }
    let mut targets: Vec<(NodeId, i64)> = required_by_node.into_iter().collect();
    targets.sort();
    for (node_id, required_bytes) in targets {
        let Some(node) = tx.get::<Node>(node_id)? else {
            return Ok(Err(ProvisioningError::NodeNotFound(node_id)));
        };
        let unclaimed_bytes = scopes::unclaimed_storage_bytes(tx, &node)?;
        if unclaimed_bytes < required_bytes {
            return Ok(Err(ProvisioningError::NodeCapacityExceeded {
                node_id,
                required_bytes,
                unclaimed_bytes,
            }));
        }
    }
    Ok(Ok(()))
}
