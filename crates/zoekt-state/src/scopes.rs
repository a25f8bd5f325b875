//! Eligibility scopes.
//!
//! Each scope is a predicate evaluated against a [`Snapshot`]. Workers call
//! them inside the same write transaction that performs the mutation, so a
//! row selected here cannot change state before it is updated. Results are
//! ordered by id unless noted otherwise.

use std::collections::{HashMap, HashSet};

use crate::error::StateResult;
use crate::store::Snapshot;
use crate::types::*;

/// Repositories grouped by owning index.
pub fn repositories_by_index(
    tx: &impl Snapshot,
) -> StateResult<HashMap<IndexId, Vec<Repository>>> {
    let mut grouped: HashMap<IndexId, Vec<Repository>> = HashMap::new();
    for repo in tx.all::<Repository>()? {
        grouped.entry(repo.index_id).or_default().push(repo);
    }
    Ok(grouped)
}

pub fn indices_in_state(tx: &impl Snapshot, state: IndexState) -> StateResult<Vec<Index>> {
    tx.filter::<Index, _>(|idx| idx.state == state)
}

pub fn indices_on_node(tx: &impl Snapshot, node_id: NodeId) -> StateResult<Vec<Index>> {
    tx.filter::<Index, _>(|idx| idx.node_id == node_id)
}

/// `initializing` indices whose repositories have all finished. An index
/// without repositories counts as finished.
pub fn indices_ready_to_mark(tx: &impl Snapshot) -> StateResult<Vec<Index>> {
    let repos = repositories_by_index(tx)?;
    tx.filter::<Index, _>(|idx| {
        idx.state == IndexState::Initializing
            && repos
                .get(&idx.id)
                .is_none_or(|list| list.iter().all(|r| r.state.is_finished()))
    })
}

/// Critical-watermark indices that still hold a replica and are live.
pub fn indices_should_be_pending_eviction(tx: &impl Snapshot) -> StateResult<Vec<Index>> {
    tx.filter::<Index, _>(|idx| {
        idx.watermark_level == WatermarkLevel::CriticalWatermarkExceeded
            && idx.replica_id.is_some()
            && matches!(
                idx.state,
                IndexState::Pending | IndexState::Initializing | IndexState::Ready
            )
    })
}

pub fn indices_should_be_deleted(tx: &impl Snapshot) -> StateResult<Vec<Index>> {
    tx.filter::<Index, _>(|idx| idx.state.is_marked_for_removal())
}

/// Indices marked for removal that can still make progress: either they
/// have no repositories left, or some repository has not been flagged
/// `pending_deletion` yet.
pub fn indices_needing_deletion_work(
    tx: &impl Snapshot,
) -> StateResult<Vec<(Index, Vec<Repository>)>> {
    let mut repos = repositories_by_index(tx)?;
    let mut out = Vec::new();
    for idx in indices_should_be_deleted(tx)? {
        let list = repos.remove(&idx.id).unwrap_or_default();
        let needs_work = list.is_empty()
            || list
                .iter()
                .any(|r| r.state != RepositoryState::PendingDeletion);
        if needs_work {
            out.push((idx, list));
        }
    }
    Ok(out)
}

/// Indices whose replica or enabled namespace no longer exists.
pub fn indices_should_be_marked_as_orphaned(tx: &impl Snapshot) -> StateResult<Vec<Index>> {
    let replicas: HashSet<ReplicaId> = tx.all::<Replica>()?.into_iter().map(|r| r.id).collect();
    let namespaces: HashSet<EnabledNamespaceId> = tx
        .all::<EnabledNamespace>()?
        .into_iter()
        .map(|ns| ns.id)
        .collect();
    tx.filter::<Index, _>(|idx| {
        !idx.state.is_marked_for_removal()
            && (idx.replica_id.is_none_or(|id| !replicas.contains(&id))
                || idx
                    .enabled_namespace_id
                    .is_none_or(|id| !namespaces.contains(&id)))
    })
}

/// Indices whose used-storage figures predate the last indexing pass,
/// oldest refresh first.
pub fn indices_with_stale_used_storage(tx: &impl Snapshot) -> StateResult<Vec<Index>> {
    let mut stale = tx.filter::<Index, _>(|idx| idx.used_storage_is_stale())?;
    stale.sort_by_key(|idx| (idx.used_storage_bytes_updated_at, idx.id));
    Ok(stale)
}

/// `ready` overprovisioned indices whose storage figures are current.
pub fn indices_overprovisioned_with_fresh_storage(
    tx: &impl Snapshot,
) -> StateResult<Vec<Index>> {
    tx.filter::<Index, _>(|idx| {
        idx.state == IndexState::Ready
            && idx.watermark_level == WatermarkLevel::Overprovisioned
            && !idx.used_storage_is_stale()
    })
}

/// `pending` indices hosted on nodes seen within `online_threshold_secs`.
pub fn pending_indices_on_online_nodes(
    tx: &impl Snapshot,
    now: u64,
    online_threshold_secs: u64,
) -> StateResult<Vec<Index>> {
    let online: HashSet<NodeId> = tx
        .filter::<Node, _>(|node| node.is_online(now, online_threshold_secs))?
        .into_iter()
        .map(|node| node.id)
        .collect();
    tx.filter::<Index, _>(|idx| idx.state == IndexState::Pending && online.contains(&idx.node_id))
}

fn in_flight_repository_ids(
    tx: &impl Snapshot,
    task_type: TaskType,
) -> StateResult<HashSet<RepositoryId>> {
    Ok(tx
        .filter::<Task, _>(|t| t.task_type == task_type && t.state.is_in_flight())?
        .into_iter()
        .map(|t| t.repository_id)
        .collect())
}

/// Number of `pending` or `processing` tasks of the given type.
pub fn in_flight_task_count(tx: &impl Snapshot, task_type: TaskType) -> StateResult<usize> {
    Ok(tx
        .filter::<Task, _>(|t| t.task_type == task_type && t.state.is_in_flight())?
        .len())
}

/// Repositories awaiting an indexing task.
pub fn repositories_should_be_indexed(tx: &impl Snapshot) -> StateResult<Vec<Repository>> {
    let queued = in_flight_repository_ids(tx, TaskType::IndexRepo)?;
    tx.filter::<Repository, _>(|r| {
        matches!(
            r.state,
            RepositoryState::Pending | RepositoryState::Initializing
        ) && !queued.contains(&r.id)
    })
}

/// Repositories awaiting a deletion task.
pub fn repositories_should_be_deleted(tx: &impl Snapshot) -> StateResult<Vec<Repository>> {
    let queued = in_flight_repository_ids(tx, TaskType::DeleteRepo)?;
    tx.filter::<Repository, _>(|r| r.state.is_marked_for_removal() && !queued.contains(&r.id))
}

/// Repositories whose project or index no longer exists.
pub fn repositories_should_be_marked_as_orphaned(
    tx: &impl Snapshot,
) -> StateResult<Vec<Repository>> {
    let projects: HashSet<ProjectId> = tx.all::<Project>()?.into_iter().map(|p| p.id).collect();
    let indices: HashSet<IndexId> = tx.all::<Index>()?.into_iter().map(|i| i.id).collect();
    tx.filter::<Repository, _>(|r| {
        !r.state.is_marked_for_removal()
            && (!projects.contains(&r.project_id) || !indices.contains(&r.index_id))
    })
}

pub fn lost_nodes(
    tx: &impl Snapshot,
    now: u64,
    threshold_secs: Option<u64>,
) -> StateResult<Vec<Node>> {
    tx.filter::<Node, _>(|node| node.is_lost(now, threshold_secs))
}

/// Sum of reservations per node. Evicted indices no longer hold space.
pub fn reserved_bytes_by_node(tx: &impl Snapshot) -> StateResult<HashMap<NodeId, i64>> {
    let mut reserved: HashMap<NodeId, i64> = HashMap::new();
    for idx in tx.all::<Index>()? {
        if idx.state != IndexState::Evicted {
            *reserved.entry(idx.node_id).or_default() += idx.reserved_storage_bytes;
        }
    }
    Ok(reserved)
}

/// `usable - reserved` for one node; negative when over-committed.
pub fn unclaimed_storage_bytes(tx: &impl Snapshot, node: &Node) -> StateResult<i64> {
    let reserved: i64 = indices_on_node(tx, node.id)?
        .iter()
        .filter(|idx| idx.state != IndexState::Evicted)
        .map(|idx| idx.reserved_storage_bytes)
        .sum();
    Ok(node.usable_storage_bytes - reserved)
}

/// Nodes whose reservations exceed their usable storage.
pub fn nodes_with_negative_unclaimed_storage(tx: &impl Snapshot) -> StateResult<Vec<Node>> {
    let reserved = reserved_bytes_by_node(tx)?;
    tx.filter::<Node, _>(|node| {
        node.usable_storage_bytes - reserved.get(&node.id).copied().unwrap_or(0) < 0
    })
}

/// Nodes ordered by unclaimed storage, largest first.
pub fn nodes_by_unclaimed_storage_desc(tx: &impl Snapshot) -> StateResult<Vec<(Node, i64)>> {
    let reserved = reserved_bytes_by_node(tx)?;
    let mut nodes: Vec<(Node, i64)> = tx
        .all::<Node>()?
        .into_iter()
        .map(|node| {
            let unclaimed =
                node.usable_storage_bytes - reserved.get(&node.id).copied().unwrap_or(0);
            (node, unclaimed)
        })
        .collect();
    nodes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
    Ok(nodes)
}

pub fn enabled_namespace_for_root(
    tx: &impl Snapshot,
    root_namespace_id: NamespaceId,
) -> StateResult<Option<EnabledNamespace>> {
    Ok(tx
        .filter::<EnabledNamespace, _>(|ns| ns.root_namespace_id == root_namespace_id)?
        .into_iter()
        .next())
}

/// Mirrored projects belonging to `root_namespace_id` and covered by `range`.
pub fn projects_in_range(
    tx: &impl Snapshot,
    root_namespace_id: NamespaceId,
    range: &IndexMetadata,
) -> StateResult<Vec<Project>> {
    tx.filter::<Project, _>(|p| {
        p.root_namespace_id == root_namespace_id && range.covers(p.project_namespace_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;

    fn seed_index(store: &StateStore, state: IndexState) -> Index {
        store
            .write(|tx| {
                let node = tx.insert(Node::new("n", "node", 0))?;
                let ns = tx.insert(EnabledNamespace::new(1, 0))?;
                let replica = tx.insert(Replica {
                    id: 0,
                    enabled_namespace_id: ns.id,
                    namespace_id: 1,
                    state: ReplicaState::Ready,
                    created_at: 0,
                })?;
                let mut idx = Index::new(node.id, 1, 0);
                idx.enabled_namespace_id = Some(ns.id);
                idx.replica_id = Some(replica.id);
                idx.state = state;
                tx.insert(idx)
            })
            .unwrap()
    }

    fn add_repo(
        store: &StateStore,
        index_id: IndexId,
        project_id: ProjectId,
        state: RepositoryState,
    ) -> Repository {
        store
            .write(|tx| {
                let project = Project {
                    id: project_id,
                    project_namespace_id: project_id,
                    root_namespace_id: 1,
                };
                tx.put(&project)?;
                let mut repo = Repository::new(index_id, &project, 3, 0);
                repo.state = state;
                tx.insert(repo)
            })
            .unwrap()
    }

    #[test]
    fn ready_to_mark_requires_finished_repositories() {
        let store = StateStore::open_in_memory().unwrap();
        let empty = seed_index(&store, IndexState::Initializing);
        let finished = seed_index(&store, IndexState::Initializing);
        add_repo(&store, finished.id, 1, RepositoryState::Ready);
        add_repo(&store, finished.id, 2, RepositoryState::Failed);
        let busy = seed_index(&store, IndexState::Initializing);
        add_repo(&store, busy.id, 3, RepositoryState::Ready);
        add_repo(&store, busy.id, 4, RepositoryState::Initializing);
        let ready = seed_index(&store, IndexState::Ready);

        let ids: Vec<IndexId> = store
            .read(|tx| indices_ready_to_mark(tx))
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![empty.id, finished.id]);
        assert!(!ids.contains(&busy.id));
        assert!(!ids.contains(&ready.id));
    }

    #[test]
    fn orphaned_scope_detects_missing_replica() {
        let store = StateStore::open_in_memory().unwrap();
        let healthy = seed_index(&store, IndexState::Ready);
        let orphan = seed_index(&store, IndexState::Ready);
        let already = seed_index(&store, IndexState::Orphaned);
        let replica_id = orphan.replica_id.unwrap();
        store.remove::<Replica>(replica_id).unwrap();
        store.remove::<Replica>(already.replica_id.unwrap()).unwrap();

        let found = store
            .read(|tx| indices_should_be_marked_as_orphaned(tx))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, orphan.id);
        assert_ne!(found[0].id, healthy.id);
    }

    #[test]
    fn deletion_work_skips_fully_flagged_indices() {
        let store = StateStore::open_in_memory().unwrap();
        let empty = seed_index(&store, IndexState::Orphaned);
        let waiting = seed_index(&store, IndexState::PendingDeletion);
        add_repo(&store, waiting.id, 1, RepositoryState::PendingDeletion);
        let busy = seed_index(&store, IndexState::PendingDeletion);
        add_repo(&store, busy.id, 2, RepositoryState::Ready);

        let ids: Vec<IndexId> = store
            .read(|tx| indices_needing_deletion_work(tx))
            .unwrap()
            .into_iter()
            .map(|(i, _)| i.id)
            .collect();
        assert_eq!(ids, vec![empty.id, busy.id]);
    }

    #[test]
    fn should_be_indexed_excludes_queued_repositories() {
        let store = StateStore::open_in_memory().unwrap();
        let idx = seed_index(&store, IndexState::Initializing);
        let queued = add_repo(&store, idx.id, 1, RepositoryState::Initializing);
        let waiting = add_repo(&store, idx.id, 2, RepositoryState::Pending);
        add_repo(&store, idx.id, 3, RepositoryState::Ready);
        store
            .insert(Task::new(idx.node_id, &queued, TaskType::IndexRepo, 3, 0))
            .unwrap();

        let found = store.read(|tx| repositories_should_be_indexed(tx)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, waiting.id);
        assert_eq!(
            store
                .read(|tx| in_flight_task_count(tx, TaskType::IndexRepo))
                .unwrap(),
            1
        );
    }

    #[test]
    fn orphaned_repositories_follow_project_removal() {
        let store = StateStore::open_in_memory().unwrap();
        let idx = seed_index(&store, IndexState::Ready);
        let kept = add_repo(&store, idx.id, 1, RepositoryState::Ready);
        let gone = add_repo(&store, idx.id, 2, RepositoryState::Ready);
        store.remove::<Project>(gone.project_id).unwrap();

        let found = store
            .read(|tx| repositories_should_be_marked_as_orphaned(tx))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, gone.id);
        assert_ne!(found[0].id, kept.id);
    }

    #[test]
    fn negative_unclaimed_storage() {
        let store = StateStore::open_in_memory().unwrap();
        let idx = seed_index(&store, IndexState::Ready);
        let mut node: Node = store.require(idx.node_id).unwrap();
        node.usable_storage_bytes = idx.reserved_storage_bytes - 1;
        store.put(&node).unwrap();

        let negative = store
            .read(|tx| nodes_with_negative_unclaimed_storage(tx))
            .unwrap();
        assert_eq!(negative.len(), 1);
        assert_eq!(
            store.read(|tx| unclaimed_storage_bytes(tx, &node)).unwrap(),
            -1
        );

        let mut evicted = idx.clone();
        evicted.state = IndexState::Evicted;
        store.put(&evicted).unwrap();
        assert!(store
            .read(|tx| nodes_with_negative_unclaimed_storage(tx))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn projects_filtered_by_range() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|tx| {
                for (id, pns, root) in [(1, 5, 1), (2, 15, 1), (3, 25, 1), (4, 15, 2)] {
                    tx.put(&Project {
                        id,
                        project_namespace_id: pns,
                        root_namespace_id: root,
                    })?;
                }
                Ok(())
            })
            .unwrap();
        let found = store
            .read(|tx| projects_in_range(tx, 1, &IndexMetadata::range(Some(10), Some(20))))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 2);
    }
}
