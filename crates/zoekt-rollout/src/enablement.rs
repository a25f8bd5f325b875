//! Which root namespaces get code search.
//!
//! - On SaaS, root namespaces with an active paid subscription are enabled
//!   in batches, and those whose subscription lapsed beyond the grace period
//!   are removed again.
//! - On self-managed instances with auto-indexing switched on, every root
//!   namespace is enabled.

use std::collections::HashSet;

use tracing::{debug, info};
use zoekt_core::{BatchOutcome, SECONDS_PER_DAY, epoch_secs, split_batch};
use zoekt_events::{Event, WorkerContext};
use zoekt_state::{
    EnabledNamespace, Namespace, NamespaceId, Replica, Snapshot, StateError, StateResult, WriteTx,
    scopes,
};

fn enabled_roots(tx: &WriteTx) -> StateResult<HashSet<NamespaceId>> {
    Ok(tx
        .all::<EnabledNamespace>()?
        .into_iter()
        .map(|ns| ns.root_namespace_id)
        .collect())
}

/// Enable search for `root_namespace_id`. A root has at most one enabled
/// namespace.
pub fn enable_root(
    tx: &WriteTx,
    root_namespace_id: NamespaceId,
    now: u64,
) -> StateResult<EnabledNamespace> {
    if scopes::enabled_namespace_for_root(tx, root_namespace_id)?.is_some() {
        return Err(StateError::Conflict(format!(
            "namespace {root_namespace_id} is already enabled"
        )));
    }
    tx.insert(EnabledNamespace::new(root_namespace_id, now))
}

/// Create enabled namespaces for up to `limit` of the given roots.
fn enable_roots(
    tx: &WriteTx,
    candidates: Vec<Namespace>,
    limit: usize,
    now: u64,
) -> StateResult<BatchOutcome> {
    let (batch, remaining) = split_batch(candidates, limit);
    for namespace in &batch {
        enable_root(tx, namespace.id, now)?;
    }
    Ok(BatchOutcome::new(batch.len(), remaining))
}

pub struct SaasRolloutWorker {
    ctx: WorkerContext,
}

impl SaasRolloutWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self) -> StateResult<BatchOutcome> {
        if !self.ctx.gates.saas() {
            debug!("not a SaaS instance, skipping rollout");
            return Ok(BatchOutcome::empty());
        }
        let now = epoch_secs();
        let limit = self.ctx.limits.batch_size;
        let outcome = self.ctx.store.write(|tx| {
            let enabled = enabled_roots(tx)?;
            let candidates = tx.filter::<Namespace, _>(|ns| {
                ns.is_root()
                    && !enabled.contains(&ns.id)
                    && ns.subscription.as_ref().is_some_and(|s| s.is_active(now))
            })?;
            enable_roots(tx, candidates, limit, now)
        })?;

        if outcome.processed > 0 {
            info!(count = outcome.processed, "enabled namespaces with paid subscriptions");
        }
        self.ctx.republish_if_remaining(&outcome, Event::SaasRollout);
        Ok(outcome)
    }
}

/// Enables every root namespace on self-managed instances that opted in.
pub struct AutoIndexSelfManaged {
    ctx: WorkerContext,
}

impl AutoIndexSelfManaged {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn execute(&self) -> StateResult<BatchOutcome> {
        if self.ctx.gates.saas() || !self.ctx.gates.auto_index_root_namespace() {
            return Ok(BatchOutcome::empty());
        }
        let now = epoch_secs();
        let limit = self.ctx.limits.batch_size;
        let outcome = self.ctx.store.write(|tx| {
            let enabled = enabled_roots(tx)?;
            let candidates =
                tx.filter::<Namespace, _>(|ns| ns.is_root() && !enabled.contains(&ns.id))?;
            enable_roots(tx, candidates, limit, now)
        })?;
        if outcome.processed > 0 {
            info!(count = outcome.processed, "auto-enabled root namespaces");
        }
        Ok(outcome)
    }
}

/// Removes enabled namespaces whose subscription ended more than the grace
/// period ago, or whose namespace no longer exists.
pub struct ExpiredSubscriptionCleaner {
    ctx: WorkerContext,
}

impl ExpiredSubscriptionCleaner {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn execute(&self) -> StateResult<BatchOutcome> {
        if !self.ctx.gates.saas() {
            return Ok(BatchOutcome::empty());
        }
        let now = epoch_secs();
        let grace = self.ctx.limits.expired_subscription_grace_days * SECONDS_PER_DAY;
        let limit = self.ctx.limits.batch_size;
        let outcome = self.ctx.store.write(|tx| {
            let mut expired = Vec::new();
            for enabled in tx.all::<EnabledNamespace>()? {
                let lapsed = match tx.get::<Namespace>(enabled.root_namespace_id)? {
                    None => true,
                    Some(ns) => ns
                        .subscription
                        .as_ref()
                        .is_some_and(|s| s.expired_beyond(now, grace)),
                };
                if lapsed {
                    expired.push(enabled);
                }
            }
            let (batch, remaining) = split_batch(expired, limit);
            for enabled in &batch {
                let replica_ids: Vec<u64> = tx
                    .filter::<Replica, _>(|r| r.enabled_namespace_id == enabled.id)?
                    .into_iter()
                    .map(|r| r.id)
                    .collect();
                tx.remove_many::<Replica>(&replica_ids)?;
                tx.remove::<EnabledNamespace>(enabled.id)?;
            }
            Ok(BatchOutcome::new(batch.len(), remaining))
        })?;
        if outcome.processed > 0 {
            info!(
                count = outcome.processed,
                "removed enabled namespaces with expired subscriptions"
            );
        }
        Ok(outcome)
    }
}
