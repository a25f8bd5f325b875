//! zoekt-rollout: bringing namespaces onto the search fleet.
//!
//! # Components
//!
//! - **`enablement`**: SaaS rollout of paid root namespaces, auto-indexing
//!   on self-managed instances, removal of lapsed subscriptions
//! - **`provisioning`**: planning replicas onto nodes and creating them
//! - **`replicas`**: replica state derived from index state

pub mod enablement;
pub mod provisioning;
pub mod replicas;

pub use enablement::{
    AutoIndexSelfManaged, ExpiredSubscriptionCleaner, SaasRolloutWorker, enable_root,
};
pub use provisioning::{
    NODE_CAPACITY_EXCEEDED, ProvisioningError, ProvisioningPlan, ProvisioningPlanner,
    ProvisioningService, ProvisioningSummary,
};
pub use replicas::{ReplicaStateChanges, ReplicaStateWorker};
