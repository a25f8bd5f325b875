//! zoekt-cluster: search node membership.
//!
//! # Components
//!
//! - **`membership`**: node upsert from task requests, concurrency limits,
//!   task claiming, online/lost views
//! - **`lost_node`**: removal of nodes that stopped reporting, together
//!   with the indices and repositories they hosted

pub mod lost_node;
pub mod membership;

pub use lost_node::{LostNodeOutcome, LostNodeWorker};
pub use membership::{DiskStats, MembershipManager, TaskAssignment, TaskRequest};
