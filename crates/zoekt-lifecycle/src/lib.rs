//! zoekt-lifecycle: the index state machine.
//!
//! ```text
//! pending ─initial indexing─▶ initializing ─all repos finished─▶ ready
//!    │                             │                              │
//!    └──────── critical watermark ─┴──────────────────────────────┘
//!                                  ▼
//!                          pending_eviction ─▶ evicted
//!
//! any live state ─replica/namespace gone─▶ orphaned ─▶ (destroyed)
//!                                pending_deletion ─▶ (destroyed)
//! ```
//!
//! # Components
//!
//! - **`initial_indexing`**: bulk-creates repositories for a pending index
//! - **`ready`**: promotes indices whose repositories have finished
//! - **`eviction`**: flags and evicts critical-watermark indices
//! - **`orphans`**: flags indices and repositories whose parents vanished
//! - **`deletion`**: tears down indices marked for removal

pub mod deletion;
pub mod eviction;
pub mod initial_indexing;
pub mod orphans;
pub mod ready;
mod transition;

pub use deletion::IndexDeletionWorker;
pub use eviction::{EvictionWorker, PendingEvictionWorker};
pub use initial_indexing::InitialIndexingWorker;
pub use orphans::{OrphanedIndexWorker, OrphanedRepoWorker};
pub use ready::MarkReadyWorker;
