//! zoekt-state: embedded state store for the Zoekt orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), holds nodes, enabled namespaces,
//! replicas, indices, repositories and tasks, plus mirrors of the host
//! application's projects and namespaces.
//!
//! # Architecture
//!
//! ```text
//!   Node ──< Index >── Replica >── EnabledNamespace
//!              │
//!              └──< Repository ──< Task (survives node deletion)
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns
//! under `u64` ids. [`scopes`] holds the eligibility predicates workers use
//! inside a [`StateStore::write`] transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod scopes;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReadTx, Record, Snapshot, StateStore, WriteTx};
pub use types::*;
