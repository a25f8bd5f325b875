//! zoekt-dispatch: repository task plumbing.
//!
//! # Architecture
//!
//! ```text
//! Repository (pending) ──dispatcher──▶ Task (pending) ──pulled by node──▶ processing
//!                                                                           │
//!        ┌────────────────────── callback ◀─────────────────────────────────┘
//!        ▼
//!  success: repository ready / removed
//!  failure: TaskFailed ──▶ retry accounting ──▶ pending | failed | pending_deletion
//! ```

pub mod callback;
pub mod dispatcher;
pub mod failure;

pub use callback::{CallbackOutcome, TaskCallbackService, TaskReport};
pub use dispatcher::{DispatchOutcome, TaskDispatcher};
pub use failure::TaskFailedWorker;
