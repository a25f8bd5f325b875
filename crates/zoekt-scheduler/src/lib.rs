//! zoekt-scheduler: drives the orchestrator.
//!
//! # Architecture
//!
//! ```text
//!  cron tick ──▶ SchedulingWorker ──▶ SchedulingService::execute(task) × N
//!                                          │ scope non-empty
//!                                          ▼
//!                                     EventBus::publish
//!                                          │
//!  EventConsumer ◀─────────────────────────┘
//!     │ route(event)
//!     ▼
//!  lifecycle / dispatch / capacity / cluster / rollout workers
//!     │ work left over
//!     └──▶ re-publish
//! ```

pub mod consumer;
pub mod cron;
pub mod error;
pub mod service;
pub mod task;

pub use consumer::{EventConsumer, route};
pub use cron::SchedulingWorker;
pub use error::{SchedulerError, SchedulerResult};
pub use service::SchedulingService;
pub use task::ScheduledTask;
