//! zoekt-events: event taxonomy and delivery for the Zoekt orchestrator.
//!
//! # Architecture
//!
//! ```text
//! scheduler tick ──publish──▶ EventBus ──▶ consumer ──▶ worker(ctx)
//!                                ▲                          │
//!                                └──── re-publish while ────┘
//!                                      work remains
//! ```
//!
//! Every worker receives a [`WorkerContext`] carrying the store, the
//! configured limits, the injected gates and the bus it publishes
//! follow-up events on.

pub mod bus;
pub mod context;
pub mod event;

pub use bus::{ChannelBus, EventBus, RecordingBus};
pub use context::WorkerContext;
pub use event::{Deduplication, Event};
