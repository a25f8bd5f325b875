//! zoekt-core: shared building blocks for the Zoekt index orchestrator.
//!
//! - [`config`]: `zoekt.toml` parsing with per-section defaults
//! - [`gates`]: capability switches injected into workers
//! - [`batch`]: the self-paginating batch primitive used by every bulk worker

pub mod batch;
pub mod config;
pub mod gates;

pub use batch::{BatchOutcome, split_batch};
pub use config::{DaemonConfig, GatesConfig, LimitsConfig, ZoektConfig};
pub use gates::{Gates, StaticGates};

use std::time::{SystemTime, UNIX_EPOCH};

pub const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
