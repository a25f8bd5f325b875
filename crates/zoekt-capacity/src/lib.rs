//! zoekt-capacity: storage accounting for indices and nodes.
//!
//! Pure watermark math lives in [`watermark`]; the event-driven workers
//! that apply it to the store live in [`storage`].

pub mod storage;
pub mod watermark;

pub use storage::{
    ForceUpdateOverprovisionedWorker, NegativeUnclaimedStorageWorker, UpdateUsedStorageWorker,
    update_reservation,
};
pub use watermark::{appropriate_watermark_level, indices_with_mismatched_watermark_levels};
