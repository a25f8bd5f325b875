//! Storage watermark math for indices.
//!
//! An index's level is derived from `used / reserved`:
//! - **overprovisioned**: below the ideal ratio, reservation can shrink
//! - **healthy**: between ideal and the low watermark
//! - **low / high / critical exceeded**: reservation should grow; critical
//!   indices become eviction candidates
//!
//! The index critical watermark never exceeds the node critical limit, so an
//! index cannot out-grow the node that hosts it before being flagged.

use zoekt_state::{
    DEFAULT_USED_STORAGE_BYTES, Index, IndexState, Snapshot, StateResult, WatermarkLevel,
};

pub const STORAGE_IDEAL_PERCENT_USED: f64 = 0.40;
pub const STORAGE_LOW_WATERMARK: f64 = 0.70;
pub const STORAGE_HIGH_WATERMARK: f64 = 0.75;
pub const STORAGE_CRITICAL_WATERMARK: f64 = 0.85;

/// Level for the given usage. A zero (or negative) reservation is critical.
pub fn appropriate_watermark_level(used_bytes: i64, reserved_bytes: i64) -> WatermarkLevel {
    if reserved_bytes <= 0 {
        return WatermarkLevel::CriticalWatermarkExceeded;
    }
    let ratio = used_bytes as f64 / reserved_bytes as f64;
    if ratio < STORAGE_IDEAL_PERCENT_USED {
        WatermarkLevel::Overprovisioned
    } else if ratio < STORAGE_LOW_WATERMARK {
        WatermarkLevel::Healthy
    } else if ratio < STORAGE_HIGH_WATERMARK {
        WatermarkLevel::LowWatermarkExceeded
    } else if ratio < STORAGE_CRITICAL_WATERMARK {
        WatermarkLevel::HighWatermarkExceeded
    } else {
        WatermarkLevel::CriticalWatermarkExceeded
    }
}

pub fn needs_more_reservation(level: WatermarkLevel) -> bool {
    matches!(
        level,
        WatermarkLevel::LowWatermarkExceeded
            | WatermarkLevel::HighWatermarkExceeded
            | WatermarkLevel::CriticalWatermarkExceeded
    )
}

/// Reservation that puts `used_bytes` exactly at the ideal ratio.
pub fn ideal_reserved_bytes(used_bytes: i64) -> i64 {
    let used = used_bytes.max(DEFAULT_USED_STORAGE_BYTES);
    (used as f64 / STORAGE_IDEAL_PERCENT_USED).ceil() as i64
}

/// New reservation for an index given its current figures and the hosting
/// node's unclaimed storage.
///
/// Growth is bounded by `unclaimed_bytes` and skipped when the node has
/// nothing left. Shrinking only applies to `ready` indices.
pub fn rebalanced_reservation(index: &Index, unclaimed_bytes: i64) -> i64 {
    let level = appropriate_watermark_level(index.used_storage_bytes, index.reserved_storage_bytes);
    let ideal = ideal_reserved_bytes(index.used_storage_bytes);
    if needs_more_reservation(level) {
        if unclaimed_bytes <= 0 {
            return index.reserved_storage_bytes;
        }
        let wanted = (ideal - index.reserved_storage_bytes).max(0);
        index.reserved_storage_bytes + wanted.min(unclaimed_bytes)
    } else if level == WatermarkLevel::Overprovisioned && index.state == IndexState::Ready {
        ideal
    } else {
        index.reserved_storage_bytes
    }
}

/// Indices whose stored level disagrees with their current figures.
pub fn indices_with_mismatched_watermark_levels(tx: &impl Snapshot) -> StateResult<Vec<Index>> {
    tx.filter::<Index, _>(|idx| {
        idx.watermark_level
            != appropriate_watermark_level(idx.used_storage_bytes, idx.reserved_storage_bytes)
    })
}
