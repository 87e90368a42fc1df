//! # Measurement
//!
//! Transform from raw sensor code to water depth and fill percentage, and
//! the freshness state of the last committed measurement.

use crate::modem::RAW_VALUE_MAX;
use crate::timing::{elapsed, Millis};

/// Integer linear re-mapping of `x` from one range to another.
///
/// Truncates toward zero and does not clamp, so callers clamp the result.
///
/// # Examples
///
/// ```
/// use tank_gateway::telemetry::measurement::map_range;
///
/// assert_eq!(map_range(0, 0, 1023, 200, 0), 200);
/// assert_eq!(map_range(1023, 0, 1023, 200, 0), 0);
/// assert_eq!(map_range(100, 0, 200, 0, 100), 50);
/// ```
#[must_use]
pub fn map_range(x: i64, in_min: i64, in_max: i64, out_min: i64, out_max: i64) -> i64 {
    if in_max == in_min {
        return out_min;
    }
    (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

/// Water depth for a raw code: 0 maps to `max_depth`, 1023 maps to 0.
#[must_use]
pub fn depth_from_raw(raw: u16, max_depth: u16) -> u16 {
    let depth = map_range(
        i64::from(raw),
        0,
        i64::from(RAW_VALUE_MAX),
        i64::from(max_depth),
        0,
    );
    depth.clamp(0, i64::from(max_depth)) as u16
}

/// Fill percentage of `depth` within `0..=max_depth`.
#[must_use]
pub fn percentage_from_depth(depth: u16, max_depth: u16) -> u8 {
    let percentage = map_range(i64::from(depth), 0, i64::from(max_depth), 0, 100);
    percentage.clamp(0, 100) as u8
}

/// Last validated reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Raw sensor code, 0..=1023
    pub raw: u16,
    /// Depth, 0..=max_depth
    pub depth: u16,
    /// Fill percentage, 0..=100
    pub percentage: u8,
    /// Capture time
    pub captured_at: Millis,
    /// False once the reading is older than the staleness threshold
    pub fresh: bool,
}

impl Measurement {
    /// Build a fresh measurement from a validated raw code.
    #[must_use]
    pub fn from_raw(raw: u16, max_depth: u16, now: Millis) -> Self {
        let depth = depth_from_raw(raw, max_depth);
        Self {
            raw,
            depth,
            percentage: percentage_from_depth(depth, max_depth),
            captured_at: now,
            fresh: true,
        }
    }

    /// Milliseconds since capture.
    #[must_use]
    pub fn age(&self, now: Millis) -> Millis {
        elapsed(now, self.captured_at)
    }

    /// Clear `fresh` once the age exceeds `stale_after`.
    ///
    /// Returns true only on the transition. Numeric values are kept.
    pub fn mark_stale_if_expired(&mut self, now: Millis, stale_after: Millis) -> bool {
        if self.fresh && self.age(now) > stale_after {
            self.fresh = false;
            return true;
        }
        false
    }
}
