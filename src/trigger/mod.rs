//! # Boot Trigger Module
//!
//! Decides whether the node must enter configuration mode.
//!
//! Several independent signals can force configuration mode; they are
//! collected into [`TriggerInputs`] and resolved by [`evaluate`], first
//! match wins:
//!
//! 1. No configured credentials
//! 2. Rapid power cycling (see [`register_boot`])
//! 3. Operator "enter configuration" command
//! 4. Too many consecutive failed connection attempts ([`RetryCounter`])
//! 5. Physical control held past its duration ([`button::ButtonHoldTracker`])
//!
//! Every check is a cheap state comparison; nothing here blocks.

pub mod button;

use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info, warn};

use crate::storage::boot_record::{BootCycleRecord, BootRecordStore};

/// Why configuration mode is being forced, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    NoTrigger,
    MissingCredentials,
    RapidCycle,
    OperatorRequest,
    RetryExhausted,
    ButtonHeld,
}

impl TriggerReason {
    /// True for every reason except [`TriggerReason::NoTrigger`].
    #[must_use]
    pub fn forces_config_mode(self) -> bool {
        self != TriggerReason::NoTrigger
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TriggerReason::NoTrigger => "no trigger",
            TriggerReason::MissingCredentials => "no saved configuration",
            TriggerReason::RapidCycle => "rapid power cycling",
            TriggerReason::OperatorRequest => "operator request",
            TriggerReason::RetryExhausted => "connection retries exhausted",
            TriggerReason::ButtonHeld => "configuration button held",
        };
        f.write_str(text)
    }
}

/// Snapshot of every trigger signal for one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerInputs {
    pub credentials_configured: bool,
    pub rapid_cycle: bool,
    pub operator_request: bool,
    pub retries_exhausted: bool,
    pub button_held: bool,
}

/// Resolve the trigger signals into a single reason. First match wins.
///
/// # Examples
///
/// ```
/// use tank_gateway::trigger::{evaluate, TriggerInputs, TriggerReason};
///
/// let inputs = TriggerInputs {
///     credentials_configured: true,
///     operator_request: true,
///     button_held: true,
///     ..Default::default()
/// };
/// assert_eq!(evaluate(&inputs), TriggerReason::OperatorRequest);
/// ```
#[must_use]
pub fn evaluate(inputs: &TriggerInputs) -> TriggerReason {
    if !inputs.credentials_configured {
        TriggerReason::MissingCredentials
    } else if inputs.rapid_cycle {
        TriggerReason::RapidCycle
    } else if inputs.operator_request {
        TriggerReason::OperatorRequest
    } else if inputs.retries_exhausted {
        TriggerReason::RetryExhausted
    } else if inputs.button_held {
        TriggerReason::ButtonHeld
    } else {
        TriggerReason::NoTrigger
    }
}

/// Result of registering one boot against the previous record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootCycle {
    /// Keep counting; persist this record.
    Counting(BootCycleRecord),
    /// Threshold reached; the record must be discarded.
    Rapid,
}

/// Register a boot at `now` against the previous record.
///
/// The count restarts at 1 when there is no previous record or the gap
/// since the last boot is outside `window_ms` (a clock that went backwards
/// also restarts it). Reaching `threshold` consecutive quick boots yields
/// [`BootCycle::Rapid`].
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use tank_gateway::trigger::{register_boot, BootCycle};
///
/// let t0 = Utc::now();
/// let BootCycle::Counting(first) = register_boot(None, t0, 10_000, 3) else { unreachable!() };
/// assert_eq!(first.count, 1);
///
/// let t1 = t0 + Duration::seconds(2);
/// let BootCycle::Counting(second) = register_boot(Some(first), t1, 10_000, 3) else { unreachable!() };
/// assert_eq!(second.count, 2);
///
/// let t2 = t1 + Duration::seconds(2);
/// assert_eq!(register_boot(Some(second), t2, 10_000, 3), BootCycle::Rapid);
/// ```
#[must_use]
pub fn register_boot(
    previous: Option<BootCycleRecord>,
    now: DateTime<Utc>,
    window_ms: u64,
    threshold: u32,
) -> BootCycle {
    let count = match previous {
        Some(record) => {
            let gap_ms = now.signed_duration_since(record.last_boot).num_milliseconds();
            if gap_ms >= 0 && (gap_ms as u64) <= window_ms {
                record.count.saturating_add(1)
            } else {
                1
            }
        }
        None => 1,
    };

    if count >= threshold {
        BootCycle::Rapid
    } else {
        BootCycle::Counting(BootCycleRecord {
            count,
            last_boot: now,
        })
    }
}

/// Register this boot in the persisted record and report rapid cycling.
///
/// Storage failures are logged; they never force configuration mode on
/// their own.
pub fn detect_rapid_cycle(
    store: &BootRecordStore,
    now: DateTime<Utc>,
    window_ms: u64,
    threshold: u32,
) -> bool {
    match register_boot(store.load(), now, window_ms, threshold) {
        BootCycle::Counting(record) => {
            debug!(count = record.count, "Boot registered");
            if let Err(e) = store.save(&record) {
                warn!(error = %e, "Failed to persist boot-cycle record");
            }
            false
        }
        BootCycle::Rapid => {
            info!(threshold, "Rapid power cycling detected");
            if let Err(e) = store.clear() {
                warn!(error = %e, "Failed to discard boot-cycle record");
            }
            true
        }
    }
}

/// In-memory count of consecutive failed connection attempts.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    count: u32,
    threshold: u32,
}

impl RetryCounter {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    /// Record one failed attempt; returns the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.count >= self.threshold
    }
}
