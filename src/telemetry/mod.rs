//! # Telemetry Module
//!
//! Turns radio frames into validated measurements and relays them.
//!
//! This module handles:
//! - Draining receive events buffered by the modem link
//! - Decoding and validating frames (malformed and out-of-range frames are dropped)
//! - Committing the [`Measurement`] (the single write point for measurement state)
//! - Relaying to the backend when connected ([`relay`])
//! - Re-arming receive after every frame, accepted or rejected
//! - Flagging stale measurements
//! - Frame and relay statistics

pub mod measurement;
pub mod relay;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::{FrameError, ModemError};
use crate::modem::{decode_frame, ModemCommand};
use crate::serial::ModemLink;
use crate::timing::Millis;
pub use measurement::Measurement;
use relay::{Backend, RelayOutcome, RetryPolicy, Submission};

/// Running totals since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub relays_succeeded: u64,
    pub relays_failed: u64,
}

/// What happened to one line taken from the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not a receive event; logged and ignored.
    Ignored,
    /// Receive event that failed validation.
    Rejected(FrameError),
    /// Valid frame; `relay` is `None` when no relay was attempted.
    Accepted {
        measurement: Measurement,
        relay: Option<RelayOutcome>,
    },
}

/// Backend and submission details used while connected.
pub struct RelayTarget<'a> {
    pub backend: &'a dyn Backend,
    pub api_key: &'a str,
    pub policy: RetryPolicy,
}

/// Live values served to HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveData {
    pub water_level: u16,
    pub percentage: u8,
    pub wifi_connected: bool,
}

/// Something that can process buffered radio input without relaying.
///
/// Used while a blocking wait (a connection attempt) is in progress so
/// that frames keep flowing into the measurement state.
#[async_trait]
pub trait RadioDrain {
    /// Process every buffered line; returns the number of accepted frames.
    async fn drain_offline(&mut self, now: Millis) -> usize;
}

/// Frame ingestion state machine over a [`ModemLink`].
pub struct TelemetryPipeline<L: ModemLink> {
    link: L,
    max_depth: u16,
    tank_id: u32,
    stale_after_ms: Millis,
    measurement: Option<Measurement>,
    stats: TelemetryStats,
}

impl<L: ModemLink> TelemetryPipeline<L> {
    pub fn new(link: L, config: &TelemetryConfig) -> Self {
        Self {
            link,
            max_depth: config.max_depth,
            tank_id: config.tank_id,
            stale_after_ms: config.stale_after_ms,
            measurement: None,
            stats: TelemetryStats::default(),
        }
    }

    /// Last committed measurement, if any frame was accepted yet.
    #[must_use]
    pub fn measurement(&self) -> Option<&Measurement> {
        self.measurement.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> TelemetryStats {
        self.stats
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Live values for HTTP clients; zeros before the first frame.
    #[must_use]
    pub fn live_data(&self, wifi_connected: bool) -> LiveData {
        let (water_level, percentage) = self
            .measurement
            .map_or((0, 0), |m| (m.depth, m.percentage));
        LiveData {
            water_level,
            percentage,
            wifi_connected,
        }
    }

    /// Arm continuous receive. Failures are logged, not returned.
    pub async fn rearm(&mut self) -> bool {
        match self.link.execute(&ModemCommand::ArmReceive).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to re-arm radio receive");
                false
            }
        }
    }

    /// Probe the modem, then re-arm receive.
    pub async fn probe_and_rearm(&mut self) -> Result<(), ModemError> {
        if let Err(e) = self.link.execute(&ModemCommand::Probe).await {
            warn!(error = %e, "Modem liveness probe failed");
            return Err(e);
        }
        self.link.execute(&ModemCommand::ArmReceive).await
    }

    /// Flag the measurement stale once it is too old.
    ///
    /// Returns true on the transition only.
    pub fn check_staleness(&mut self, now: Millis) -> bool {
        let stale_after = self.stale_after_ms;
        let Some(m) = self.measurement.as_mut() else {
            return false;
        };
        if !m.mark_stale_if_expired(now, stale_after) {
            return false;
        }

        info!(
            age_ms = m.age(now),
            depth = m.depth,
            "Measurement is stale; keeping last values for display"
        );
        true
    }

    /// Process every line currently buffered by the modem link.
    ///
    /// Accepted frames are relayed through `target` when one is given.
    /// Receive is re-armed after each receive event, valid or not.
    pub async fn poll_radio(
        &mut self,
        now: Millis,
        target: Option<&RelayTarget<'_>>,
    ) -> Vec<FrameOutcome> {
        let lines = self.link.take_pending_lines();
        let mut outcomes = Vec::with_capacity(lines.len());
        for line in lines {
            outcomes.push(self.process_line(&line, now, target).await);
        }
        outcomes
    }

    /// Handle one line from the modem.
    pub async fn process_line(
        &mut self,
        line: &str,
        now: Millis,
        target: Option<&RelayTarget<'_>>,
    ) -> FrameOutcome {
        let raw = match decode_frame(line) {
            Ok(raw) => raw,
            Err(FrameError::NotDataEvent) => {
                debug!(line = %line.trim(), "Modem line ignored");
                return FrameOutcome::Ignored;
            }
            Err(e) => {
                warn!(line = %line.trim(), error = %e, "Dropping radio frame");
                self.stats.frames_rejected += 1;
                self.rearm().await;
                return FrameOutcome::Rejected(e);
            }
        };

        let measurement = self.commit(raw, now);

        let relay = match target {
            Some(target) => {
                let submission = Submission {
                    tank_id: self.tank_id,
                    level: measurement.depth,
                    percentage: measurement.percentage,
                    api_key: target.api_key.to_string(),
                };
                let outcome = relay::relay(target.backend, &submission, target.policy).await;
                if outcome.is_delivered() {
                    self.stats.relays_succeeded += 1;
                } else {
                    self.stats.relays_failed += 1;
                }
                Some(outcome)
            }
            None => {
                debug!("Not connected; measurement kept locally");
                None
            }
        };

        self.rearm().await;
        FrameOutcome::Accepted { measurement, relay }
    }

    fn commit(&mut self, raw: u16, now: Millis) -> Measurement {
        let measurement = Measurement::from_raw(raw, self.max_depth, now);
        self.measurement = Some(measurement);
        self.stats.frames_accepted += 1;
        info!(
            raw,
            depth = measurement.depth,
            percentage = measurement.percentage,
            "Measurement received"
        );
        measurement
    }
}

#[async_trait]
impl<L: ModemLink> RadioDrain for TelemetryPipeline<L> {
    async fn drain_offline(&mut self, now: Millis) -> usize {
        self.poll_radio(now, None)
            .await
            .iter()
            .filter(|o| matches!(o, FrameOutcome::Accepted { .. }))
            .count()
    }
}
