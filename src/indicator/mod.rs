//! # Status Indicator Module
//!
//! Renders the node's [`SystemState`] on a single dimmable output using only
//! elapsed-time comparisons. Nothing here sleeps: [`StatusIndicator::tick`]
//! is called once per control-loop iteration and performs at most one
//! output update.
//!
//! ## Patterns
//!
//! | State | Output |
//! |-------|--------|
//! | Idle | off |
//! | ConfigMode | toggles every 200 ms |
//! | Error | toggles every 200 ms (logged differently) |
//! | Connecting | breathes 0 → 255 → 0 in steps of 5 every 10 ms |
//! | Connected | fully on |
//! | Transmitting | off, on, off, on at 100 ms, then back to Connected |
//!
//! ## Usage
//!
//! ```
//! use tank_gateway::indicator::{StatusIndicator, SystemState};
//! use tank_gateway::indicator::output::NullOutput;
//!
//! let mut indicator = StatusIndicator::new(NullOutput::default());
//! indicator.set_state(SystemState::Connected);
//! assert_eq!(indicator.level(), 255);
//!
//! indicator.set_state(SystemState::Transmitting);
//! for now in (0..=500).step_by(100) {
//!     indicator.tick(now);
//! }
//! assert_eq!(indicator.current_state(), SystemState::Connected);
//! ```

pub mod output;

use std::fmt;
use tracing::info;

use crate::timing::{interval_elapsed, Millis};
pub use output::IndicatorOutput;

/// Toggle period for ConfigMode and Error.
pub const FAST_BLINK_INTERVAL_MS: Millis = 200;

/// Period between breathing steps while Connecting.
pub const BREATH_STEP_INTERVAL_MS: Millis = 10;

/// Intensity change per breathing step.
pub const BREATH_STEP: u8 = 5;

/// Toggle period of the transmit flash.
pub const FLASH_INTERVAL_MS: Millis = 100;

/// off, on, off, on
const FLASH_TOGGLES: u8 = 4;

/// Full output intensity.
pub const LEVEL_FULL: u8 = u8::MAX;

/// Process-wide operating state shown on the indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemState {
    Idle,
    ConfigMode,
    Connecting,
    Connected,
    Error,
    Transmitting,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Idle => "idle",
            SystemState::ConfigMode => "config mode",
            SystemState::Connecting => "connecting",
            SystemState::Connected => "connected",
            SystemState::Error => "error",
            SystemState::Transmitting => "transmitting",
        };
        f.write_str(name)
    }
}

/// Time-driven renderer of [`SystemState`].
#[derive(Debug)]
pub struct StatusIndicator<O: IndicatorOutput> {
    output: O,
    state: SystemState,
    /// Time of the last output update; `None` fires on the next tick.
    last_update: Option<Millis>,
    level: u8,
    lit: bool,
    rising: bool,
    flash_toggles: u8,
}

impl<O: IndicatorOutput> StatusIndicator<O> {
    /// Create an indicator in the Idle state with the output switched off.
    pub fn new(mut output: O) -> Self {
        output.set_level(0);
        Self {
            output,
            state: SystemState::Idle,
            last_update: None,
            level: 0,
            lit: false,
            rising: true,
            flash_toggles: 0,
        }
    }

    /// The state currently being rendered.
    #[must_use]
    pub fn current_state(&self) -> SystemState {
        self.state
    }

    /// The intensity last written to the output.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Borrow the output sink.
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Switch to `state`, resetting all pattern timing.
    ///
    /// Setting the current state again is a no-op, except for
    /// Transmitting, which restarts the flash. Idle and Connected take
    /// effect on the output immediately.
    pub fn set_state(&mut self, state: SystemState) {
        if state == self.state && state != SystemState::Transmitting {
            return;
        }

        self.state = state;
        self.last_update = None;
        self.flash_toggles = 0;
        self.rising = true;

        match state {
            SystemState::Idle => {
                self.write(0);
                info!("Indicator: OFF");
            }
            SystemState::Connected => {
                self.write(LEVEL_FULL);
                info!("Indicator: CONNECTED (solid on)");
            }
            SystemState::ConfigMode => {
                self.lit = self.level > 0;
                info!("Indicator: CONFIG MODE (fast blink)");
            }
            SystemState::Error => {
                self.lit = self.level > 0;
                info!("Indicator: ERROR (fast blink)");
            }
            SystemState::Connecting => {
                self.write(0);
                info!("Indicator: CONNECTING (breathing)");
            }
            SystemState::Transmitting => {
                self.lit = true;
            }
        }
    }

    /// Advance the pattern to `now`. At most one output update per call.
    pub fn tick(&mut self, now: Millis) {
        match self.state {
            SystemState::Idle | SystemState::Connected => {}
            SystemState::ConfigMode | SystemState::Error => {
                if self.due(now, FAST_BLINK_INTERVAL_MS) {
                    self.lit = !self.lit;
                    self.write(if self.lit { LEVEL_FULL } else { 0 });
                    self.last_update = Some(now);
                }
            }
            SystemState::Connecting => {
                if self.due(now, BREATH_STEP_INTERVAL_MS) {
                    let next = self.next_breath_level();
                    self.write(next);
                    self.last_update = Some(now);
                }
            }
            SystemState::Transmitting => {
                if self.flash_toggles < FLASH_TOGGLES {
                    if self.due(now, FLASH_INTERVAL_MS) {
                        self.lit = !self.lit;
                        self.write(if self.lit { LEVEL_FULL } else { 0 });
                        self.last_update = Some(now);
                        self.flash_toggles += 1;
                    }
                } else {
                    self.set_state(SystemState::Connected);
                }
            }
        }
    }

    fn due(&self, now: Millis, interval: Millis) -> bool {
        self.last_update
            .map_or(true, |last| interval_elapsed(now, last, interval))
    }

    fn next_breath_level(&mut self) -> u8 {
        if self.rising {
            let next = self.level.saturating_add(BREATH_STEP);
            if next == LEVEL_FULL {
                self.rising = false;
            }
            next
        } else {
            let next = self.level.saturating_sub(BREATH_STEP);
            if next == 0 {
                self.rising = true;
            }
            next
        }
    }

    fn write(&mut self, level: u8) {
        self.level = level;
        self.output.set_level(level);
    }
}
