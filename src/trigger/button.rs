//! Optional physical configuration control.
//!
//! The control is a GPIO exposed through a sysfs `value` file and read as
//! active-low (`0` means pressed). Holding it continuously for the
//! configured duration forces configuration mode; releasing earlier
//! cancels.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::timing::{elapsed, Millis};

/// Source of the control's pressed state.
pub trait ButtonInput {
    fn is_pressed(&mut self) -> bool;
}

/// GPIO `value` file, active-low.
#[derive(Debug)]
pub struct SysfsButton {
    path: PathBuf,
    read_failed: bool,
}

impl SysfsButton {
    pub fn new(path: &Path) -> Self {
        debug!(path = %path.display(), "Using sysfs configuration button");
        Self {
            path: path.to_path_buf(),
            read_failed: false,
        }
    }
}

impl ButtonInput for SysfsButton {
    fn is_pressed(&mut self) -> bool {
        match fs::read_to_string(&self.path) {
            Ok(value) => {
                self.read_failed = false;
                value.trim() == "0"
            }
            Err(e) => {
                if !self.read_failed {
                    warn!(error = %e, path = %self.path.display(), "Failed to read configuration button");
                }
                self.read_failed = true;
                false
            }
        }
    }
}

/// Tracks how long the control has been held.
#[derive(Debug, Clone)]
pub struct ButtonHoldTracker {
    hold_ms: Millis,
    pressed_since: Option<Millis>,
    fired: bool,
}

impl ButtonHoldTracker {
    #[must_use]
    pub fn new(hold_ms: Millis) -> Self {
        Self {
            hold_ms,
            pressed_since: None,
            fired: false,
        }
    }

    /// Feed one sample. Returns true exactly once per continuous hold,
    /// on the first sample at or past the hold duration.
    pub fn update(&mut self, pressed: bool, now: Millis) -> bool {
        if !pressed {
            if self.pressed_since.is_some() && !self.fired {
                debug!("Configuration button released early");
            }
            self.pressed_since = None;
            self.fired = false;
            return false;
        }

        let since = *self.pressed_since.get_or_insert(now);
        if !self.fired && elapsed(now, since) >= self.hold_ms {
            self.fired = true;
            info!(hold_ms = self.hold_ms, "Configuration button held");
            return true;
        }
        false
    }

    /// True while a press is being timed.
    #[must_use]
    pub fn is_pressed(&self) -> bool {
        self.pressed_since.is_some()
    }
}
