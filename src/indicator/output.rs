//! Output sinks for the status indicator.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// A single dimmable output, 0 (off) to 255 (fully on).
pub trait IndicatorOutput {
    fn set_level(&mut self, level: u8);
}

/// Linux LED class device (`/sys/class/leds/<name>`).
///
/// Levels are scaled to the device's `max_brightness`. Write failures are
/// logged once and then ignored; a missing LED never stops the gateway.
#[derive(Debug)]
pub struct SysfsLed {
    brightness_path: PathBuf,
    max_brightness: u32,
    last_written: Option<u32>,
    failed: bool,
}

impl SysfsLed {
    /// Open the LED class directory at `dir`.
    ///
    /// Falls back to a `max_brightness` of 255 if the attribute can't be read.
    pub fn new(dir: &Path) -> Self {
        let max_brightness = fs::read_to_string(dir.join("max_brightness"))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|&max| max > 0)
            .unwrap_or(255);

        debug!(path = %dir.display(), max_brightness, "Using sysfs LED");

        Self {
            brightness_path: dir.join("brightness"),
            max_brightness,
            last_written: None,
            failed: false,
        }
    }

    fn scale(&self, level: u8) -> u32 {
        (u32::from(level) * self.max_brightness + 127) / 255
    }
}

impl IndicatorOutput for SysfsLed {
    fn set_level(&mut self, level: u8) {
        let value = self.scale(level);
        if self.last_written == Some(value) {
            return;
        }

        match fs::write(&self.brightness_path, value.to_string()) {
            Ok(()) => {
                self.last_written = Some(value);
                self.failed = false;
            }
            Err(e) => {
                if !self.failed {
                    warn!(
                        error = %e,
                        path = %self.brightness_path.display(),
                        "Failed to drive status LED"
                    );
                }
                self.failed = true;
            }
        }
    }
}

/// Output used when no LED is configured; levels only appear in trace logs.
#[derive(Debug, Default)]
pub struct NullOutput;

impl IndicatorOutput for NullOutput {
    fn set_level(&mut self, level: u8) {
        trace!(level, "Indicator level");
    }
}

/// Either a real LED or the null sink, picked at startup.
#[derive(Debug)]
pub enum AnyOutput {
    Led(SysfsLed),
    Null(NullOutput),
}

impl AnyOutput {
    /// Build the sink for an optional LED directory.
    pub fn from_path(path: Option<&Path>) -> Self {
        match path {
            Some(dir) => AnyOutput::Led(SysfsLed::new(dir)),
            None => AnyOutput::Null(NullOutput),
        }
    }
}

impl IndicatorOutput for AnyOutput {
    fn set_level(&mut self, level: u8) {
        match self {
            AnyOutput::Led(led) => led.set_level(level),
            AnyOutput::Null(null) => null.set_level(level),
        }
    }
}

/// Records every level written, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingOutput {
    writes: Vec<u8>,
}

#[cfg(test)]
impl RecordingOutput {
    pub fn writes(&self) -> &[u8] {
        &self.writes
    }

    pub fn last(&self) -> Option<u8> {
        self.writes.last().copied()
    }
}

#[cfg(test)]
impl IndicatorOutput for RecordingOutput {
    fn set_level(&mut self, level: u8) {
        self.writes.push(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sysfs_led_scales_to_max_brightness() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("max_brightness"), "1\n").unwrap();
        fs::write(dir.path().join("brightness"), "0").unwrap();

        let mut led = SysfsLed::new(dir.path());
        led.set_level(255);
        assert_eq!(fs::read_to_string(dir.path().join("brightness")).unwrap(), "1");
        led.set_level(0);
        assert_eq!(fs::read_to_string(dir.path().join("brightness")).unwrap(), "0");
    }

    #[test]
    fn test_sysfs_led_defaults_max_brightness() {
        let dir = TempDir::new().unwrap();
        let mut led = SysfsLed::new(dir.path());
        led.set_level(128);
        assert_eq!(fs::read_to_string(dir.path().join("brightness")).unwrap(), "128");
    }

    #[test]
    fn test_sysfs_led_missing_device_does_not_panic() {
        let mut led = SysfsLed::new(Path::new("/nonexistent/leds/status"));
        led.set_level(255);
        led.set_level(0);
        assert!(led.failed);
    }

    #[test]
    fn test_any_output_without_path_is_null() {
        assert!(matches!(AnyOutput::from_path(None), AnyOutput::Null(_)));
    }
}
