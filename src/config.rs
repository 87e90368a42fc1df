//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every field has a default, so an empty file (or a file with only the
//! sections you want to change) is a valid configuration.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub indicator: IndicatorConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Radio modem (UART) configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    #[serde(default = "default_radio_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_frequency_hz")]
    pub frequency_hz: u32,

    #[serde(default = "default_spreading_factor")]
    pub spreading_factor: u8,

    #[serde(default = "default_bandwidth")]
    pub bandwidth: u8,

    #[serde(default = "default_coding_rate")]
    pub coding_rate: u8,

    #[serde(default = "default_preamble_length")]
    pub preamble_length: u16,

    #[serde(default = "default_tx_power_dbm")]
    pub tx_power_dbm: u8,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_rearm_interval_ms")]
    pub rearm_interval_ms: u64,
}

/// Connectivity configuration (client mode and configuration portal)
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_connect_poll_ms")]
    pub connect_poll_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: u32,

    #[serde(default = "default_ap_name_prefix")]
    pub ap_name_prefix: String,

    #[serde(default = "default_portal_address")]
    pub portal_address: Ipv4Addr,

    #[serde(default = "default_portal_http_port")]
    pub portal_http_port: u16,

    #[serde(default = "default_dns_port")]
    pub dns_port: u16,

    #[serde(default = "default_scan_cooldown_ms")]
    pub scan_cooldown_ms: u64,

    #[serde(default = "default_portal_timeout_ms")]
    pub portal_timeout_ms: u64,

    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Port of the client-mode status server (0 disables it).
    #[serde(default = "default_status_http_port")]
    pub status_http_port: u16,
}

/// Telemetry transform configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: u16,

    #[serde(default = "default_tank_id")]
    pub tank_id: u32,

    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

/// Backend relay configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Boot-time trigger configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BootConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_rapid_cycle_window_ms")]
    pub rapid_cycle_window_ms: u64,

    #[serde(default = "default_rapid_cycle_count")]
    pub rapid_cycle_count: u32,

    /// GPIO value file of the optional configuration button.
    #[serde(default)]
    pub button_path: Option<PathBuf>,

    #[serde(default = "default_button_hold_ms")]
    pub button_hold_ms: u64,
}

/// Status indicator configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndicatorConfig {
    /// LED class directory (`/sys/class/leds/<name>`); log-only when absent.
    #[serde(default)]
    pub led_path: Option<PathBuf>,
}

/// Control loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SystemConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    #[serde(default)]
    pub reboot_command: Option<String>,
}

/// Log sink configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; stdout only when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_radio_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { 115200 }
fn default_frequency_hz() -> u32 { 865_000_000 }
fn default_spreading_factor() -> u8 { 7 }
fn default_bandwidth() -> u8 { 1 }
fn default_coding_rate() -> u8 { 1 }
fn default_preamble_length() -> u16 { 8 }
fn default_tx_power_dbm() -> u8 { 14 }
fn default_command_timeout_ms() -> u64 { 1000 }
fn default_rearm_interval_ms() -> u64 { 5000 }

fn default_interface() -> String { "wlan0".to_string() }
fn default_connect_timeout_ms() -> u64 { 30_000 }
fn default_connect_poll_ms() -> u64 { 500 }
fn default_reconnect_interval_ms() -> u64 { 30_000 }
fn default_retry_threshold() -> u32 { 3 }
fn default_ap_name_prefix() -> String { "TankMonitor".to_string() }
fn default_portal_address() -> Ipv4Addr { Ipv4Addr::new(10, 42, 0, 1) }
fn default_portal_http_port() -> u16 { 80 }
fn default_dns_port() -> u16 { 53 }
fn default_scan_cooldown_ms() -> u64 { 10_000 }
fn default_portal_timeout_ms() -> u64 { 600_000 }
fn default_restart_delay_ms() -> u64 { 2000 }
fn default_status_http_port() -> u16 { 8080 }

fn default_max_depth() -> u16 { 200 }
fn default_tank_id() -> u32 { 1 }
fn default_stale_after_ms() -> u64 { 60_000 }

fn default_probe_timeout_ms() -> u64 { 5000 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 5000 }

fn default_state_dir() -> PathBuf { PathBuf::from("/var/lib/tank-gateway") }
fn default_rapid_cycle_window_ms() -> u64 { 10_000 }
fn default_rapid_cycle_count() -> u32 { 3 }
fn default_button_hold_ms() -> u64 { 5000 }

fn default_tick_interval_ms() -> u64 { 10 }
fn default_status_interval_ms() -> u64 { 5000 }

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: default_radio_port(),
            baud_rate: default_baud_rate(),
            frequency_hz: default_frequency_hz(),
            spreading_factor: default_spreading_factor(),
            bandwidth: default_bandwidth(),
            coding_rate: default_coding_rate(),
            preamble_length: default_preamble_length(),
            tx_power_dbm: default_tx_power_dbm(),
            command_timeout_ms: default_command_timeout_ms(),
            rearm_interval_ms: default_rearm_interval_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_poll_ms: default_connect_poll_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            retry_threshold: default_retry_threshold(),
            ap_name_prefix: default_ap_name_prefix(),
            portal_address: default_portal_address(),
            portal_http_port: default_portal_http_port(),
            dns_port: default_dns_port(),
            scan_cooldown_ms: default_scan_cooldown_ms(),
            portal_timeout_ms: default_portal_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            status_http_port: default_status_http_port(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            tank_id: default_tank_id(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            rapid_cycle_window_ms: default_rapid_cycle_window_ms(),
            rapid_cycle_count: default_rapid_cycle_count(),
            button_path: None,
            button_hold_ms: default_button_hold_ms(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            status_interval_ms: default_status_interval_ms(),
            reboot_command: None,
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> GatewayError {
    GatewayError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tank_gateway::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.radio.port.is_empty() {
            return Err(invalid("radio port cannot be empty"));
        }

        if ![9600, 19200, 38400, 57600, 115200].contains(&self.radio.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 19200, 38400, 57600, 115200",
            ));
        }

        if !(150_000_000..=960_000_000).contains(&self.radio.frequency_hz) {
            return Err(invalid("frequency_hz must be between 150000000 and 960000000"));
        }

        if !(5..=12).contains(&self.radio.spreading_factor) {
            return Err(invalid("spreading_factor must be between 5 and 12"));
        }

        if self.radio.bandwidth > 9 {
            return Err(invalid("bandwidth must be between 0 and 9"));
        }

        if self.radio.coding_rate > 3 {
            return Err(invalid("coding_rate must be between 0 and 3"));
        }

        if self.radio.tx_power_dbm > 22 {
            return Err(invalid("tx_power_dbm must be between 0 and 22"));
        }

        for (name, value, max) in [
            ("command_timeout_ms", self.radio.command_timeout_ms, 10_000),
            ("rearm_interval_ms", self.radio.rearm_interval_ms, 600_000),
            ("connect_timeout_ms", self.network.connect_timeout_ms, 120_000),
            ("connect_poll_ms", self.network.connect_poll_ms, 10_000),
            ("reconnect_interval_ms", self.network.reconnect_interval_ms, 3_600_000),
            ("portal_timeout_ms", self.network.portal_timeout_ms, 86_400_000),
            ("restart_delay_ms", self.network.restart_delay_ms, 60_000),
            ("stale_after_ms", self.telemetry.stale_after_ms, 86_400_000),
            ("probe_timeout_ms", self.backend.probe_timeout_ms, 60_000),
            ("request_timeout_ms", self.backend.request_timeout_ms, 60_000),
            ("rapid_cycle_window_ms", self.boot.rapid_cycle_window_ms, 600_000),
            ("button_hold_ms", self.boot.button_hold_ms, 60_000),
            ("tick_interval_ms", self.system.tick_interval_ms, 1000),
            ("status_interval_ms", self.system.status_interval_ms, 3_600_000),
        ] {
            if value == 0 || value > max {
                return Err(invalid(format!("{} must be between 1 and {}", name, max)));
            }
        }

        if self.backend.retry_delay_ms > 60_000 {
            return Err(invalid("retry_delay_ms must be at most 60000"));
        }

        if self.network.connect_poll_ms > self.network.connect_timeout_ms {
            return Err(invalid("connect_poll_ms must not exceed connect_timeout_ms"));
        }

        if self.network.interface.is_empty() {
            return Err(invalid("network interface cannot be empty"));
        }

        if self.network.ap_name_prefix.is_empty() || self.network.ap_name_prefix.len() > 26 {
            return Err(invalid("ap_name_prefix must be 1 to 26 characters"));
        }

        if self.network.retry_threshold == 0 {
            return Err(invalid("retry_threshold must be greater than 0"));
        }

        if self.network.portal_http_port == 0 || self.network.dns_port == 0 {
            return Err(invalid("portal_http_port and dns_port must be non-zero"));
        }

        if self.telemetry.max_depth == 0 {
            return Err(invalid("max_depth must be greater than 0"));
        }

        if self.backend.max_attempts == 0 || self.backend.max_attempts > 10 {
            return Err(invalid("max_attempts must be between 1 and 10"));
        }

        if self.boot.rapid_cycle_count < 2 {
            return Err(invalid("rapid_cycle_count must be at least 2"));
        }

        if self.boot.state_dir.as_os_str().is_empty() {
            return Err(invalid("state_dir cannot be empty"));
        }

        Ok(())
    }
}
