//! # Wi-Fi Driver
//!
//! Control of the wireless interface: joining a network, hosting the
//! configuration access point, scanning, and reading the MAC address.
//!
//! [`NmcliWifi`] drives NetworkManager through `nmcli`; tests mock the
//! [`WifiDriver`] trait.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::WifiError;

/// NetworkManager connection profile used for the access point.
pub const AP_CONNECTION_NAME: &str = "tank-gateway-portal";

/// Upper bound on any single `nmcli` invocation.
const NMCLI_TIMEOUT: Duration = Duration::from_secs(20);

/// One network seen by a scan, as reported by the tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub ssid: String,
    /// Signal quality, 0..=100
    pub quality: u8,
}

/// One network as reported to portal clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub ssid: String,
    pub rssi: i32,
}

/// Wireless interface control.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WifiDriver: Send + Sync {
    /// Start joining `ssid`; returns without waiting for the association.
    async fn begin_join(&self, ssid: &str, password: &str) -> Result<(), WifiError>;

    /// True while the interface is associated and configured.
    async fn is_joined(&self) -> Result<bool, WifiError>;

    /// Host an open access point named `name` at `address`.
    async fn start_access_point(&self, name: &str, address: Ipv4Addr) -> Result<(), WifiError>;

    /// Tear down the access point.
    async fn stop_access_point(&self) -> Result<(), WifiError>;

    /// Scan for nearby networks.
    async fn scan(&self) -> Result<Vec<ScanEntry>, WifiError>;

    /// Hardware address of the interface.
    async fn mac_address(&self) -> Result<[u8; 6], WifiError>;
}

/// Estimated RSSI in dBm from a 0..=100 signal quality.
#[must_use]
pub fn quality_to_rssi(quality: u8) -> i32 {
    i32::from(quality.min(100)) / 2 - 100
}

/// Report scan results: hidden networks dropped, one entry per SSID (the
/// strongest), strongest first.
///
/// # Examples
///
/// ```
/// use tank_gateway::network::wifi::{summarize_scan, ScanEntry};
///
/// let entries = vec![
///     ScanEntry { ssid: "Home".into(), quality: 40 },
///     ScanEntry { ssid: "".into(), quality: 90 },
///     ScanEntry { ssid: "Home".into(), quality: 70 },
///     ScanEntry { ssid: "Cafe".into(), quality: 50 },
/// ];
/// let networks = summarize_scan(entries);
/// assert_eq!(networks.len(), 2);
/// assert_eq!(networks[0].ssid, "Home");
/// assert_eq!(networks[0].rssi, -65);
/// ```
#[must_use]
pub fn summarize_scan(entries: Vec<ScanEntry>) -> Vec<NetworkInfo> {
    let mut strongest: HashMap<String, u8> = HashMap::new();
    for entry in entries {
        if entry.ssid.is_empty() {
            continue;
        }
        let quality = strongest.entry(entry.ssid).or_insert(entry.quality);
        *quality = (*quality).max(entry.quality);
    }

    let mut networks: Vec<NetworkInfo> = strongest
        .into_iter()
        .map(|(ssid, quality)| NetworkInfo {
            ssid,
            rssi: quality_to_rssi(quality),
        })
        .collect();
    networks.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.ssid.cmp(&b.ssid)));
    networks
}

/// Parse `nmcli -t -f SSID,SIGNAL device wifi list` output.
///
/// `nmcli` terse mode escapes `:` and `\` inside fields with a backslash.
#[must_use]
pub fn parse_scan(output: &str) -> Vec<ScanEntry> {
    output
        .lines()
        .filter_map(|line| {
            let (ssid, signal) = line.trim_end().rsplit_once(':')?;
            let quality = signal.trim().parse::<u8>().ok()?;
            Some(ScanEntry {
                ssid: unescape_terse(ssid),
                quality,
            })
        })
        .collect()
}

fn unescape_terse(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse `nmcli -t -f GENERAL.STATE device show <iface>`.
///
/// NetworkManager reports state 100 for a fully connected device.
#[must_use]
pub fn parse_device_state(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("GENERAL.STATE:"))
        .filter_map(|value| value.split_whitespace().next())
        .any(|code| code == "100")
}

/// Parse a colon-separated MAC address such as `b8:27:eb:12:ab:cd`.
pub fn parse_mac(text: &str) -> Result<[u8; 6], WifiError> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in mac.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| WifiError::Command(format!("short MAC address {:?}", text.trim())))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| WifiError::Command(format!("bad MAC address {:?}", text.trim())))?;
    }
    if parts.next().is_some() {
        return Err(WifiError::Command(format!("long MAC address {:?}", text.trim())));
    }
    Ok(mac)
}

/// NetworkManager-backed driver.
#[derive(Debug, Clone)]
pub struct NmcliWifi {
    interface: String,
}

impl NmcliWifi {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    async fn nmcli(&self, args: &[&str]) -> Result<String, WifiError> {
        debug!(args = ?redact(args), "nmcli");

        let child = Command::new("nmcli")
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(NMCLI_TIMEOUT, child)
            .await
            .map_err(|_| WifiError::Command("nmcli timed out".to_string()))?
            .map_err(|e| WifiError::Unavailable(format!("cannot run nmcli: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(WifiError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Hide the argument following `password` in logs.
fn redact<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        out.push(if hide_next { "***" } else { *arg });
        hide_next = *arg == "password";
    }
    out
}

#[async_trait]
impl WifiDriver for NmcliWifi {
    async fn begin_join(&self, ssid: &str, password: &str) -> Result<(), WifiError> {
        self.nmcli(&[
            "--wait", "0", "device", "wifi", "connect", ssid, "password", password, "ifname",
            &self.interface,
        ])
        .await
        .map(|_| ())
    }

    async fn is_joined(&self) -> Result<bool, WifiError> {
        let output = self
            .nmcli(&["-t", "-f", "GENERAL.STATE", "device", "show", &self.interface])
            .await?;
        Ok(parse_device_state(&output))
    }

    async fn start_access_point(&self, name: &str, address: Ipv4Addr) -> Result<(), WifiError> {
        // A stale profile from a previous run is fine to lose
        let _ = self
            .nmcli(&["connection", "delete", AP_CONNECTION_NAME])
            .await;

        let cidr = format!("{}/24", address);
        self.nmcli(&[
            "connection", "add", "type", "wifi", "ifname", &self.interface, "con-name",
            AP_CONNECTION_NAME, "autoconnect", "no", "ssid", name, "mode", "ap",
            "ipv4.method", "shared", "ipv4.addresses", &cidr,
        ])
        .await?;
        self.nmcli(&["connection", "up", AP_CONNECTION_NAME]).await?;

        info!(ssid = %name, address = %address, "Access point up");
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<(), WifiError> {
        self.nmcli(&["connection", "down", AP_CONNECTION_NAME])
            .await
            .map(|_| ())
    }

    async fn scan(&self) -> Result<Vec<ScanEntry>, WifiError> {
        let output = self
            .nmcli(&[
                "-t", "-f", "SSID,SIGNAL", "device", "wifi", "list", "ifname", &self.interface,
                "--rescan", "yes",
            ])
            .await?;
        Ok(parse_scan(&output))
    }

    async fn mac_address(&self) -> Result<[u8; 6], WifiError> {
        let path = format!("/sys/class/net/{}/address", self.interface);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| WifiError::Unavailable(format!("{}: {}", path, e)))?;
        parse_mac(&text)
    }
}
