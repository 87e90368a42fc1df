//! # Configuration Portal
//!
//! Request handling for configuration mode: the UI page, throttled network
//! scans, configuration submissions and live data. Also tracks the two
//! deadlines that end configuration mode: the restart after a successful
//! save and the inactivity timeout.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::http::{HttpRequest, HttpResponse};
use super::page::portal_page;
use super::router::{CaptiveRouter, Route, Router};
use super::wifi::{summarize_scan, NetworkInfo, WifiDriver};
use super::RestartReason;
use crate::config::NetworkConfig;
use crate::error::{StorageError, SubmissionError};
use crate::storage::{CredentialStore, NetworkCredentials};
use crate::telemetry::LiveData;
use crate::timing::{elapsed, interval_elapsed, Millis};

/// Body of `POST /save`. Every field is required; unknown fields are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSubmission {
    pub ssid: String,
    pub password: String,
    pub api_host: String,
    pub api_port: u16,
    pub api_endpoint: String,
    pub api_key: String,
}

/// Parse and check a configuration submission.
///
/// # Errors
///
/// - [`SubmissionError::Malformed`] if the body is not a JSON document with
///   exactly the six expected fields of the expected types
/// - [`SubmissionError::EmptyCredentials`] if the network name or password is empty
///
/// # Examples
///
/// ```
/// use tank_gateway::network::portal::parse_submission;
///
/// let body = br#"{"ssid":"Home","password":"secret99","api_host":"10.0.0.5",
///                 "api_port":80,"api_endpoint":"/tank","api_key":"k"}"#;
/// let credentials = parse_submission(body).unwrap();
/// assert_eq!(credentials.ssid, "Home");
/// assert!(!credentials.configured);
/// ```
pub fn parse_submission(body: &[u8]) -> Result<NetworkCredentials, SubmissionError> {
    let submission: ConfigSubmission =
        serde_json::from_slice(body).map_err(|e| SubmissionError::Malformed(e.to_string()))?;

    if submission.ssid.is_empty() || submission.password.is_empty() {
        return Err(SubmissionError::EmptyCredentials);
    }

    Ok(NetworkCredentials::new(
        submission.ssid,
        submission.password,
        submission.api_host,
        submission.api_port,
        submission.api_endpoint,
        submission.api_key,
    ))
}

/// Reply to `POST /save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveReply {
    pub success: bool,
}

/// Reply to `GET /scan`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReply {
    pub networks: Vec<NetworkInfo>,
}

/// Limits network scans to one per cooldown window and one at a time.
#[derive(Debug, Clone)]
pub struct ScanThrottle {
    cooldown_ms: Millis,
    last_started: Option<Millis>,
    in_flight: bool,
}

impl ScanThrottle {
    pub fn new(cooldown_ms: Millis) -> Self {
        Self {
            cooldown_ms,
            last_started: None,
            in_flight: false,
        }
    }

    /// Claim a scan slot at `now`. False while a scan runs or within the
    /// cooldown of the previous one.
    pub fn try_begin(&mut self, now: Millis) -> bool {
        if self.in_flight {
            return false;
        }
        if let Some(last) = self.last_started {
            if !interval_elapsed(now, last, self.cooldown_ms) {
                return false;
            }
        }
        self.last_started = Some(now);
        self.in_flight = true;
        true
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// Request handler and deadline tracker for one configuration-mode session.
#[derive(Debug)]
pub struct ConfigPortal {
    ap_name: String,
    page: String,
    router: CaptiveRouter,
    last_activity: Millis,
    timeout_ms: Millis,
    restart_delay_ms: Millis,
    restart_at: Option<Millis>,
    throttle: ScanThrottle,
}

impl ConfigPortal {
    /// Start a session at `now`.
    pub fn new(ap_name: impl Into<String>, now: Millis, config: &NetworkConfig) -> Self {
        let ap_name = ap_name.into();
        Self {
            page: portal_page(&ap_name),
            ap_name,
            router: CaptiveRouter,
            last_activity: now,
            timeout_ms: config.portal_timeout_ms,
            restart_delay_ms: config.restart_delay_ms,
            restart_at: None,
            throttle: ScanThrottle::new(config.scan_cooldown_ms),
        }
    }

    pub fn ap_name(&self) -> &str {
        &self.ap_name
    }

    /// True once a save succeeded and the restart is scheduled.
    pub fn restart_pending(&self) -> bool {
        self.restart_at.is_some()
    }

    /// Answer one request received at `now`.
    pub async fn handle<W: WifiDriver + ?Sized>(
        &mut self,
        request: &HttpRequest,
        now: Millis,
        wifi: &W,
        store: &CredentialStore,
        live: LiveData,
    ) -> HttpResponse {
        self.last_activity = now;
        let route = self.router.route(request);
        debug!(method = %request.method, path = %request.path, ?route, "Portal request");

        match route {
            Route::Scan => self.scan(now, wifi).await,
            Route::Save => self.save(&request.body, now, store),
            Route::Data => HttpResponse::json(200, &live),
            Route::Portal | Route::Probe | Route::StatusPage | Route::NotFound => {
                HttpResponse::html(self.page.clone())
            }
        }
    }

    async fn scan<W: WifiDriver + ?Sized>(&mut self, now: Millis, wifi: &W) -> HttpResponse {
        let networks = if self.throttle.try_begin(now) {
            let result = wifi.scan().await;
            self.throttle.finish();
            match result {
                Ok(entries) => {
                    let networks = summarize_scan(entries);
                    info!(count = networks.len(), "Network scan complete");
                    networks
                }
                Err(e) => {
                    warn!(error = %e, "Network scan failed");
                    Vec::new()
                }
            }
        } else {
            debug!("Scan throttled");
            Vec::new()
        };
        HttpResponse::json(200, &ScanReply { networks })
    }

    fn save(&mut self, body: &[u8], now: Millis, store: &CredentialStore) -> HttpResponse {
        let candidate = match parse_submission(body) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "Configuration submission rejected");
                return HttpResponse::json(400, &SaveReply { success: false });
            }
        };

        match store.save(&candidate) {
            Ok(()) => {
                self.restart_at = Some(now.saturating_add(self.restart_delay_ms));
                info!(
                    ssid = %candidate.ssid,
                    delay_ms = self.restart_delay_ms,
                    "Configuration accepted; restart scheduled"
                );
                HttpResponse::json(200, &SaveReply { success: true })
            }
            Err(StorageError::Invalid(reason)) => {
                warn!(reason, "Configuration submission rejected");
                HttpResponse::json(400, &SaveReply { success: false })
            }
            Err(e) => {
                warn!(error = %e, "Failed to store configuration");
                HttpResponse::json(500, &SaveReply { success: false })
            }
        }
    }

    /// Restart reason once a deadline has passed.
    pub fn poll_deadlines(&self, now: Millis) -> Option<RestartReason> {
        if let Some(at) = self.restart_at {
            if now >= at {
                return Some(RestartReason::CredentialsSaved);
            }
            return None;
        }
        if elapsed(now, self.last_activity) >= self.timeout_ms {
            info!(idle_ms = elapsed(now, self.last_activity), "Configuration portal timed out");
            return Some(RestartReason::PortalTimeout);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WifiError;
    use crate::network::wifi::{MockWifiDriver, ScanEntry};
    use tempfile::TempDir;

    const VALID: &[u8] = br#"{"ssid":"HomeNet","password":"hunter22","api_host":"10.0.0.5","api_port":8080,"api_endpoint":"/tank/api/tank_update.php","api_key":"key"}"#;

    fn live() -> LiveData {
        LiveData {
            water_level: 150,
            percentage: 75,
            wifi_connected: false,
        }
    }

    fn portal(now: Millis) -> ConfigPortal {
        ConfigPortal::new("TankMonitor-AB12", now, &NetworkConfig::default())
    }

    fn body_json(response: &HttpResponse) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn test_parse_submission_valid() {
        let credentials = parse_submission(VALID).unwrap();
        assert_eq!(credentials.ssid, "HomeNet");
        assert_eq!(credentials.api_port, 8080);
        assert_eq!(credentials.api_key, "key");
    }

    #[test]
    fn test_parse_submission_rejects_empty_password() {
        let body = br#"{"ssid":"HomeNet","password":"","api_host":"h","api_port":80,"api_endpoint":"/","api_key":"k"}"#;
        assert_eq!(parse_submission(body), Err(SubmissionError::EmptyCredentials));
    }

    #[test]
    fn test_parse_submission_rejects_missing_and_extra_fields() {
        let missing = br#"{"ssid":"HomeNet","password":"x","api_host":"h","api_port":80,"api_endpoint":"/"}"#;
        assert!(matches!(parse_submission(missing), Err(SubmissionError::Malformed(_))));

        let extra = br#"{"ssid":"HomeNet","password":"x","api_host":"h","api_port":80,"api_endpoint":"/","api_key":"k","admin":true}"#;
        assert!(matches!(parse_submission(extra), Err(SubmissionError::Malformed(_))));

        let bad_port = br#"{"ssid":"HomeNet","password":"x","api_host":"h","api_port":70000,"api_endpoint":"/","api_key":"k"}"#;
        assert!(matches!(parse_submission(bad_port), Err(SubmissionError::Malformed(_))));

        assert!(matches!(parse_submission(b"ssid=HomeNet"), Err(SubmissionError::Malformed(_))));
    }

    #[test]
    fn test_scan_throttle() {
        let mut throttle = ScanThrottle::new(10_000);
        assert!(throttle.try_begin(0));
        assert!(throttle.is_in_flight());
        assert!(!throttle.try_begin(20_000));
        throttle.finish();
        assert!(!throttle.try_begin(9_999));
        assert!(throttle.try_begin(10_000));
    }

    #[tokio::test]
    async fn test_save_persists_and_schedules_restart() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let wifi = MockWifiDriver::new();
        let mut portal = portal(0);

        let request = HttpRequest::new("POST", "/save", VALID);
        let response = portal.handle(&request, 1_000, &wifi, &store, live()).await;

        assert_eq!(response.status, 200);
        assert_eq!(body_json(&response)["success"], true);
        assert!(store.load().unwrap().configured);
        assert!(portal.restart_pending());
        assert_eq!(portal.poll_deadlines(2_999), None);
        assert_eq!(portal.poll_deadlines(3_000), Some(RestartReason::CredentialsSaved));
    }

    #[tokio::test]
    async fn test_rejected_save_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        store.save(&parse_submission(VALID).unwrap()).unwrap();
        let wifi = MockWifiDriver::new();
        let mut portal = portal(0);

        let body = br#"{"ssid":"Other","password":"","api_host":"h","api_port":80,"api_endpoint":"/","api_key":"k"}"#;
        let response = portal
            .handle(&HttpRequest::new("POST", "/save", body), 10, &wifi, &store, live())
            .await;

        assert_eq!(response.status, 400);
        assert_eq!(body_json(&response)["success"], false);
        assert_eq!(store.load().unwrap().ssid, "HomeNet");
        assert!(!portal.restart_pending());
    }

    #[tokio::test]
    async fn test_scan_reports_networks_then_throttles() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let mut wifi = MockWifiDriver::new();
        wifi.expect_scan().times(1).returning(|| {
            Ok(vec![
                ScanEntry { ssid: "HomeNet".into(), quality: 80 },
                ScanEntry { ssid: "Cafe".into(), quality: 30 },
            ])
        });
        let mut portal = portal(0);
        let request = HttpRequest::new("GET", "/scan", &[]);

        let first = portal.handle(&request, 100, &wifi, &store, live()).await;
        let json = body_json(&first);
        assert_eq!(json["networks"][0]["ssid"], "HomeNet");
        assert_eq!(json["networks"][0]["rssi"], -60);
        assert_eq!(json["networks"].as_array().unwrap().len(), 2);

        let second = portal.handle(&request, 200, &wifi, &store, live()).await;
        assert_eq!(second.status, 200);
        assert!(body_json(&second)["networks"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_returns_empty_list() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let mut wifi = MockWifiDriver::new();
        wifi.expect_scan()
            .returning(|| Err(WifiError::Command("device busy".into())));
        let mut portal = portal(0);

        let response = portal
            .handle(&HttpRequest::new("GET", "/scan", &[]), 0, &wifi, &store, live())
            .await;
        assert!(body_json(&response)["networks"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probe_and_unknown_paths_serve_portal_page() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let wifi = MockWifiDriver::new();
        let mut portal = portal(0);

        for path in ["/", "/generate_204", "/hotspot-detect.html", "/no/such/page"] {
            let response = portal
                .handle(&HttpRequest::new("GET", path, &[]), 0, &wifi, &store, live())
                .await;
            assert_eq!(response.status, 200, "{}", path);
            assert!(String::from_utf8_lossy(&response.body).contains("TankMonitor-AB12"));
        }
    }

    #[tokio::test]
    async fn test_data_endpoint() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let wifi = MockWifiDriver::new();
        let mut portal = portal(0);

        let response = portal
            .handle(&HttpRequest::new("GET", "/data", &[]), 0, &wifi, &store, live())
            .await;
        let json = body_json(&response);
        assert_eq!(json["water_level"], 150);
        assert_eq!(json["percentage"], 75);
        assert_eq!(json["wifi_connected"], false);
    }

    #[tokio::test]
    async fn test_inactivity_counts_from_last_request() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let wifi = MockWifiDriver::new();
        let mut portal = portal(1_000);
        let timeout = NetworkConfig::default().portal_timeout_ms;

        assert_eq!(portal.poll_deadlines(1_000 + timeout - 1), None);

        portal
            .handle(&HttpRequest::new("GET", "/", &[]), 5_000, &wifi, &store, live())
            .await;
        assert_eq!(portal.poll_deadlines(1_000 + timeout), None);
        assert_eq!(
            portal.poll_deadlines(5_000 + timeout),
            Some(RestartReason::PortalTimeout)
        );
    }
}
