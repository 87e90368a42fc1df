//! # Network Module
//!
//! The Connectivity Manager: decides between joining the configured network
//! (client mode) and hosting an access point with a captive configuration
//! portal (configuration mode).
//!
//! This module handles:
//! - Bounded connection attempts that keep draining radio input while waiting
//! - The connection retry counter and clearing the boot-cycle record on success
//! - Bringing up the access point, the catch-all DNS responder and the portal
//! - Pumping configuration mode once per control-loop tick
//! - The client-mode status server

pub mod dns;
pub mod http;
pub mod page;
pub mod portal;
pub mod router;
pub mod wifi;

use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{GatewayError, HttpError, Result, WifiError};
use crate::storage::boot_record::BootRecordStore;
use crate::storage::CredentialStore;
use crate::telemetry::{LiveData, RadioDrain};
use crate::timing::{elapsed, Clock, Millis};
use crate::trigger::RetryCounter;
use dns::CaptiveDns;
use http::{error_response, HttpConnection, HttpResponse, HttpServer};
use portal::ConfigPortal;
use router::{ClientRouter, Route, Router};
use wifi::WifiDriver;

/// Why the node is about to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    CredentialsSaved,
    PortalTimeout,
    OperatorRequest,
    CredentialsCleared,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RestartReason::CredentialsSaved => "new configuration saved",
            RestartReason::PortalTimeout => "configuration portal timed out",
            RestartReason::OperatorRequest => "operator requested reboot",
            RestartReason::CredentialsCleared => "configuration cleared",
        };
        f.write_str(text)
    }
}

/// Result of one client-mode connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    TimedOut,
    Failed(WifiError),
}

/// Access point name: `<prefix>-XXXX` from the last two MAC bytes.
///
/// # Examples
///
/// ```
/// use tank_gateway::network::ap_name;
///
/// assert_eq!(ap_name("TankMonitor", &[0xb8, 0x27, 0xeb, 0x12, 0xab, 0x0c]), "TankMonitor-AB0C");
/// ```
#[must_use]
pub fn ap_name(prefix: &str, mac: &[u8; 6]) -> String {
    format!("{}-{:02X}{:02X}", prefix, mac[4], mac[5])
}

struct ConfigModeRuntime {
    portal: ConfigPortal,
    dns: Option<CaptiveDns>,
    http: HttpServer,
}

/// Owner of the Wi-Fi interface and everything served over it.
pub struct ConnectivityManager<W: WifiDriver> {
    wifi: W,
    config: NetworkConfig,
    retries: RetryCounter,
    boot_records: BootRecordStore,
    connected: bool,
    config_mode: Option<ConfigModeRuntime>,
    status_server: Option<HttpServer>,
}

impl<W: WifiDriver> ConnectivityManager<W> {
    pub fn new(wifi: W, config: &NetworkConfig, boot_records: BootRecordStore) -> Self {
        Self {
            wifi,
            retries: RetryCounter::new(config.retry_threshold),
            config: config.clone(),
            boot_records,
            connected: false,
            config_mode: None,
            status_server: None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn is_in_config_mode(&self) -> bool {
        self.config_mode.is_some()
    }

    #[must_use]
    pub fn retries(&self) -> &RetryCounter {
        &self.retries
    }

    pub fn reset_retries(&mut self) {
        self.retries.reset();
    }

    /// Name of the access point while in configuration mode.
    pub fn ap_name(&self) -> Option<&str> {
        self.config_mode.as_ref().map(|rt| rt.portal.ap_name())
    }

    /// Join `ssid`, waiting at most `timeout_ms`.
    ///
    /// Buffered radio input is drained through `drain` between polls so no
    /// frame waits for the attempt to finish.
    ///
    /// # Returns
    ///
    /// - [`ConnectOutcome::Connected`]: retry counter reset, boot-cycle record cleared
    /// - [`ConnectOutcome::TimedOut`] / [`ConnectOutcome::Failed`]: retry counter incremented
    pub async fn start_client_mode<D: RadioDrain + ?Sized>(
        &mut self,
        ssid: &str,
        secret: &str,
        timeout_ms: Millis,
        clock: &dyn Clock,
        drain: &mut D,
    ) -> ConnectOutcome {
        let started = clock.now_ms();
        self.connected = false;
        info!(ssid = %ssid, timeout_ms, "Connecting to network");

        if let Err(e) = self.wifi.begin_join(ssid, secret).await {
            let attempts = self.retries.record_failure();
            warn!(error = %e, attempts, "Connection attempt failed");
            return ConnectOutcome::Failed(e);
        }

        let poll = Duration::from_millis(self.config.connect_poll_ms);
        loop {
            match self.wifi.is_joined().await {
                Ok(true) => {
                    self.on_connected(elapsed(clock.now_ms(), started));
                    return ConnectOutcome::Connected;
                }
                Ok(false) => {}
                Err(e) => debug!(error = %e, "Link state query failed"),
            }

            let now = clock.now_ms();
            if elapsed(now, started) >= timeout_ms {
                let attempts = self.retries.record_failure();
                warn!(ssid = %ssid, attempts, "Connection attempt timed out");
                return ConnectOutcome::TimedOut;
            }

            let frames = drain.drain_offline(now).await;
            if frames > 0 {
                debug!(frames, "Processed radio frames while connecting");
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn on_connected(&mut self, took_ms: Millis) {
        self.connected = true;
        self.retries.reset();
        if let Err(e) = self.boot_records.clear() {
            warn!(error = %e, "Failed to clear boot-cycle record");
        }
        info!(took_ms, "Connected");
    }

    /// Re-check the link; returns false if it dropped since the last check.
    pub async fn verify_link(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        match self.wifi.is_joined().await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Network connection lost");
                self.connected = false;
                self.status_server = None;
                false
            }
            Err(e) => {
                // Tooling hiccups are not link loss
                debug!(error = %e, "Link state query failed");
                true
            }
        }
    }

    /// Bring up the access point, DNS responder and portal.
    ///
    /// A DNS bind failure only disables captive redirection; the portal
    /// stays reachable at the access point address.
    ///
    /// # Errors
    ///
    /// Returns error if the access point cannot be started or the portal
    /// HTTP port cannot be bound.
    pub async fn start_config_mode(&mut self, now: Millis) -> Result<String> {
        let mac = match self.wifi.mac_address().await {
            Ok(mac) => mac,
            Err(e) => {
                warn!(error = %e, "Cannot read MAC address; using a generic AP name");
                [0; 6]
            }
        };
        let name = ap_name(&self.config.ap_name_prefix, &mac);

        self.connected = false;
        self.status_server = None;
        self.config_mode = None;

        let address = self.config.portal_address;
        self.wifi.start_access_point(&name, address).await?;

        let dns = match CaptiveDns::bind(self.config.dns_port, address).await {
            Ok(dns) => Some(dns),
            Err(e) => {
                warn!(port = self.config.dns_port, error = %e, "Captive DNS unavailable");
                None
            }
        };
        let http = HttpServer::bind(self.config.portal_http_port)
            .await
            .map_err(GatewayError::Io)?;

        info!(ap = %name, address = %address, "Configuration mode active");
        self.config_mode = Some(ConfigModeRuntime {
            portal: ConfigPortal::new(name.clone(), now, &self.config),
            dns,
            http,
        });
        Ok(name)
    }

    /// Advance configuration mode: answer DNS queries, serve at most one
    /// HTTP client, check the deadlines.
    ///
    /// Returns the restart reason once configuration mode is over.
    pub async fn pump_config_mode(
        &mut self,
        now: Millis,
        store: &CredentialStore,
        live: LiveData,
    ) -> Option<RestartReason> {
        let runtime = self.config_mode.as_mut()?;

        if let Some(dns) = &runtime.dns {
            dns.pump();
        }

        if let Some(mut connection) = runtime.http.try_accept().await {
            match connection.read_request().await {
                Ok(request) => {
                    let response = runtime
                        .portal
                        .handle(&request, now, &self.wifi, store, live)
                        .await;
                    connection.respond(&response).await;
                }
                Err(e) => reject(connection, &e).await,
            }
        }

        runtime.portal.poll_deadlines(now)
    }

    /// Tear down the access point before a restart.
    pub async fn stop_config_mode(&mut self) {
        if self.config_mode.take().is_some() {
            if let Err(e) = self.wifi.stop_access_point().await {
                warn!(error = %e, "Failed to stop access point");
            }
        }
    }

    /// Start the client-mode status server if enabled and not yet running.
    pub async fn ensure_status_server(&mut self) {
        let port = self.config.status_http_port;
        if port == 0 || self.status_server.is_some() || !self.connected {
            return;
        }
        match HttpServer::bind(port).await {
            Ok(server) => self.status_server = Some(server),
            Err(e) => warn!(port, error = %e, "Status server unavailable"),
        }
    }

    /// Serve at most one status-server client.
    pub async fn pump_status_server(&mut self, live: LiveData, fresh: bool) {
        let Some(server) = &self.status_server else {
            return;
        };
        let Some(mut connection) = server.try_accept().await else {
            return;
        };

        let request = match connection.read_request().await {
            Ok(request) => request,
            Err(e) => return reject(connection, &e).await,
        };
        let response = match ClientRouter.route(&request) {
            Route::StatusPage => HttpResponse::html(page::status_page(
                &self.config.ap_name_prefix,
                &live,
                fresh,
            )),
            Route::Data => HttpResponse::json(200, &live),
            _ => HttpResponse::not_found(),
        };
        connection.respond(&response).await;
    }
}

async fn reject(connection: HttpConnection, err: &HttpError) {
    debug!(peer = %connection.peer(), error = %err, "Unreadable HTTP request");
    if let Some(response) = error_response(err) {
        connection.respond(&response).await;
    }
}
