//! # Control Loop
//!
//! [`Gateway`] owns every piece of node state and drives the components in
//! a fixed order once per tick:
//!
//! 1. Advance the status indicator
//! 2. Take at most one operator command
//! 3. Evaluate the configuration-mode triggers
//! 4. In configuration mode: pump the portal and stop there
//! 5. Staleness check
//! 6. Periodic reconnection check
//! 7. Drain and process buffered radio input, relaying when connected
//! 8. Periodic liveness probe and defensive re-arm
//! 9. Client-mode status server
//! 10. Periodic status summary
//!
//! Nothing else mutates node state, so no locking is needed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{BackendConfig, Config};
use crate::console::{ConsoleCommand, HELP_TEXT};
use crate::error::RelayError;
use crate::indicator::{IndicatorOutput, StatusIndicator, SystemState};
use crate::network::wifi::WifiDriver;
use crate::network::{ConnectOutcome, ConnectivityManager, RestartReason};
use crate::serial::ModemLink;
use crate::storage::boot_record::BootRecordStore;
use crate::storage::{CredentialStore, NetworkCredentials};
use crate::telemetry::relay::{Backend, HttpBackend, RetryPolicy};
use crate::telemetry::{FrameOutcome, RadioDrain, RelayTarget, TelemetryPipeline, TelemetryStats};
use crate::timing::{elapsed, interval_elapsed, Clock, Millis};
use crate::trigger::button::{ButtonHoldTracker, ButtonInput};
use crate::trigger::{detect_rapid_cycle, evaluate, TriggerInputs, TriggerReason};

/// Why [`Gateway::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The node must restart.
    Restart(RestartReason),
    /// Interrupted (Ctrl+C).
    Interrupted,
}

/// Builds the backend client for a set of credentials.
pub type BackendFactory =
    Box<dyn Fn(&NetworkCredentials, &BackendConfig) -> Result<Box<dyn Backend>, RelayError>>;

fn http_backend(
    credentials: &NetworkCredentials,
    config: &BackendConfig,
) -> Result<Box<dyn Backend>, RelayError> {
    Ok(Box::new(HttpBackend::new(credentials, config)?))
}

/// Drains radio input and keeps the indicator animated while a connection
/// attempt is waiting.
struct ConnectingDrain<'a, L: ModemLink, O: IndicatorOutput> {
    pipeline: &'a mut TelemetryPipeline<L>,
    indicator: &'a mut StatusIndicator<O>,
}

#[async_trait]
impl<'a, L: ModemLink, O: IndicatorOutput + Send> RadioDrain for ConnectingDrain<'a, L, O> {
    async fn drain_offline(&mut self, now: Millis) -> usize {
        self.indicator.tick(now);
        self.pipeline.drain_offline(now).await
    }
}

/// The node: every component plus the control loop driving them.
pub struct Gateway<L: ModemLink, W: WifiDriver, O: IndicatorOutput + Send, C: Clock> {
    config: Config,
    clock: C,
    pipeline: TelemetryPipeline<L>,
    connectivity: ConnectivityManager<W>,
    indicator: StatusIndicator<O>,
    store: CredentialStore,
    credentials: Option<NetworkCredentials>,
    backend: Option<Box<dyn Backend>>,
    backend_factory: BackendFactory,
    retry_policy: RetryPolicy,
    commands: Option<mpsc::Receiver<ConsoleCommand>>,
    button: Option<Box<dyn ButtonInput>>,
    hold: ButtonHoldTracker,
    operator_request: bool,
    /// Configuration mode failed to start; retry for this reason at this time.
    config_retry: Option<(TriggerReason, Millis)>,
    started_at: Millis,
    last_reconnect_check: Millis,
    last_rearm: Millis,
    last_status: Millis,
}

impl<L, W, O, C> Gateway<L, W, O, C>
where
    L: ModemLink,
    W: WifiDriver,
    O: IndicatorOutput + Send,
    C: Clock,
{
    pub fn new(config: Config, clock: C, link: L, wifi: W, output: O) -> Self {
        let state_dir = config.boot.state_dir.clone();
        let now = clock.now_ms();
        Self {
            pipeline: TelemetryPipeline::new(link, &config.telemetry),
            connectivity: ConnectivityManager::new(
                wifi,
                &config.network,
                BootRecordStore::in_dir(&state_dir),
            ),
            indicator: StatusIndicator::new(output),
            store: CredentialStore::in_dir(&state_dir),
            credentials: None,
            backend: None,
            backend_factory: Box::new(http_backend),
            retry_policy: RetryPolicy::from(&config.backend),
            commands: None,
            button: None,
            hold: ButtonHoldTracker::new(config.boot.button_hold_ms),
            operator_request: false,
            config_retry: None,
            started_at: now,
            last_reconnect_check: now,
            last_rearm: now,
            last_status: now,
            clock,
            config,
        }
    }

    /// Take operator commands from `commands`.
    pub fn with_commands(mut self, commands: mpsc::Receiver<ConsoleCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Watch a physical configuration button.
    pub fn with_button(mut self, button: Box<dyn ButtonInput>) -> Self {
        self.button = Some(button);
        self
    }

    /// Replace the HTTP backend client.
    pub fn with_backend_factory(mut self, factory: BackendFactory) -> Self {
        self.backend_factory = factory;
        self
    }

    pub fn pipeline(&self) -> &TelemetryPipeline<L> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut TelemetryPipeline<L> {
        &mut self.pipeline
    }

    pub fn connectivity(&self) -> &ConnectivityManager<W> {
        &self.connectivity
    }

    pub fn indicator(&self) -> &StatusIndicator<O> {
        &self.indicator
    }

    pub fn credentials(&self) -> Option<&NetworkCredentials> {
        self.credentials.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> TelemetryStats {
        self.pipeline.stats()
    }

    /// Start-up decision: load credentials, register this boot, then either
    /// enter configuration mode or join the saved network.
    pub async fn boot(&mut self, wall_clock: DateTime<Utc>) {
        self.credentials = self.store.load();

        let rapid_cycle = detect_rapid_cycle(
            &BootRecordStore::in_dir(&self.config.boot.state_dir),
            wall_clock,
            self.config.boot.rapid_cycle_window_ms,
            self.config.boot.rapid_cycle_count,
        );

        let reason = evaluate(&TriggerInputs {
            credentials_configured: self.credentials.is_some(),
            rapid_cycle,
            ..TriggerInputs::default()
        });

        if reason.forces_config_mode() {
            let now = self.clock.now_ms();
            self.enter_config_mode(reason, now).await;
        } else {
            self.connect().await;
        }

        let now = self.clock.now_ms();
        self.last_reconnect_check = now;
        self.last_rearm = now;
        self.last_status = now;
    }

    /// Tick until a restart is needed or `shutdown` completes.
    pub async fn run<F>(&mut self, shutdown: F) -> Shutdown
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(Duration::from_millis(self.config.system.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(shutdown) = self.step().await {
                        return shutdown;
                    }
                }
                _ = &mut shutdown => {
                    info!("Received Ctrl+C, shutting down...");
                    self.connectivity.stop_config_mode().await;
                    return Shutdown::Interrupted;
                }
            }
        }
    }

    /// One control-loop iteration.
    pub async fn step(&mut self) -> Option<Shutdown> {
        let now = self.clock.now_ms();
        self.indicator.tick(now);

        if let Some(command) = self.next_command() {
            if let Some(shutdown) = self.handle_command(command, now).await {
                return Some(shutdown);
            }
        }

        let button_held = self.sample_button(now);
        if !self.connectivity.is_in_config_mode() {
            self.evaluate_triggers(now, button_held).await;
        }

        if self.connectivity.is_in_config_mode() {
            let live = self.pipeline.live_data(false);
            let reason = self
                .connectivity
                .pump_config_mode(now, &self.store, live)
                .await?;
            self.connectivity.stop_config_mode().await;
            return Some(Shutdown::Restart(reason));
        }

        self.pipeline.check_staleness(now);

        if interval_elapsed(now, self.last_reconnect_check, self.config.network.reconnect_interval_ms) {
            self.last_reconnect_check = now;
            if self.connectivity.verify_link().await {
                if self.backend.is_none() {
                    self.build_backend();
                }
            } else if self.credentials.is_some() {
                self.connect().await;
            }
        }

        // A connection attempt may have taken a while
        let now = self.clock.now_ms();
        self.process_radio(now).await;

        if interval_elapsed(now, self.last_rearm, self.config.radio.rearm_interval_ms) {
            self.last_rearm = now;
            if let Err(e) = self.pipeline.probe_and_rearm().await {
                debug!(error = %e, "Defensive re-arm failed");
            }
        }

        if self.connectivity.is_connected() {
            let fresh = self.pipeline.measurement().is_some_and(|m| m.fresh);
            let live = self.pipeline.live_data(true);
            self.connectivity.pump_status_server(live, fresh).await;
        }

        if interval_elapsed(now, self.last_status, self.config.system.status_interval_ms) {
            self.last_status = now;
            self.log_status(now);
        }

        None
    }

    fn next_command(&mut self) -> Option<ConsoleCommand> {
        let commands = self.commands.as_mut()?;
        match commands.try_recv() {
            Ok(command) => Some(command),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("Console closed");
                self.commands = None;
                None
            }
        }
    }

    async fn handle_command(&mut self, command: ConsoleCommand, now: Millis) -> Option<Shutdown> {
        info!(%command, "Operator command");
        match command {
            ConsoleCommand::EnterConfig => {
                if self.connectivity.is_in_config_mode() {
                    info!("Already in configuration mode");
                } else {
                    self.operator_request = true;
                }
                None
            }
            ConsoleCommand::ResetCredentials => {
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to clear configuration");
                }
                self.credentials = None;
                self.connectivity.stop_config_mode().await;
                Some(Shutdown::Restart(RestartReason::CredentialsCleared))
            }
            ConsoleCommand::Status => {
                self.log_status(now);
                None
            }
            ConsoleCommand::Help => {
                info!("\n{}", HELP_TEXT);
                None
            }
            ConsoleCommand::Reboot => {
                self.connectivity.stop_config_mode().await;
                Some(Shutdown::Restart(RestartReason::OperatorRequest))
            }
        }
    }

    fn sample_button(&mut self, now: Millis) -> bool {
        let Some(button) = self.button.as_mut() else {
            return false;
        };
        let pressed = button.is_pressed();
        self.hold.update(pressed, now)
    }

    async fn evaluate_triggers(&mut self, now: Millis, button_held: bool) {
        if let Some((reason, at)) = self.config_retry {
            if now >= at {
                self.enter_config_mode(reason, now).await;
            }
            return;
        }

        let reason = evaluate(&TriggerInputs {
            credentials_configured: self.credentials.is_some(),
            rapid_cycle: false,
            operator_request: self.operator_request,
            retries_exhausted: self.connectivity.retries().is_exhausted(),
            button_held,
        });
        self.operator_request = false;

        if reason.forces_config_mode() {
            self.enter_config_mode(reason, now).await;
        }
    }

    async fn enter_config_mode(&mut self, reason: TriggerReason, now: Millis) {
        info!(%reason, "Entering configuration mode");
        if reason == TriggerReason::RetryExhausted {
            self.connectivity.reset_retries();
        }
        self.backend = None;

        match self.connectivity.start_config_mode(now).await {
            Ok(ap_name) => {
                self.config_retry = None;
                self.indicator.set_state(SystemState::ConfigMode);
                info!(ap = %ap_name, "Connect to the access point to configure this node");
            }
            Err(e) => {
                let retry_at = now.saturating_add(self.config.network.reconnect_interval_ms);
                error!(error = %e, retry_at, "Configuration mode failed to start");
                self.config_retry = Some((reason, retry_at));
                self.indicator.set_state(SystemState::Error);
            }
        }
    }

    async fn connect(&mut self) {
        let Some(credentials) = self.credentials.clone() else {
            return;
        };

        self.backend = None;
        self.indicator.set_state(SystemState::Connecting);

        let mut drain = ConnectingDrain {
            pipeline: &mut self.pipeline,
            indicator: &mut self.indicator,
        };
        let outcome = self
            .connectivity
            .start_client_mode(
                &credentials.ssid,
                &credentials.password,
                self.config.network.connect_timeout_ms,
                &self.clock,
                &mut drain,
            )
            .await;

        match outcome {
            ConnectOutcome::Connected => {
                if let Some((reason, _)) = self.config_retry.take() {
                    info!(%reason, "Connected; configuration mode no longer needed");
                }
                self.indicator.set_state(SystemState::Connected);
                self.build_backend();
                self.connectivity.ensure_status_server().await;
            }
            ConnectOutcome::TimedOut | ConnectOutcome::Failed(_) => {
                self.indicator.set_state(SystemState::Error);
                warn!(
                    attempts = self.connectivity.retries().count(),
                    threshold = self.config.network.retry_threshold,
                    "Not connected"
                );
            }
        }
    }

    /// Build the backend client; retried at the reconnect interval on failure.
    fn build_backend(&mut self) {
        let Some(credentials) = self.credentials.as_ref() else {
            return;
        };
        match (self.backend_factory)(credentials, &self.config.backend) {
            Ok(backend) => {
                info!(url = %credentials.backend_url(), "Relaying measurements");
                self.backend = Some(backend);
            }
            Err(e) => error!(error = %e, "Backend client unavailable; relaying paused"),
        }
    }

    async fn process_radio(&mut self, now: Millis) {
        let target = match (&self.backend, &self.credentials) {
            (Some(backend), Some(credentials)) if self.connectivity.is_connected() => {
                Some(RelayTarget {
                    backend: &**backend,
                    api_key: &credentials.api_key,
                    policy: self.retry_policy,
                })
            }
            _ => None,
        };

        let outcomes = self.pipeline.poll_radio(now, target.as_ref()).await;
        let delivered = outcomes.iter().any(|outcome| {
            matches!(outcome, FrameOutcome::Accepted { relay: Some(relay), .. } if relay.is_delivered())
        });
        if delivered {
            self.indicator.set_state(SystemState::Transmitting);
        }
    }

    fn log_status(&self, now: Millis) {
        let stats = self.pipeline.stats();
        let (depth, percentage, fresh) = self
            .pipeline
            .measurement()
            .map_or((None, None, false), |m| (Some(m.depth), Some(m.percentage), m.fresh));

        info!(
            uptime_s = elapsed(now, self.started_at) / 1000,
            state = %self.indicator.current_state(),
            connected = self.connectivity.is_connected(),
            config_mode = self.connectivity.is_in_config_mode(),
            retries = self.connectivity.retries().count(),
            depth = ?depth,
            percentage = ?percentage,
            fresh,
            frames_accepted = stats.frames_accepted,
            frames_rejected = stats.frames_rejected,
            relays_succeeded = stats.relays_succeeded,
            relays_failed = stats.relays_failed,
            "Status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WifiError;
    use crate::indicator::output::RecordingOutput;
    use crate::modem::ModemCommand;
    use crate::network::wifi::MockWifiDriver;
    use crate::serial::port_trait::mocks::MockModemLink;
    use crate::telemetry::relay::{BackendResponse, MockBackend};
    use crate::timing::MonotonicClock;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestGateway = Gateway<MockModemLink, MockWifiDriver, RecordingOutput, MonotonicClock>;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.boot.state_dir = dir.path().to_path_buf();
        config.network.portal_http_port = 0;
        config.network.dns_port = 0;
        config.network.status_http_port = 0;
        config.network.portal_address = Ipv4Addr::LOCALHOST;
        config.network.connect_timeout_ms = 1_000;
        config.network.connect_poll_ms = 250;
        config.backend.retry_delay_ms = 10;
        config
    }

    fn save_credentials(dir: &TempDir) {
        CredentialStore::in_dir(dir.path())
            .save(&NetworkCredentials::new(
                "HomeNet",
                "hunter22",
                "10.0.0.5",
                80,
                "/tank/api/tank_update.php",
                "key",
            ))
            .unwrap();
    }

    fn joining_wifi() -> MockWifiDriver {
        let mut wifi = MockWifiDriver::new();
        wifi.expect_begin_join().returning(|_, _| Ok(()));
        wifi.expect_is_joined().returning(|| Ok(true));
        wifi
    }

    fn ap_wifi(wifi: &mut MockWifiDriver) {
        wifi.expect_mac_address()
            .returning(|| Ok([0, 0, 0, 0, 0xbe, 0xef]));
        wifi.expect_start_access_point().returning(|_, _| Ok(()));
        wifi.expect_stop_access_point().returning(|| Ok(()));
    }

    fn delivering_backend() -> BackendFactory {
        Box::new(|_, _| {
            let mut backend = MockBackend::new();
            backend
                .expect_probe()
                .returning(|| Ok(BackendResponse::new(405, "")));
            backend
                .expect_submit()
                .returning(|_| Ok(BackendResponse::new(201, "")));
            Ok(Box::new(backend) as Box<dyn Backend>)
        })
    }

    fn gateway(dir: &TempDir, wifi: MockWifiDriver) -> (TestGateway, MockModemLink) {
        let link = MockModemLink::new();
        let handle = link.clone();
        let gateway = Gateway::new(
            test_config(dir),
            MonotonicClock::new(),
            link,
            wifi,
            RecordingOutput::default(),
        )
        .with_backend_factory(delivering_backend());
        (gateway, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_without_credentials_enters_config_mode() {
        let dir = TempDir::new().unwrap();
        let mut wifi = MockWifiDriver::new();
        ap_wifi(&mut wifi);
        let (mut gateway, _link) = gateway(&dir, wifi);

        gateway.boot(Utc::now()).await;

        assert!(gateway.connectivity().is_in_config_mode());
        assert_eq!(gateway.connectivity().ap_name(), Some("TankMonitor-BEEF"));
        assert_eq!(gateway.indicator().current_state(), SystemState::ConfigMode);
        assert!(gateway.step().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_with_credentials_connects() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let (mut gateway, _link) = gateway(&dir, joining_wifi());

        gateway.boot(Utc::now()).await;

        assert!(gateway.connectivity().is_connected());
        assert!(!gateway.connectivity().is_in_config_mode());
        assert_eq!(gateway.indicator().current_state(), SystemState::Connected);
        assert_eq!(gateway.credentials().unwrap().ssid, "HomeNet");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_power_cycles_force_config_mode() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let start = Utc::now();

        let window = Config::default().boot.rapid_cycle_window_ms;
        for boot in 0..2 {
            assert!(!detect_rapid_cycle(
                &BootRecordStore::in_dir(dir.path()),
                start + chrono::Duration::seconds(boot * 2),
                window,
                3,
            ));
        }

        let mut wifi = MockWifiDriver::new();
        ap_wifi(&mut wifi);
        let (mut gateway, _link) = gateway(&dir, wifi);
        gateway.boot(start + chrono::Duration::seconds(4)).await;

        assert!(gateway.connectivity().is_in_config_mode());
        assert!(BootRecordStore::in_dir(dir.path()).load().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_frame_flashes_indicator() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let (mut gateway, link) = gateway(&dir, joining_wifi());
        gateway.boot(Utc::now()).await;
        link.clear_sent_commands();

        link.push_line("+EVT:RXP2P:-40:5:0000");
        assert!(gateway.step().await.is_none());

        let m = gateway.pipeline().measurement().unwrap();
        assert_eq!((m.depth, m.percentage), (200, 100));
        assert_eq!(gateway.stats().relays_succeeded, 1);
        assert_eq!(gateway.indicator().current_state(), SystemState::Transmitting);
        assert_eq!(link.get_sent_commands(), vec![ModemCommand::ArmReceive]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_leaves_measurement_unchanged() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let (mut gateway, link) = gateway(&dir, joining_wifi());
        gateway.boot(Utc::now()).await;

        link.push_line("+EVT:RXP2P:03FF");
        gateway.step().await;
        link.clear_sent_commands();

        link.push_line("+EVT:RXP2P:ABC");
        gateway.step().await;

        let m = gateway.pipeline().measurement().unwrap();
        assert_eq!(m.depth, 0);
        assert_eq!(gateway.stats().frames_rejected, 1);
        assert_eq!(link.get_sent_commands(), vec![ModemCommand::ArmReceive]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_command_enters_config_mode_next_tick() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let mut wifi = joining_wifi();
        ap_wifi(&mut wifi);
        let (tx, rx) = mpsc::channel(4);
        let (gateway, _link) = gateway(&dir, wifi);
        let mut gateway = gateway.with_commands(rx);
        gateway.boot(Utc::now()).await;

        tx.send(ConsoleCommand::EnterConfig).await.unwrap();
        assert!(gateway.step().await.is_none());

        assert!(gateway.connectivity().is_in_config_mode());
        assert!(!gateway.connectivity().is_connected());
        assert_eq!(gateway.indicator().current_state(), SystemState::ConfigMode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_command_clears_credentials_and_restarts() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let (tx, rx) = mpsc::channel(4);
        let (gateway, _link) = gateway(&dir, joining_wifi());
        let mut gateway = gateway.with_commands(rx);
        gateway.boot(Utc::now()).await;

        tx.send(ConsoleCommand::ResetCredentials).await.unwrap();
        assert_eq!(
            gateway.step().await,
            Some(Shutdown::Restart(RestartReason::CredentialsCleared))
        );
        assert!(CredentialStore::in_dir(dir.path()).load().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_command() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let (tx, rx) = mpsc::channel(4);
        let (gateway, _link) = gateway(&dir, joining_wifi());
        let mut gateway = gateway.with_commands(rx);
        gateway.boot(Utc::now()).await;

        tx.send(ConsoleCommand::Status).await.unwrap();
        tx.send(ConsoleCommand::Reboot).await.unwrap();
        assert_eq!(gateway.step().await, None);
        assert_eq!(
            gateway.step().await,
            Some(Shutdown::Restart(RestartReason::OperatorRequest))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_forces_config_mode_once() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let mut wifi = MockWifiDriver::new();
        wifi.expect_begin_join()
            .returning(|_, _| Err(WifiError::Command("no such network".into())));
        ap_wifi(&mut wifi);
        let (mut gateway, _link) = gateway(&dir, wifi);
        let reconnect = Duration::from_millis(gateway.config.network.reconnect_interval_ms);

        gateway.boot(Utc::now()).await;
        assert_eq!(gateway.connectivity().retries().count(), 1);
        assert_eq!(gateway.indicator().current_state(), SystemState::Error);

        for expected in 2..=3 {
            tokio::time::advance(reconnect).await;
            gateway.step().await;
            assert_eq!(gateway.connectivity().retries().count(), expected);
            assert!(!gateway.connectivity().is_in_config_mode());
        }

        gateway.step().await;
        assert!(gateway.connectivity().is_in_config_mode());
        assert_eq!(gateway.connectivity().retries().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_pending_config_mode_retry() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let joins = Arc::new(AtomicUsize::new(0));
        let attempts = joins.clone();
        let mut wifi = MockWifiDriver::new();
        // Three failed joins exhaust the retries; the fourth succeeds
        wifi.expect_begin_join().returning(move |_, _| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(WifiError::Command("no such network".into()))
            } else {
                Ok(())
            }
        });
        wifi.expect_is_joined().returning(|| Ok(true));
        wifi.expect_mac_address()
            .returning(|| Ok([0, 0, 0, 0, 0xbe, 0xef]));
        wifi.expect_start_access_point()
            .returning(|_, _| Err(WifiError::Unavailable("hotspot refused".into())));
        let (mut gateway, _link) = gateway(&dir, wifi);
        let reconnect = Duration::from_millis(gateway.config.network.reconnect_interval_ms);

        gateway.boot(Utc::now()).await;
        for _ in 0..2 {
            tokio::time::advance(reconnect).await;
            gateway.step().await;
        }
        assert_eq!(gateway.connectivity().retries().count(), 3);

        // Config mode fails to start, then the reconnect in the same tick succeeds
        tokio::time::advance(reconnect).await;
        gateway.step().await;
        assert!(gateway.connectivity().is_connected());
        assert!(!gateway.connectivity().is_in_config_mode());

        tokio::time::advance(reconnect).await;
        gateway.step().await;
        assert!(gateway.connectivity().is_connected());
        assert!(!gateway.connectivity().is_in_config_mode());
        assert_eq!(joins.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_client_rebuilt_after_failure() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let (gateway, link) = gateway(&dir, joining_wifi());
        let delivering = delivering_backend();
        let mut gateway = gateway.with_backend_factory(Box::new(
            move |credentials: &NetworkCredentials, config: &BackendConfig| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RelayError::Transport("client build failed".into()))
                } else {
                    delivering(credentials, config)
                }
            },
        ));
        gateway.boot(Utc::now()).await;

        link.push_line("+EVT:RXP2P:-40:5:0000");
        gateway.step().await;
        assert_eq!(gateway.stats().frames_accepted, 1);
        assert_eq!(gateway.stats().relays_succeeded, 0);

        tokio::time::advance(Duration::from_millis(gateway.config.network.reconnect_interval_ms)).await;
        link.push_line("+EVT:RXP2P:-40:5:0000");
        gateway.step().await;
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.stats().relays_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_reconnects() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let mut wifi = MockWifiDriver::new();
        wifi.expect_begin_join().times(2).returning(|_, _| Ok(()));
        let up = Arc::new(AtomicBool::new(true));
        let link_state = up.clone();
        wifi.expect_is_joined()
            .returning(move || Ok(link_state.load(Ordering::SeqCst)));
        let (mut gateway, _link) = gateway(&dir, wifi);
        gateway.boot(Utc::now()).await;
        assert!(gateway.connectivity().is_connected());

        up.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(gateway.config.network.reconnect_interval_ms)).await;
        gateway.step().await;

        assert!(!gateway.connectivity().is_connected());
        assert_eq!(gateway.connectivity().retries().count(), 1);
        assert_eq!(gateway.indicator().current_state(), SystemState::Error);
    }

    struct HeldButton;

    impl ButtonInput for HeldButton {
        fn is_pressed(&mut self) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_button_enters_config_mode() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let mut wifi = joining_wifi();
        ap_wifi(&mut wifi);
        let (gateway, _link) = gateway(&dir, wifi);
        let mut gateway = gateway.with_button(Box::new(HeldButton));
        let hold = Duration::from_millis(gateway.config.boot.button_hold_ms);
        gateway.boot(Utc::now()).await;

        gateway.step().await;
        assert!(!gateway.connectivity().is_in_config_mode());

        tokio::time::advance(hold).await;
        gateway.step().await;
        assert!(gateway.connectivity().is_in_config_mode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_signal() {
        let dir = TempDir::new().unwrap();
        save_credentials(&dir);
        let (mut gateway, _link) = gateway(&dir, joining_wifi());
        gateway.boot(Utc::now()).await;

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        assert_eq!(
            gateway.run(async move { shutdown.await }).await,
            Shutdown::Interrupted
        );
    }
}
