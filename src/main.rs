//! # Tank Gateway
//!
//! Receives water-level frames from a LoRa sensor node and relays them to
//! the backend, hosting a captive configuration portal when the node is not
//! (or can no longer be) connected.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tank_gateway::config::{Config, LoggingConfig};
use tank_gateway::console::{spawn_stdin_reader, HELP_TEXT};
use tank_gateway::gateway::{Gateway, Shutdown};
use tank_gateway::indicator::output::AnyOutput;
use tank_gateway::modem::RadioParams;
use tank_gateway::network::wifi::NmcliWifi;
use tank_gateway::serial::{bring_up, SerialModem};
use tank_gateway::timing::MonotonicClock;
use tank_gateway::trigger::button::SysfsButton;

/// Configuration file used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Log directives used when `RUST_LOG` is unset or invalid
const DEFAULT_LOG_FILTER: &str = "info";

/// Exit status asking the service supervisor to start us again
const EXIT_RESTART: u8 = 75;

/// Main entry point for the tank gateway
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, default `config/default.toml`)
///    - Set up logging (stdout, plus a daily file when configured)
///    - Open the modem and put it into continuous P2P receive
///
/// 2. **Boot decision**
///    - Join the saved network, or enter configuration mode
///
/// 3. **Main Loop**
///    - Tick the control loop until a restart is needed or Ctrl+C
///
/// 4. **Restart**
///    - Run `system.reboot_command` when configured, otherwise exit with
///      status 75 for the supervisor to relaunch us
///
/// # Errors
///
/// Returns error if:
/// - The configuration cannot be loaded
/// - No radio modem is found
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let _log_guard = init_logging(&config.logging);

    info!("Tank Gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(config = %config_path.display(), "Configuration loaded");

    let mut modem = SerialModem::open(&config.radio)?;
    info!("Radio modem opened at: {}", modem.device_path());
    if let Err(e) = bring_up(&mut modem, RadioParams::from(&config.radio)).await {
        // The defensive re-arm keeps retrying from the control loop
        warn!(error = %e, "Radio bring-up incomplete");
    }

    let wifi = NmcliWifi::new(&config.network.interface);
    let output = AnyOutput::from_path(config.indicator.led_path.as_deref());
    let (commands, _console) = spawn_stdin_reader();

    let reboot_command = config.system.reboot_command.clone();
    let button_path = config.boot.button_path.clone();

    let mut gateway = Gateway::new(config, MonotonicClock::new(), modem, wifi, output)
        .with_commands(commands);
    if let Some(path) = button_path {
        info!(path = %path.display(), "Watching configuration button");
        gateway = gateway.with_button(Box::new(SysfsButton::new(&path)));
    }

    info!("\n{}", HELP_TEXT);
    gateway.boot(Utc::now()).await;

    let shutdown = gateway
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    let stats = gateway.stats();
    info!(
        frames_accepted = stats.frames_accepted,
        frames_rejected = stats.frames_rejected,
        relays_succeeded = stats.relays_succeeded,
        relays_failed = stats.relays_failed,
        "Totals"
    );

    match shutdown {
        Shutdown::Interrupted => Ok(ExitCode::SUCCESS),
        Shutdown::Restart(reason) => {
            info!(%reason, "Restarting");
            restart(reboot_command.as_deref()).await.map(ExitCode::from)
        }
    }
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` level. The returned guard must
/// live until exit so buffered file output is flushed.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());
    let stdout = tracing_subscriber::fmt::layer();

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "tank-gateway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}

/// `RUST_LOG` directives when given and valid, `info` otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Run the reboot command, or hand the restart to the supervisor.
///
/// Returns the process exit status.
async fn restart(reboot_command: Option<&str>) -> Result<u8> {
    let Some(command) = reboot_command else {
        return Ok(EXIT_RESTART);
    };

    info!(command, "Running reboot command");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .await
        .with_context(|| format!("running reboot command {:?}", command))?;

    if status.success() {
        Ok(0)
    } else {
        error!(%status, "Reboot command failed; exiting for the supervisor");
        Ok(EXIT_RESTART)
    }
}
