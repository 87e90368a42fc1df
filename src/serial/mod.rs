//! # Serial Communication Module
//!
//! Handles the UART link to the LoRa P2P modem.
//!
//! This module handles:
//! - Opening the serial port (8N1, no flow control)
//! - Reading lines in a background task so nothing is lost between ticks
//! - Command round trips bounded by a fixed timeout
//! - Buffering asynchronous receive events that arrive mid-command
//! - The modem bring-up sequence ([`bring_up`])

pub mod port_trait;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RadioConfig;
use crate::error::{GatewayError, ModemError, Result};
use crate::modem::protocol::LINE_TERMINATOR;
use crate::modem::{classify_line, ModemCommand, ModemLine, RadioParams};
pub use port_trait::ModemLink;

/// Fallback device paths tried after the configured one (in order of preference)
const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyUSB0", // USB-to-serial adapters
    "/dev/ttyACM0", // USB CDC devices
    "/dev/ttyS0",   // On-board UART
];

/// Capacity of the line channel between the reader task and the modem handle
const LINE_BUFFER: usize = 256;

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Radio modem reached over a serial port.
pub struct SerialModem {
    writer: BoxedWriter,
    lines: mpsc::Receiver<String>,
    pending: VecDeque<String>,
    device_path: String,
    command_timeout: Duration,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for SerialModem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialModem")
            .field("device_path", &self.device_path)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl SerialModem {
    /// Open the modem described by `config`.
    ///
    /// Tries the configured port first, then the common fallback paths.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SerialPortNotFound`] if no path can be opened.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tank_gateway::config::RadioConfig;
    /// use tank_gateway::serial::SerialModem;
    ///
    /// #[tokio::main(flavor = "current_thread")]
    /// async fn main() -> anyhow::Result<()> {
    ///     let modem = SerialModem::open(&RadioConfig::default())?;
    ///     println!("Modem at {}", modem.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(config: &RadioConfig) -> Result<Self> {
        let paths = candidate_paths(&config.port);
        Self::open_with_paths(
            &paths,
            config.baud_rate,
            Duration::from_millis(config.command_timeout_ms),
        )
    }

    /// Open the first of `paths` that succeeds.
    ///
    /// Must be called inside a tokio runtime (the line reader is spawned).
    ///
    /// # Arguments
    ///
    /// * `paths` - Device paths to try (e.g., &["/dev/ttyUSB0"])
    /// * `baud_rate` - UART speed
    /// * `command_timeout` - Bound on each command round trip
    pub fn open_with_paths(
        paths: &[&str],
        baud_rate: u32,
        command_timeout: Duration,
    ) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!(path = %path, baud_rate, "Opened radio modem");
                    return Ok(Self::from_stream(port, path, command_timeout));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(GatewayError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port with modem settings (8N1, no flow control)
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| GatewayError::Serial(format!("Failed to open {}: {}", path, e)))
    }

    /// Wrap any byte stream speaking the modem protocol.
    ///
    /// Spawns the line reader task; must be called inside a tokio runtime.
    pub fn from_stream<S>(stream: S, device_path: &str, command_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let reader = tokio::spawn(read_lines(read_half, tx));

        Self {
            writer: Box::new(write_half),
            lines: rx,
            pending: VecDeque::new(),
            device_path: device_path.to_string(),
            command_timeout,
            reader,
        }
    }

    /// Path of the opened serial device
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Drop responses left over from commands that timed out, so they are
    /// not taken as the answer to the next command. Other lines are kept.
    fn discard_stale_responses(&mut self) {
        while let Ok(line) = self.lines.try_recv() {
            let classified = classify_line(&line);
            if classified.is_response() {
                debug!(line = %line, "Discarding stale modem response");
            } else if classified != ModemLine::Blank {
                self.pending.push_back(line);
            }
        }
    }

    async fn write_command(&mut self, text: &str) -> std::io::Result<()> {
        let line = format!("{}{}", text, LINE_TERMINATOR);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }
}

impl Drop for SerialModem {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl ModemLink for SerialModem {
    async fn execute(&mut self, command: &ModemCommand) -> std::result::Result<(), ModemError> {
        let text = command.encode();
        self.discard_stale_responses();
        debug!(command = %text, "Modem command");
        self.write_command(&text).await?;

        let deadline = tokio::time::Instant::now() + self.command_timeout;
        loop {
            let line = match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(ModemError::Closed),
                Err(_) => {
                    return Err(ModemError::Timeout {
                        command: text,
                        timeout_ms: self.command_timeout.as_millis() as u64,
                    })
                }
            };

            match classify_line(&line) {
                ModemLine::Ack => return Ok(()),
                ModemLine::Error(response) => {
                    let response = response.to_string();
                    return Err(ModemError::Rejected {
                        command: text,
                        response,
                    });
                }
                ModemLine::Blank => continue,
                ModemLine::ReceiveEvent(_) | ModemLine::Other(_) => {}
            }
            self.pending.push_back(line);
        }
    }

    fn take_pending_lines(&mut self) -> Vec<String> {
        let mut lines: Vec<String> = self.pending.drain(..).collect();
        while let Ok(line) = self.lines.try_recv() {
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Forward every line read from `reader` until the stream ends.
async fn read_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(128);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                warn!("Modem stream closed");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Modem read failed");
                break;
            }
        }
    }
}

/// Configured path first, then the fallbacks, without duplicates.
fn candidate_paths(configured: &str) -> Vec<&str> {
    let mut paths = vec![configured];
    for path in DEFAULT_DEVICE_PATHS {
        if !paths.contains(path) {
            paths.push(path);
        }
    }
    paths
}

/// Put the modem into continuous P2P receive.
///
/// Sends the mode switch, the radio parameters, arms receive and finishes
/// with a liveness probe.
///
/// # Errors
///
/// Returns the first [`ModemError`]; later steps are not attempted.
pub async fn bring_up<L: ModemLink + ?Sized>(
    link: &mut L,
    params: RadioParams,
) -> std::result::Result<(), ModemError> {
    let sequence = [
        ModemCommand::SetP2pMode,
        ModemCommand::SetRadioParams(params),
        ModemCommand::ArmReceive,
        ModemCommand::Probe,
    ];

    for command in &sequence {
        link.execute(command).await?;
    }

    info!(
        frequency_hz = params.frequency_hz,
        spreading_factor = params.spreading_factor,
        bandwidth = params.bandwidth,
        coding_rate = params.coding_rate,
        preamble_length = params.preamble_length,
        tx_power_dbm = params.tx_power_dbm,
        "Radio configured for P2P receive"
    );
    Ok(())
}
