//! # Modem Protocol Constants and Types
//!
//! AT command set of the LoRa P2P modem and classification of the lines it
//! sends back.

use std::fmt;

use crate::config::RadioConfig;

/// Prefix of asynchronous receive-event lines carrying a data frame.
pub const RX_EVENT_PREFIX: &str = "+EVT:RXP2P";

/// Acknowledgement line.
pub const ACK: &str = "OK";

/// Receive window meaning "listen continuously".
pub const RECEIVE_CONTINUOUS: u16 = 65535;

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// P2P radio parameters sent with `AT+P2P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioParams {
    pub frequency_hz: u32,
    pub spreading_factor: u8,
    /// Modem bandwidth code (0 = 125 kHz, 1 = 250 kHz, 2 = 500 kHz, ...)
    pub bandwidth: u8,
    /// Modem coding-rate code (0 = 4/5 ... 3 = 4/8)
    pub coding_rate: u8,
    pub preamble_length: u16,
    pub tx_power_dbm: u8,
}

impl From<&RadioConfig> for RadioParams {
    fn from(config: &RadioConfig) -> Self {
        Self {
            frequency_hz: config.frequency_hz,
            spreading_factor: config.spreading_factor,
            bandwidth: config.bandwidth,
            coding_rate: config.coding_rate,
            preamble_length: config.preamble_length,
            tx_power_dbm: config.tx_power_dbm,
        }
    }
}

/// Commands understood by the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemCommand {
    /// `AT` liveness probe
    Probe,
    /// `AT+NWM=0`, switch to point-to-point mode
    SetP2pMode,
    /// `AT+P2P=freq:sf:bw:cr:preamble:power`
    SetRadioParams(RadioParams),
    /// `AT+PRECV=65535`
    ArmReceive,
    /// `AT+PRECV=0`
    DisarmReceive,
    /// `AT+PSEND=<hex>`
    Send(Vec<u8>),
}

impl ModemCommand {
    /// Encode the command text, without line terminator.
    ///
    /// # Examples
    ///
    /// ```
    /// use tank_gateway::modem::protocol::ModemCommand;
    ///
    /// assert_eq!(ModemCommand::ArmReceive.encode(), "AT+PRECV=65535");
    /// assert_eq!(ModemCommand::Send(vec![0x03, 0xFF]).encode(), "AT+PSEND=03FF");
    /// ```
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            ModemCommand::Probe => "AT".to_string(),
            ModemCommand::SetP2pMode => "AT+NWM=0".to_string(),
            ModemCommand::SetRadioParams(p) => format!(
                "AT+P2P={}:{}:{}:{}:{}:{}",
                p.frequency_hz,
                p.spreading_factor,
                p.bandwidth,
                p.coding_rate,
                p.preamble_length,
                p.tx_power_dbm
            ),
            ModemCommand::ArmReceive => format!("AT+PRECV={}", RECEIVE_CONTINUOUS),
            ModemCommand::DisarmReceive => "AT+PRECV=0".to_string(),
            ModemCommand::Send(payload) => {
                let hex: String = payload.iter().map(|b| format!("{:02X}", b)).collect();
                format!("AT+PSEND={}", hex)
            }
        }
    }
}

impl fmt::Display for ModemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// What a single line from the modem means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemLine<'a> {
    /// Empty line
    Blank,
    /// `OK`
    Ack,
    /// `AT_..._ERROR`
    Error(&'a str),
    /// Receive event carrying a data frame
    ReceiveEvent(&'a str),
    /// Anything else (other events, banners, echoes)
    Other(&'a str),
}

impl<'a> ModemLine<'a> {
    /// True for lines that end a command round trip.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, ModemLine::Ack | ModemLine::Error(_))
    }
}

/// Classify one line received from the modem.
#[must_use]
pub fn classify_line(line: &str) -> ModemLine<'_> {
    let line = line.trim();
    if line.is_empty() {
        ModemLine::Blank
    } else if line == ACK {
        ModemLine::Ack
    } else if line.starts_with("AT_") && line.ends_with("ERROR") {
        ModemLine::Error(line)
    } else if line.starts_with(RX_EVENT_PREFIX) {
        ModemLine::ReceiveEvent(line)
    } else {
        ModemLine::Other(line)
    }
}
