//! # Modem Protocol Module
//!
//! Line-oriented AT protocol of the LoRa P2P radio modem.
//!
//! This module handles:
//! - Encoding outbound commands ([`protocol::ModemCommand`])
//! - Classifying inbound lines (acknowledgement, error, receive event)
//! - Decoding and validating receive-event payloads ([`decoder`])
//!
//! The transport that carries these lines lives in [`crate::serial`].

pub mod decoder;
pub mod protocol;

pub use decoder::{decode_frame, RAW_VALUE_MAX};
pub use protocol::{classify_line, ModemCommand, ModemLine, RadioParams};
