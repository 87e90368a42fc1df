//! # Tank Gateway Library
//!
//! LoRa water-tank telemetry gateway with a captive configuration portal.
//!
//! This library provides the core functionality for receiving water-level
//! frames from a remote sensor node over a UART LoRa modem, turning them into
//! measurements, relaying them to an HTTP backend, and provisioning the node
//! through a self-hosted access point when no network is configured.

pub mod config;
pub mod console;
pub mod error;
pub mod gateway;
pub mod indicator;
pub mod modem;
pub mod network;
pub mod serial;
pub mod storage;
pub mod telemetry;
pub mod timing;
pub mod trigger;
