//! Core module containing the main functionality of Modlink
//!
//! This module provides:
//! - Protocol layer (CRC-16, frame codec, tolerance rules)
//! - Serial link abstraction with real and mock implementations
//! - Half-duplex transport engine (pacing, adaptive framing, retries)
//! - RTU client facade with typed operations and baudrate switching
//! - Per-device state registry with JSON persistence
//! - Device discovery across ports, baudrates and unit IDs

pub mod client;
pub mod device_state;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;
