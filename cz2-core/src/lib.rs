//! Protocol library for the Carrier ComfortZone II bus.
//!
//! Layers, bottom up:
//! - `frame`: wire framing and CRC validation against a noisy multi-master bus
//! - `transport`: TCP (serial-over-IP bridge) and direct serial byte streams
//! - `client`: request/reply correlation, row read/write, status acquisition
//! - `status`: fixed-offset decoding of raw rows into a [`model::SystemStatus`]
//!
//! The service layer (cache, refresh loop, HTTP/MQTT surfaces) lives in the
//! `cz2-gateway` crate.

pub mod client;
pub mod error;
pub mod frame;
pub mod model;
pub mod status;
pub mod transport;

pub use client::{Connector, CzClient};
pub use error::{CzError, Result};
pub use frame::{build_message, crc16, scan_frame, Frame, Function};
pub use model::{FanMode, SystemMode, SystemStatus, ZoneStatus};
