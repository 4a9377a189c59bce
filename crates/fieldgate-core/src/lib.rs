//! Modbus RTU field-bus engine for the fieldgate telemetry gateway.
//!
//! This crate talks to power and battery meters over a half-duplex RS485
//! serial line using the read-input-registers function (0x04), and turns the
//! resulting high-rate samples into windowed summaries.
//!
//! # Features
//!
//! - **Framing**: request construction and CRC-16 validation
//! - **Bounded retry**: linear backoff on line noise and timeouts, no retry on
//!   protocol-level rejections
//! - **Shared transport**: many meter addresses on one serial port
//! - **Aggregation**: per-device windows with avg/min/max summaries
//! - **Testing**: a scripted [`MockTransport`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//! use fieldgate_core::{MeterClient, SerialConfig, SerialTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = SerialTransport::open(SerialConfig {
//!         port: "/dev/ttyUSB0".into(),
//!         ..Default::default()
//!     })?;
//!     let bus = Arc::new(Mutex::new(transport));
//!
//!     let meter = MeterClient::new(1, Arc::clone(&bus));
//!     let reading = meter.read_meter().await?;
//!     println!("{:.2} V {:.3} A {:.2} W", reading.voltage, reading.current, reading.power);
//!
//!     Ok(())
//! }
//! ```

pub mod aggregation;
pub mod checksum;
pub mod client;
pub mod error;
pub mod frame;
pub mod mock;
pub mod retry;
pub mod transport;

// Re-export the shared data model
pub use fieldgate_types::types;

// Core exports
pub use aggregation::AggregationBuffer;
pub use client::{ClientOptions, METER_START_REGISTER, MeterClient};
pub use error::{Error, Result};
pub use mock::MockTransport;
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{SerialConfig, SerialTransport, Transport};

/// Type alias for a transport shared between meter clients.
///
/// All clients on one serial line must share the same handle so their
/// exchanges are serialized.
pub type SharedTransport<T> = std::sync::Arc<tokio::sync::Mutex<T>>;
