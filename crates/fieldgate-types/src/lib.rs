//! Platform-agnostic types for the fieldgate telemetry gateway.
//!
//! This crate provides the data model shared by the field-bus engine
//! (fieldgate-core), the persistence layer (fieldgate-store) and the
//! gateway service.
//!
//! # Features
//!
//! - Device identity and registry invariants
//! - Meter register decoding
//! - Aggregated window records
//!
//! # Example
//!
//! ```
//! use fieldgate_types::{Device, DeviceKind};
//!
//! let meter = Device::new("pv-01", DeviceKind::Meter, "Roof array").with_address(3);
//! assert!(meter.validate().is_ok());
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    AggregatedRecord, Device, DeviceKind, MAX_PROTOCOL_ADDRESS, METER_REGISTER_COUNT,
    MeterReading, RawSample, round_to,
};
