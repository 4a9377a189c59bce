//! Error types for fieldgate-core.
//!
//! This module defines all error types that can occur when exchanging frames
//! with meters over a half-duplex serial field bus.
//!
//! # Error Recovery Strategies
//!
//! | Error Type | Strategy | Rationale |
//! |------------|----------|-----------|
//! | [`Error::TransportTimeout`] | Retry | Late or missing bytes on the line |
//! | [`Error::ChecksumMismatch`] | Retry with backoff | Line noise corrupted the frame |
//! | [`Error::Io`] / [`Error::Serial`] | Retry | Port hiccups are usually transient |
//! | [`Error::AddressMismatch`] | Do not retry | Another device answered, bus misconfigured |
//! | [`Error::FunctionCodeMismatch`] | Do not retry | Device does not speak this function |
//! | [`Error::DeviceException`] | Do not retry | Device rejected the request |
//! | [`Error::RetriesExhausted`] | Skip device this cycle | Budget spent |
//! | [`Error::InvalidConfig`] | Do not retry | Fix configuration and restart |
//!
//! ## Using RetryPolicy
//!
//! [`crate::MeterClient`] consults [`crate::RetryPolicy::decide`] after every
//! failed attempt:
//!
//! ```
//! use fieldgate_core::{Error, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let err = Error::ChecksumMismatch { frame: vec![0x01, 0x04] };
//! assert!(matches!(policy.decide(0, &err), RetryDecision::RetryAfter(_)));
//! ```

use thiserror::Error;

use crate::frame::hex;

/// Errors that can occur when talking to field-bus devices.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Fewer bytes arrived than the shortest valid response.
    #[error("Response too short: expected at least {expected} bytes, got {received}")]
    TransportTimeout { expected: usize, received: usize },

    /// Frame failed checksum validation.
    #[error("Checksum mismatch in frame [{}]", hex(.frame))]
    ChecksumMismatch { frame: Vec<u8> },

    /// A different device answered the request.
    #[error("Address mismatch: expected {expected:#04x}, got {actual:#04x}")]
    AddressMismatch { expected: u8, actual: u8 },

    /// Response carried an unexpected function code.
    #[error("Function code mismatch: expected {expected:#04x}, got {actual:#04x}")]
    FunctionCodeMismatch { expected: u8, actual: u8 },

    /// Device answered with an exception response.
    #[error("Device exception {code:#04x} ({})", exception_name(*.code))]
    DeviceException { code: u8 },

    /// Every attempt failed; `last` is the final failure.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// Response passed validation but its payload is malformed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// I/O error on the transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig(message.into())
    }

    /// Short stable name of the variant, used in device error logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TransportTimeout { .. } => "transport_timeout",
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::AddressMismatch { .. } => "address_mismatch",
            Error::FunctionCodeMismatch { .. } => "function_code_mismatch",
            Error::DeviceException { .. } => "device_exception",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::InvalidResponse(_) => "invalid_response",
            Error::Io(_) => "io",
            Error::Serial(_) => "serial",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Cancelled => "cancelled",
        }
    }

    /// Device exception code carried by this error, if any.
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Error::DeviceException { code } => Some(*code),
            Error::RetriesExhausted { last, .. } => last.exception_code(),
            _ => None,
        }
    }

    /// Whether another attempt at the same exchange may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransportTimeout { .. } => true,
            Error::ChecksumMismatch { .. } => true,
            Error::Io(_) => true,
            Error::Serial(_) => true,
            Error::AddressMismatch { .. } => false,
            Error::FunctionCodeMismatch { .. } => false,
            Error::DeviceException { .. } => false,
            Error::RetriesExhausted { .. } => false,
            Error::InvalidResponse(_) => false,
            Error::InvalidConfig(_) => false,
            Error::Cancelled => false,
        }
    }
}

impl From<fieldgate_types::ParseError> for Error {
    fn from(err: fieldgate_types::ParseError) -> Self {
        Error::InvalidResponse(err.to_string())
    }
}

/// Standard name for a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown",
    }
}

/// Result type alias using fieldgate-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
