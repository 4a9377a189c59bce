//! Error types for data parsing and validation in fieldgate-types.

use thiserror::Error;

/// Errors that can occur when decoding register data or validating devices.
///
/// This error type is transport-agnostic and does not include
/// serial or protocol errors (those belong in fieldgate-core).
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Not enough register words to decode a reading.
    #[error("Insufficient data: requires {expected} words, got {actual}")]
    InsufficientWords { expected: usize, actual: usize },

    /// Device definition violates a registry invariant.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// Unrecognized device kind string.
    #[error("Unknown device kind: {0}")]
    UnknownKind(String),
}

/// Result type alias using fieldgate-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
