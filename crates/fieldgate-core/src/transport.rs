//! Half-duplex byte transport abstraction.
//!
//! This module provides the [`Transport`] trait that abstracts over a real
//! RS485 serial port and the scripted [`crate::MockTransport`] used in tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::frame::hex;

/// Byte-level access to a half-duplex line.
///
/// Implementations own any line-turnaround timing: `set_direction` must not
/// return until the line is ready for the requested direction.
#[async_trait]
pub trait Transport: Send {
    /// Switch the line driver between transmit (`true`) and receive.
    async fn set_direction(&mut self, transmit: bool) -> Result<()>;

    /// Write a complete frame and wait until it has left the wire.
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Drain whatever bytes are already buffered without waiting.
    async fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Collect every byte that arrives within `window`.
    async fn read_until(&mut self, window: Duration) -> Result<Vec<u8>>;
}

/// Serial port settings for an RS485 meter bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    pub baud_rate: u32,
    /// Drive RTS as the transceiver DE/RE line.
    pub direction_control: bool,
    /// Settling time around each direction change.
    pub settle_delay: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            direction_control: false,
            settle_delay: Duration::from_micros(800),
        }
    }
}

impl SerialConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(Error::invalid_config("serial port cannot be empty"));
        }
        if self.baud_rate == 0 {
            return Err(Error::invalid_config("baud rate must be greater than 0"));
        }
        Ok(())
    }

    /// Time to shift `len` bytes out at 8N2 (11 bit times per byte).
    pub fn transmit_time(&self, len: usize) -> Duration {
        let bits = 11u64 * len as u64;
        Duration::from_micros(bits * 1_000_000 / u64::from(self.baud_rate.max(1)))
    }
}

/// Longest a drain read may block when the driver reports pending bytes.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(5);

/// RS485 transport over a tokio serial port, 8 data bits, no parity, 2 stop bits.
pub struct SerialTransport {
    config: SerialConfig,
    port: SerialStream,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl SerialTransport {
    /// Open the port described by `config`.
    pub fn open(config: SerialConfig) -> Result<Self> {
        config.validate()?;

        debug!("Opening serial port: {}", config.port);
        let mut port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::Two)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        if config.direction_control {
            tokio_serial::SerialPort::write_request_to_send(&mut port, false)?;
        }

        info!(
            port = %config.port,
            baud = config.baud_rate,
            direction_control = config.direction_control,
            "Opened serial port"
        );
        Ok(Self { config, port })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn set_direction(&mut self, transmit: bool) -> Result<()> {
        if !self.config.direction_control {
            return Ok(());
        }
        if transmit {
            tokio_serial::SerialPort::write_request_to_send(&mut self.port, true)?;
            sleep(self.config.settle_delay).await;
        } else {
            sleep(self.config.settle_delay).await;
            tokio_serial::SerialPort::write_request_to_send(&mut self.port, false)?;
        }
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.port.write_all(frame).await?;
        self.port.flush().await?;
        // flush only hands bytes to the driver; hold the line until they are out
        sleep(self.config.transmit_time(frame.len())).await;
        debug!(hex_data = %hex(frame), length = frame.len(), direction = "send", "Serial frame");
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        let pending = tokio_serial::SerialPort::bytes_to_read(&self.port)? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        match timeout(DRAIN_TIMEOUT, self.port.read(&mut buf)).await {
            Ok(read) => buf.truncate(read?),
            Err(_) => buf.clear(),
        }
        if !buf.is_empty() {
            debug!(hex_data = %hex(&buf), "Discarded stale bytes");
        }
        Ok(buf)
    }

    async fn read_until(&mut self, window: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match timeout_at(deadline, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        if !out.is_empty() {
            debug!(hex_data = %hex(&out), length = out.len(), direction = "recv", "Serial frame");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.settle_delay, Duration::from_micros(800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serial_config_validation() {
        let config = SerialConfig {
            port: String::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = SerialConfig {
            baud_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transmit_time() {
        let config = SerialConfig::default();
        // 8 bytes * 11 bits at 9600 baud
        assert_eq!(config.transmit_time(8), Duration::from_micros(9166));
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let config = SerialConfig {
            port: "/dev/fieldgate-does-not-exist".to_string(),
            ..Default::default()
        };
        assert!(SerialTransport::open(config).is_err());
    }
}
