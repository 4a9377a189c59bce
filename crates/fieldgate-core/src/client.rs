//! Meter protocol client.
//!
//! [`MeterClient`] performs read-input-registers exchanges with one device on
//! a shared half-duplex transport, validating each response and retrying
//! transient failures according to its [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use fieldgate_types::{METER_REGISTER_COUNT, MeterReading};

use crate::error::{Error, Result};
use crate::frame::{self, READ_INPUT_REGISTERS};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::Transport;

/// First register of the meter measurement block.
pub const METER_START_REGISTER: u16 = 0x0000;

/// Timing and retry settings for a [`MeterClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// How long to collect the response after the request has gone out.
    pub read_timeout: Duration,
    /// Extra read for bytes that straggle in after the main window.
    pub trailing_timeout: Duration,
    /// Quiet time between switching to receive and starting to read.
    pub inter_frame_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
            trailing_timeout: Duration::from_millis(10),
            inter_frame_delay: Duration::from_millis(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientOptions {
    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the main read window.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Protocol client for one meter address.
///
/// Several clients may share one transport; the transport lock is held for
/// the whole exchange including retries, so requests never interleave on
/// the line.
pub struct MeterClient<T: Transport> {
    address: u8,
    transport: Arc<Mutex<T>>,
    options: ClientOptions,
}

impl<T: Transport> std::fmt::Debug for MeterClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterClient")
            .field("address", &self.address)
            .field("options", &self.options)
            .finish()
    }
}

impl<T: Transport> MeterClient<T> {
    /// Create a client with default options.
    pub fn new(address: u8, transport: Arc<Mutex<T>>) -> Self {
        Self::with_options(address, transport, ClientOptions::default())
    }

    /// Create a client with custom options.
    pub fn with_options(address: u8, transport: Arc<Mutex<T>>, options: ClientOptions) -> Self {
        Self {
            address,
            transport,
            options,
        }
    }

    /// Protocol address this client talks to.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Read `count` input registers starting at `start`.
    ///
    /// Returns the complete validated response frame.
    ///
    /// # Errors
    ///
    /// - [`Error::RetriesExhausted`] when every attempt failed with a
    ///   retryable error
    /// - [`Error::AddressMismatch`], [`Error::FunctionCodeMismatch`] or
    ///   [`Error::DeviceException`] immediately, without retrying
    pub async fn read_input_registers(&self, start: u16, count: u16) -> Result<Vec<u8>> {
        let request = frame::read_input_registers_request(self.address, start, count);
        let expected = frame::min_response_len(count);
        let policy = self.options.retry;

        let mut transport = self.transport.lock().await;
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .exchange(&mut *transport, &request, expected)
                .await
                .and_then(|rx| {
                    frame::validate_response(&rx, self.address, READ_INPUT_REGISTERS).map(|()| rx)
                });

            let err = match result {
                Ok(rx) => {
                    if attempt > 0 {
                        debug!(
                            address = self.address,
                            "Read succeeded after {} retries", attempt
                        );
                    }
                    return Ok(rx);
                }
                Err(e) => e,
            };

            warn!(
                address = self.address,
                attempt = attempt + 1,
                max_attempts = policy.total_attempts(),
                error = %err,
                "Read attempt failed"
            );

            match policy.decide(attempt, &err) {
                RetryDecision::RetryAfter(delay) => {
                    sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp if err.is_retryable() => {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    });
                }
                RetryDecision::GiveUp => return Err(err),
            }
        }
    }

    /// Read and decode the meter measurement block.
    pub async fn read_meter(&self) -> Result<MeterReading> {
        let count = METER_REGISTER_COUNT as u16;
        let rx = self
            .read_input_registers(METER_START_REGISTER, count)
            .await?;
        let payload = frame::register_payload(&rx, count)?;
        let reading = MeterReading::from_bytes(payload)?;
        if reading.power_substituted {
            debug!(
                address = self.address,
                power = reading.power,
                "Implausible power register replaced with V*I"
            );
        }
        Ok(reading)
    }

    /// Like [`read_meter`](Self::read_meter), but abandons the exchange and
    /// any pending retry with [`Error::Cancelled`] once `cancelled` resolves.
    pub async fn read_meter_until<F>(&self, cancelled: F) -> Result<MeterReading>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancelled => Err(Error::Cancelled),
            result = self.read_meter() => result,
        }
    }

    /// One request/response round on an already locked transport.
    async fn exchange(&self, transport: &mut T, request: &[u8], expected: usize) -> Result<Vec<u8>> {
        let stale = transport.read_available().await?;
        if !stale.is_empty() {
            debug!(
                address = self.address,
                bytes = stale.len(),
                "Flushed stale receive buffer"
            );
        }

        transport.set_direction(true).await?;
        let sent = transport.send(request).await;
        // always release the line, even when the write failed
        transport.set_direction(false).await?;
        sent?;

        sleep(self.options.inter_frame_delay).await;

        let mut rx = transport.read_until(self.options.read_timeout).await?;
        rx.extend(transport.read_until(self.options.trailing_timeout).await?);

        if rx.len() < expected && !frame::is_exception_response(&rx) {
            return Err(Error::TransportTimeout {
                expected,
                received: rx.len(),
            });
        }
        Ok(rx)
    }
}
