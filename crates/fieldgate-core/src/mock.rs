//! Mock transport implementation for testing.
//!
//! This module provides a scripted transport that can be used for unit
//! testing without requiring a serial adapter or a real meter.
//!
//! The [`MockTransport`] implements the [`Transport`] trait, so it can stand in
//! for [`crate::SerialTransport`] anywhere a [`crate::MeterClient`] is built.
//!
//! # Features
//!
//! - **Scripted replies**: queue one response per request
//! - **Failure injection**: silence, corrupt frames, foreign addresses, exceptions
//! - **Inspection**: every sent frame and direction change is recorded

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::frame::{exception_response, read_input_registers_response};
use crate::transport::Transport;

/// A scripted half-duplex transport.
///
/// Each `send` consumes the next queued reply, which the following
/// `read_until` returns. When the queue is empty the fallback reply (if any)
/// is used, otherwise the line stays silent.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tokio::sync::Mutex;
/// use fieldgate_core::{MeterClient, MockTransport};
///
/// #[tokio::main]
/// async fn main() {
///     let mut mock = MockTransport::new();
///     mock.push_registers(1, &[1234, 250, 1500, 0, 12345, 0, 0, 0]);
///
///     let client = MeterClient::new(1, Arc::new(Mutex::new(mock)));
///     let reading = client.read_meter().await.unwrap();
///     assert_eq!(reading.voltage, 12.34);
/// }
/// ```
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: VecDeque<Vec<u8>>,
    fallback: Option<Vec<u8>>,
    inbound: Vec<u8>,
    stale: Vec<u8>,
    sent: Vec<Vec<u8>>,
    directions: Vec<bool>,
    fail_send: bool,
}

impl MockTransport {
    /// Create a silent transport with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw reply for the next request.
    pub fn push_reply(&mut self, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.replies.push_back(bytes.into());
        self
    }

    /// Queue a valid register response from `address`.
    pub fn push_registers(&mut self, address: u8, words: &[u16]) -> &mut Self {
        self.push_reply(read_input_registers_response(address, words))
    }

    /// Queue a register response with one payload bit flipped.
    pub fn push_corrupt(&mut self, address: u8, words: &[u16]) -> &mut Self {
        let mut frame = read_input_registers_response(address, words);
        frame[3] ^= 0x01;
        self.push_reply(frame)
    }

    /// Queue an exception response.
    pub fn push_exception(&mut self, address: u8, function: u8, code: u8) -> &mut Self {
        self.push_reply(exception_response(address, function, code))
    }

    /// Queue a request that gets no answer.
    pub fn push_silence(&mut self) -> &mut Self {
        self.push_reply(Vec::new())
    }

    /// Reply with `bytes` whenever the queue is empty.
    pub fn reply_always(&mut self, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.fallback = Some(bytes.into());
        self
    }

    /// Leave bytes in the receive buffer as if from an earlier exchange.
    pub fn inject_stale(&mut self, bytes: &[u8]) -> &mut Self {
        self.stale.extend_from_slice(bytes);
        self
    }

    /// Make every `send` fail with an I/O error.
    pub fn fail_sends(&mut self, fail: bool) -> &mut Self {
        self.fail_send = fail;
        self
    }

    /// Frames written so far.
    pub fn sent_frames(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Number of request/response exchanges attempted.
    pub fn exchanges(&self) -> usize {
        self.sent.len()
    }

    /// Direction changes in order (`true` = transmit).
    pub fn directions(&self) -> &[bool] {
        &self.directions
    }

    /// Replies still queued.
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn set_direction(&mut self, transmit: bool) -> Result<()> {
        self.directions.push(transmit);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if self.fail_send {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock send failure",
            )));
        }
        self.sent.push(frame.to_vec());
        let reply = self
            .replies
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or_default();
        self.inbound.extend_from_slice(&reply);
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.stale))
    }

    async fn read_until(&mut self, window: Duration) -> Result<Vec<u8>> {
        if self.inbound.is_empty() {
            // a silent line costs the whole window
            tokio::time::sleep(window).await;
        }
        Ok(std::mem::take(&mut self.inbound))
    }
}
