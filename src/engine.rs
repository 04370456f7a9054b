//! Request/response exchanges over the serial byte stream.
//!
//! The engine owns the stream. Each [`Transaction`] is written, then the response is collected
//! until it is complete or the per attempt timeout runs out. Failed attempts are retried
//! according to the [`RetryPolicy`].

use core::cmp::min;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use embedded_io::{Read, ReadReady, Write};
use fugit::{ExtU32, MillisDurationU32};
use log::{debug, trace, warn};

use crate::clock::{Clock, Instant, after};
use crate::codec::{
    Frame, MAX_FRAME_LEN, READ_INPUT_REGISTERS, ReadRequest, RegisterWords, expected_response_len,
};
use crate::error::{FrameError, TransactionError};

/// How long to sleep between checks of the stream while waiting for a response.
const POLL_STEP: MillisDurationU32 = MillisDurationU32::from_ticks(1);
/// Longest uninterrupted sleep while backing off or idling.
const PAUSE_SLICE: MillisDurationU32 = MillisDurationU32::from_ticks(10);

/// How hard to try before giving up on a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u8,
    /// How long to wait for a complete response to each attempt.
    pub timeout: MillisDurationU32,
    /// Pause between attempts.
    pub backoff: MillisDurationU32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            timeout: 200.millis(),
            backoff: 50.millis(),
        }
    }
}

/// Shared flag telling in-flight work to stop at the next opportunity.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep until `until` in short slices. Returns `false` if cancelled first.
pub(crate) fn sleep_until<C: Clock>(clock: &C, until: Instant, cancel: &CancelToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = clock.now();
        if now >= until {
            return true;
        }
        let remaining = until.ticks() - now.ticks();
        let slice = min(remaining, u64::from(PAUSE_SLICE.ticks())) as u32;
        clock.delay(MillisDurationU32::from_ticks(slice));
    }
}

/// One register read: the request plus the bookkeeping of its attempts.
#[derive(Debug)]
pub struct Transaction {
    request: ReadRequest,
    deadline: Option<Instant>,
    attempts: u8,
}

impl Transaction {
    pub fn new(address: u8, function: u8, start: u16, count: u16) -> Result<Self, FrameError> {
        Ok(Self {
            request: ReadRequest::new(address, function, start, count)?,
            deadline: None,
            attempts: 0,
        })
    }

    /// Read `count` input registers starting at `start`.
    pub fn read_input_registers(address: u8, start: u16, count: u16) -> Result<Self, FrameError> {
        Self::new(address, READ_INPUT_REGISTERS, start, count)
    }

    pub fn start(&self) -> u16 {
        self.request.start()
    }

    pub fn count(&self) -> u16 {
        self.request.count()
    }

    /// The encoded request.
    pub fn frame(&self) -> &[u8] {
        self.request.frame()
    }

    /// Deadline of the current (or last) attempt.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }
}

/// Drives transactions over an exclusively owned byte stream.
pub struct TransactionEngine<S, C> {
    stream: S,
    clock: C,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl<S, C> TransactionEngine<S, C>
where
    S: Read + Write + ReadReady,
    C: Clock,
{
    pub fn new(stream: S, clock: C, policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self {
            stream,
            clock,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Give the byte stream back.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Run `transaction` to completion.
    ///
    /// Timeouts, serial errors and corrupt frames are retried up to the policy's attempt count,
    /// after which the last error is returned. Device exceptions that will not go away by asking
    /// again are returned straight away.
    pub fn execute(
        &mut self,
        transaction: &mut Transaction,
    ) -> Result<RegisterWords, TransactionError> {
        let mut last_error = TransactionError::Timeout;

        while transaction.attempts < self.policy.attempts {
            if transaction.attempts > 0 {
                debug!(
                    "Retrying read of {} registers at 0x{:04X} after {}",
                    transaction.count(),
                    transaction.start(),
                    last_error
                );
                let resume = after(self.clock.now(), self.policy.backoff);
                if !sleep_until(&self.clock, resume, &self.cancel) {
                    return Err(TransactionError::Cancelled);
                }
            }
            if self.cancel.is_cancelled() {
                return Err(TransactionError::Cancelled);
            }
            transaction.attempts += 1;

            match self.attempt(transaction) {
                Ok(words) => return Ok(words),
                Err(TransactionError::Frame(err)) if !err.is_retryable() => {
                    warn!(
                        "Device rejected read of {} registers at 0x{:04X}: {}",
                        transaction.count(),
                        transaction.start(),
                        err
                    );
                    return Err(TransactionError::Frame(err));
                }
                Err(TransactionError::Cancelled) => return Err(TransactionError::Cancelled),
                Err(err) => last_error = err,
            }
        }

        Err(last_error)
    }

    fn attempt(
        &mut self,
        transaction: &mut Transaction,
    ) -> Result<RegisterWords, TransactionError> {
        self.discard_stale_input()?;

        trace!("TX {:02X?}", transaction.frame());
        self.stream
            .write_all(transaction.frame())
            .map_err(io_error)?;
        self.stream.flush().map_err(io_error)?;

        let deadline = after(self.clock.now(), self.policy.timeout);
        transaction.deadline = Some(deadline);

        let count = transaction.count();
        let mut response = Frame::new();
        let mut temp_buf = [0u8; 32];
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransactionError::Cancelled);
            }

            let mut progressed = false;
            if self.stream.read_ready().map_err(io_error)? {
                let expected = expected_response_len(&response, count);
                // Take the header on its own so an exception frame is not read past.
                let wanted = if response.len() < 2 {
                    2 - response.len()
                } else {
                    expected - response.len()
                };
                let limit = min(wanted, temp_buf.len());
                let bytes_read = self
                    .stream
                    .read(&mut temp_buf[..limit])
                    .map_err(io_error)?;
                for &byte in &temp_buf[..bytes_read] {
                    // Bounded by the expected frame length.
                    let _ = response.push(byte);
                }
                progressed = bytes_read > 0;

                if response.len() >= expected_response_len(&response, count) {
                    trace!("RX {:02X?}", response.as_slice());
                    return transaction
                        .request
                        .decode(&response)
                        .map_err(TransactionError::from);
                }
            }

            if !progressed {
                if self.clock.now() >= deadline {
                    debug!(
                        "Timed out with {} of {} response bytes",
                        response.len(),
                        expected_response_len(&response, count)
                    );
                    return Err(TransactionError::Timeout);
                }
                self.clock.delay(POLL_STEP);
            }
        }
    }

    /// Drop anything a previous, abandoned exchange left in the receive buffer.
    ///
    /// At most one frame's worth of bytes is dropped, so a line that never goes quiet cannot hold
    /// the transaction here. Whatever is left ends up in the response and fails validation.
    fn discard_stale_input(&mut self) -> Result<(), TransactionError> {
        let mut discarded = 0;
        let mut temp_buf = [0u8; 32];
        while discarded < MAX_FRAME_LEN && self.stream.read_ready().map_err(io_error)? {
            if self.cancel.is_cancelled() {
                return Err(TransactionError::Cancelled);
            }
            let limit = min(temp_buf.len(), MAX_FRAME_LEN - discarded);
            let bytes_read = self.stream.read(&mut temp_buf[..limit]).map_err(io_error)?;
            if bytes_read == 0 {
                break;
            }
            discarded += bytes_read;
        }
        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }
        Ok(())
    }
}

/// Exclusive access to the bus for one transaction at a time.
///
/// Implementations serialize callers. [`TransactionError::BusBusy`] is reserved for a bus that
/// finds another transaction on the wire despite that.
pub trait Bus {
    fn execute(&self, transaction: &mut Transaction) -> Result<RegisterWords, TransactionError>;
}

impl<S, C> Bus for Mutex<TransactionEngine<S, C>>
where
    S: Read + Write + ReadReady,
    C: Clock,
{
    /// Waits for any transaction in flight to finish, then runs `transaction`.
    fn execute(&self, transaction: &mut Transaction) -> Result<RegisterWords, TransactionError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute(transaction)
    }
}

fn io_error<E: embedded_io::Error>(err: E) -> TransactionError {
    TransactionError::Io(err.kind())
}
