//! Long write: a payload larger than one ATT write, sent in batches under a
//! single queue slot.
//!
//! ```text
//!   payload  [ batch 0 | batch 1 | batch 2 | tail ]
//!              ▲ cursor
//!   take() ─▶ write ─▶ completion ─▶ AckStrategy ─ continue? ─▶ take() …
//!                        │ failure
//!                        └─▶ RetryStrategy ─ retry? ─▶ rewind_to(batch) …
//! ```
//!
//! Only status failures and refused starts are offered to the retry
//! strategy.  Timeouts and disconnection end the session immediately.

use core::future::Future;
use core::ops::Range;

use log::{debug, info};

use super::{Exchange, Operation, OperationContext, exchange};
use crate::error::{Error, Result};
use crate::gatt::{CharacteristicId, OperationKind, Target};
use crate::queue::QueueSlot;
use crate::transport::Request;

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Position of the next batch within a payload of `len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    len: usize,
    batch_size: usize,
    offset: usize,
}

impl BatchCursor {
    pub fn new(len: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive"));
        }
        Ok(Self {
            len,
            batch_size,
            offset: 0,
        })
    }

    /// Range of the next batch; moves the cursor past it.
    pub fn take(&mut self) -> Option<Range<usize>> {
        if self.offset >= self.len {
            return None;
        }
        let start = self.offset;
        let end = (start + self.batch_size).min(self.len);
        self.offset = end;
        Some(start..end)
    }

    /// Reposition to the first byte of batch `index`.
    pub fn rewind_to(&mut self, index: usize) {
        self.offset = index.saturating_mul(self.batch_size).min(self.len);
    }

    pub fn batch_index(&self, range: &Range<usize>) -> usize {
        range.start / self.batch_size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    pub fn batch_count(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// A batch the peripheral confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWritten {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
    /// Bytes still to send after this batch.
    pub remaining: usize,
}

/// A batch that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFailure {
    pub index: usize,
    /// Offset of the failed batch's first byte.
    pub offset: usize,
    pub error: Error,
}

/// Decides after every confirmed batch whether to go on.  May wait, e.g.
/// for an application-level acknowledgement from the peripheral.
pub trait AckStrategy {
    fn acknowledge(&mut self, batch: &BatchWritten) -> impl Future<Output = bool>;
}

/// Decides whether a failed batch is written again.
pub trait RetryStrategy {
    fn should_retry(&mut self, failure: &BatchFailure) -> impl Future<Output = bool>;
}

/// Continue after every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateAck;

impl AckStrategy for ImmediateAck {
    async fn acknowledge(&mut self, _batch: &BatchWritten) -> bool {
        true
    }
}

/// Surface the first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    async fn should_retry(&mut self, _failure: &BatchFailure) -> bool {
        false
    }
}

/// Retry failed batches until `n` retries have been spent in the session.
#[derive(Debug, Clone, Copy)]
pub struct RetryUpTo(pub u32);

impl RetryStrategy for RetryUpTo {
    async fn should_retry(&mut self, failure: &BatchFailure) -> bool {
        if self.0 == 0 {
            return false;
        }
        self.0 -= 1;
        debug!(
            "long write: retrying batch {} at offset {} ({} left)",
            failure.index, failure.offset, self.0
        );
        true
    }
}

fn is_retryable(error: &Error) -> bool {
    matches!(error, Error::Status { .. } | Error::CannotStart(_))
}

// ---------------------------------------------------------------------------
// Options and session
// ---------------------------------------------------------------------------

/// Caller-facing settings for a long write.
pub struct LongWrite<A = ImmediateAck, R = NoRetry> {
    pub(crate) batch_size: Option<usize>,
    pub(crate) ack: A,
    pub(crate) retry: R,
}

impl LongWrite {
    pub fn new() -> Self {
        Self {
            batch_size: None,
            ack: ImmediateAck,
            retry: NoRetry,
        }
    }
}

impl Default for LongWrite {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: AckStrategy, R: RetryStrategy> LongWrite<A, R> {
    /// Fixed batch size instead of the MTU-derived one.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn ack<A2: AckStrategy>(self, ack: A2) -> LongWrite<A2, R> {
        LongWrite {
            batch_size: self.batch_size,
            ack,
            retry: self.retry,
        }
    }

    pub fn retry<R2: RetryStrategy>(self, retry: R2) -> LongWrite<A, R2> {
        LongWrite {
            batch_size: self.batch_size,
            ack: self.ack,
            retry,
        }
    }
}

/// The queued operation.  Holds the slot for the whole transfer; each batch
/// gets its own completion timeout.
pub struct LongWriteSession<A, R> {
    characteristic: CharacteristicId,
    payload: Vec<u8>,
    cursor: BatchCursor,
    ack: A,
    retry: R,
}

impl<A: AckStrategy, R: RetryStrategy> LongWriteSession<A, R> {
    pub fn new(
        characteristic: CharacteristicId,
        payload: Vec<u8>,
        batch_size: usize,
        ack: A,
        retry: R,
    ) -> Result<Self> {
        let cursor = BatchCursor::new(payload.len(), batch_size)?;
        Ok(Self {
            characteristic,
            payload,
            cursor,
            ack,
            retry,
        })
    }
}

impl<A: AckStrategy, R: RetryStrategy> Operation for LongWriteSession<A, R> {
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "long write"
    }

    async fn run(mut self, ctx: &OperationContext<'_>, _slot: &mut QueueSlot) -> Result<Vec<u8>> {
        let kind = OperationKind::CharacteristicWrite;
        let target = Target::Characteristic(self.characteristic);
        let timeout = ctx.config().operation_timeout();
        debug!(
            "long write: {} bytes to {} in {} batches",
            self.payload.len(),
            self.characteristic.uuid,
            self.cursor.batch_count()
        );

        while let Some(range) = self.cursor.take() {
            let index = self.cursor.batch_index(&range);
            let request = Request::WriteCharacteristic {
                characteristic: self.characteristic,
                value: &self.payload[range.clone()],
            };
            let outcome = match exchange(ctx, &request, kind, target, timeout).await {
                Ok(Exchange::Completed(event)) if event.status.is_success() => Ok(()),
                Ok(Exchange::Completed(event)) => Err(Error::Status {
                    kind,
                    status: event.status,
                }),
                Ok(Exchange::TimedOut) => Err(Error::Timeout(kind)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    let written = BatchWritten {
                        index,
                        offset: range.start,
                        len: range.len(),
                        remaining: self.cursor.remaining(),
                    };
                    if !self.ack.acknowledge(&written).await {
                        info!(
                            "long write: stopped by ack strategy after {} of {} bytes",
                            self.cursor.offset(),
                            self.payload.len()
                        );
                        return Ok(self.payload);
                    }
                }
                Err(error) => {
                    let failure = BatchFailure {
                        index,
                        offset: range.start,
                        error,
                    };
                    if is_retryable(&error) && self.retry.should_retry(&failure).await {
                        self.cursor.rewind_to(index);
                    } else {
                        return Err(error);
                    }
                }
            }
        }
        Ok(self.payload)
    }
}

// ── Tests ────────────────────────────────────────────────────
