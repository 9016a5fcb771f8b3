//! Operations: units of work that hold the queue slot while they talk to
//! the transport.
//!
//! Each kind is a small struct implementing [`Operation`].  Most of them are
//! a single request/response exchange run through [`SingleResponse`]; the
//! long write drives [`exchange`] several times under one slot.  Background
//! jobs (notification teardown, quick-setup writes) have no slot of their
//! own and borrow the one held by whichever operation runs them.

pub mod gatt;
pub mod link;
pub mod long_write;

use core::future::Future;

use embassy_time::{Duration, with_timeout};
use log::debug;

use crate::config::ConnectionConfig;
use crate::connection::GattEvents;
use crate::error::{Error, Result};
use crate::gatt::{GattStatus, OperationKind, Target};
use crate::queue::{Priority, QueueSlot};
use crate::transport::{CompletionEvent, Payload, Request, Transport};

pub use gatt::{
    LocalNotification, NotificationTeardown, ReadCharacteristic, ReadDescriptor,
    WriteCharacteristic, WriteDescriptor,
};
pub use link::{
    Connect, DiscoverServices, Disconnect, ReadPhy, ReadRssi, RequestConnectionPriority,
    RequestMtu, SetPreferredPhy,
};
pub use long_write::{
    AckStrategy, BatchCursor, BatchFailure, BatchWritten, ImmediateAck, LongWrite, LongWriteSession,
    NoRetry, RetryStrategy, RetryUpTo,
};

/// A unit of work serialized by the [`OperationQueue`](crate::queue::OperationQueue).
///
/// `run` is entered once the slot is granted.  It may call
/// [`QueueSlot::release`] early when it no longer needs exclusive access;
/// the queue releases the slot after `run` returns in any case.
pub trait Operation {
    type Output;

    fn name(&self) -> &'static str;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Whether a disconnection aborts this operation while it is queued or
    /// running.
    fn preemptible(&self) -> bool {
        true
    }

    fn run(
        self,
        ctx: &OperationContext<'_>,
        slot: &mut QueueSlot,
    ) -> impl Future<Output = Result<Self::Output>>;
}

/// What an operation may touch while it holds the slot.
#[derive(Clone, Copy)]
pub struct OperationContext<'a> {
    transport: &'a dyn Transport,
    events: &'a GattEvents,
    config: &'a ConnectionConfig,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        events: &'a GattEvents,
        config: &'a ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            events,
            config,
        }
    }

    pub fn transport(&self) -> &'a dyn Transport {
        self.transport
    }

    pub fn events(&self) -> &'a GattEvents {
        self.events
    }

    pub fn config(&self) -> &'a ConnectionConfig {
        self.config
    }
}

// ---------------------------------------------------------------------------
// Request/response exchange
// ---------------------------------------------------------------------------

/// Outcome of one start + await cycle.
#[derive(Debug)]
pub enum Exchange {
    Completed(CompletionEvent),
    TimedOut,
}

/// Register interest in `(kind, target)`, start `request`, and race the
/// matching completion against `timeout`.
///
/// Interest is registered before the start call, so a completion delivered
/// from inside `start` is not lost.  A completion arriving after the timeout
/// finds no waiter and is discarded by the router.
pub async fn exchange(
    ctx: &OperationContext<'_>,
    request: &Request<'_>,
    kind: OperationKind,
    target: Target,
    timeout: Duration,
) -> Result<Exchange> {
    let waiter = ctx.events.completions().register(kind, target);
    if !ctx.transport.start(request) {
        debug!("{}: start rejected", request.kind());
        return Err(Error::CannotStart(request.kind()));
    }
    Ok(match with_timeout(timeout, waiter).await {
        Ok(event) => Exchange::Completed(event),
        Err(_) => Exchange::TimedOut,
    })
}

/// Single-response protocol: one request, one matching completion.
#[derive(Debug, Clone, Copy)]
pub struct SingleResponse {
    pub kind: OperationKind,
    pub target: Target,
    pub timeout: Duration,
}

impl SingleResponse {
    pub fn new(kind: OperationKind, target: Target, timeout: Duration) -> Self {
        Self {
            kind,
            target,
            timeout,
        }
    }

    /// Run the exchange, release the slot, and map the result.  A timeout
    /// yields [`Error::Timeout`].
    pub async fn run<T>(
        self,
        ctx: &OperationContext<'_>,
        slot: &mut QueueSlot,
        request: &Request<'_>,
        map: impl FnOnce(Payload) -> Result<T>,
    ) -> Result<T> {
        let kind = request.kind();
        self.run_with_fallback(ctx, slot, request, map, || Err(Error::Timeout(kind)))
            .await
    }

    /// As [`run`](Self::run), with `on_timeout` deciding the timeout outcome.
    pub async fn run_with_fallback<T>(
        self,
        ctx: &OperationContext<'_>,
        slot: &mut QueueSlot,
        request: &Request<'_>,
        map: impl FnOnce(Payload) -> Result<T>,
        on_timeout: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let outcome = exchange(ctx, request, self.kind, self.target, self.timeout).await;
        slot.release();
        self.settle(request, outcome, map, on_timeout)
    }

    /// The exchange alone, for work that runs inside a slot held by another
    /// operation.
    pub async fn run_unslotted<T>(
        self,
        ctx: &OperationContext<'_>,
        request: &Request<'_>,
        map: impl FnOnce(Payload) -> Result<T>,
    ) -> Result<T> {
        let kind = request.kind();
        let outcome = exchange(ctx, request, self.kind, self.target, self.timeout).await;
        self.settle(request, outcome, map, || Err(Error::Timeout(kind)))
    }

    fn settle<T>(
        &self,
        request: &Request<'_>,
        outcome: Result<Exchange>,
        map: impl FnOnce(Payload) -> Result<T>,
        on_timeout: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        match outcome? {
            Exchange::Completed(event) if event.status.is_success() => map(event.payload),
            Exchange::Completed(event) => Err(Error::Status {
                kind: request.kind(),
                status: event.status,
            }),
            Exchange::TimedOut => {
                debug!("{}: no completion within {} ms", request.kind(), self.timeout.as_millis());
                on_timeout()
            }
        }
    }
}

/// A completion whose payload does not fit its kind is a binding fault and
/// is reported as a generic GATT error.
pub(crate) fn malformed(kind: OperationKind) -> Error {
    Error::Status {
        kind,
        status: GattStatus::GATT_ERROR,
    }
}

pub(crate) fn expect_value(kind: OperationKind, payload: Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Value(v) => Ok(v),
        Payload::None => Ok(Vec::new()),
        _ => Err(malformed(kind)),
    }
}
