//! Connection scope: the caller-facing handle over one GATT connection.
//!
//! ```text
//!                ┌──────────────────── Connection (Arc<Inner>) ────────────────────┐
//!   caller ───▶  │ discovery cache ─┐                                              │
//!                │ notifications ───┼──▶ OperationQueue ──▶ Operation::run ──▶ Transport
//!                │ long write ──────┘                             ▲                │
//!                │ background jobs ───────────────────────────────┤                │
//!                └────────────────────────────────────────────────┼────────────────┘
//!   binding ──▶ GattEvents: completions, value changes, link/adapter state, MTU
//! ```
//!
//! Everything scoped to one link lives here and is discarded with it.  Once
//! the disconnection router fires, the scope is finished: reservations fail,
//! streams end, and a new connection needs a new [`Connection`].

mod background;
mod completion;
mod disconnection;
mod discovery;
mod events;
mod mtu;
mod notification;

use core::future::Future;
use std::sync::Arc;

use embassy_time::Duration;
use futures_lite::future::or;
use log::{debug, info, warn};
use uuid::Uuid;

use background::{Background, Job};
use discovery::DiscoveryCache;

pub use completion::{CompletionRouter, CompletionWaiter};
pub use disconnection::DisconnectionRouter;
pub use events::{GattEvents, StateWatcher};
pub use mtu::MtuWatcher;
pub use notification::{NotificationStream, NotificationTable, SetupMode};

use crate::config::ConnectionConfig;
use crate::error::{DisconnectReason, Error, Result};
use crate::events::EventSink;
use crate::gatt::{Characteristic, ConnectionState, Properties, Services};
use crate::ops::{
    AckStrategy, Connect, Disconnect, LongWrite, LongWriteSession, Operation, OperationContext,
    ReadCharacteristic, ReadDescriptor, ReadPhy, ReadRssi, RequestConnectionPriority, RequestMtu,
    RetryStrategy, SetPreferredPhy, WriteCharacteristic, WriteDescriptor,
};
use crate::queue::{OperationQueue, Priority, QueueSlot, QueueStats};
use crate::transport::{ConnectionPriority, PhyCoding, PhyMask, PhyPair, Transport};

pub(crate) struct Inner {
    transport: Arc<dyn Transport>,
    events: Arc<GattEvents>,
    config: ConnectionConfig,
    queue: OperationQueue,
    discovery: DiscoveryCache,
    background: Background,
}

impl Inner {
    fn ctx(&self) -> OperationContext<'_> {
        OperationContext::new(self.transport.as_ref(), &self.events, &self.config)
    }

    /// Queue `job` behind every operation reserved so far.  Skipped once
    /// the scope is disconnected.
    pub(crate) fn schedule(&self, job: Job) {
        if let Some(e) = self.events.disconnection().error() {
            debug!("background: {} skipped ({})", job.name(), e);
            return;
        }
        let barrier = self.queue.next_seq();
        debug!("background: {} due from #{}", job.name(), barrier);
        self.background.push(barrier, job);
    }

    /// Reserve a place for `op` now; when its slot comes up, run the
    /// background jobs queued ahead of it first.
    fn submit<'a, O: Operation + 'a>(
        &'a self,
        op: O,
    ) -> impl Future<Output = Result<O::Output>> + 'a {
        let reserved = self.queue.reserve(op.priority(), op.name());
        async move {
            let ticket = reserved?;
            let seq = ticket.seq();
            self.queue
                .execute(ticket, Sequenced { inner: self, seq, op }, self.ctx())
                .await
        }
    }

    async fn run_due_jobs(&self, seq: u64, ctx: &OperationContext<'_>) {
        if self.events.disconnection().is_disconnected() {
            let dropped = self.background.clear();
            if dropped > 0 {
                debug!("background: {} jobs dropped, scope ended", dropped);
            }
            return;
        }
        while let Some((id, job)) = self.background.due(seq) {
            debug!("background: {} ahead of #{}", job.name(), seq);
            self.run_job(job, ctx).await;
            self.background.done(id);
        }
    }

    async fn run_job(&self, job: Job, ctx: &OperationContext<'_>) {
        match job {
            Job::Teardown(teardown) => {
                teardown.perform(ctx).await;
                info!("notify: {} torn down", teardown.characteristic.uuid);
            }
            Job::EnableWrite {
                characteristic,
                generation,
                descriptor,
                value,
            } => {
                let write = WriteDescriptor {
                    descriptor,
                    value: value.to_vec(),
                };
                if let Err(e) = write.perform(ctx).await {
                    warn!("notify: {} enable write failed ({})", characteristic.uuid, e);
                    if let Some(teardown) = self
                        .events
                        .notifications()
                        .fail_active(characteristic, generation, e)
                    {
                        self.schedule(Job::Teardown(teardown));
                    }
                }
            }
        }
    }
}

/// `op` preceded by the background jobs that were queued before it.
struct Sequenced<'a, O> {
    inner: &'a Inner,
    seq: u64,
    op: O,
}

impl<O: Operation> Operation for Sequenced<'_, O> {
    type Output = O::Output;

    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn priority(&self) -> Priority {
        self.op.priority()
    }

    fn preemptible(&self) -> bool {
        self.op.preemptible()
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<O::Output> {
        self.inner.run_due_jobs(self.seq, ctx).await;
        self.op.run(ctx, slot).await
    }
}

/// Slot taken by the driver when jobs are waiting and nothing else is
/// queued.  The jobs run ahead of it.
struct DrainJobs;

impl Operation for DrainJobs {
    type Output = ();

    fn name(&self) -> &'static str {
        "background jobs"
    }

    async fn run(self, _ctx: &OperationContext<'_>, _slot: &mut QueueSlot) -> Result<()> {
        Ok(())
    }
}

/// Cloneable handle over one connection scope.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Build a scope around `transport`.  The binding delivers its callbacks
    /// to `events`.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: Arc<GattEvents>,
        config: ConnectionConfig,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        config.validate()?;
        if !transport.adapter_usable() {
            events.report_disconnection(DisconnectReason::AdapterUnusable);
        }
        let queue = OperationQueue::new(events.disconnection().clone(), sink);
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                events,
                config,
                queue,
                discovery: DiscoveryCache::new(),
                background: Background::new(),
            }),
        })
    }

    pub fn events(&self) -> &Arc<GattEvents> {
        &self.inner.events
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Last link state reported by the binding.
    pub fn state(&self) -> ConnectionState {
        self.inner.events.state()
    }

    pub fn disconnection_error(&self) -> Option<Error> {
        self.inner.events.disconnection().error()
    }

    /// Resolves with the terminal error once the scope is disconnected.
    pub async fn wait_disconnected(&self) -> Error {
        self.inner.events.disconnection().wait().await
    }

    /// Watch link state changes.  `None` when every watcher slot is taken.
    pub fn state_changes(&self) -> Option<StateWatcher<'_>> {
        self.inner.events.watch_state()
    }

    // ── Link ────────────────────────────────────────────────────

    pub async fn connect(&self, auto_connect: bool) -> Result<()> {
        self.inner.submit(Connect { auto_connect }).await
    }

    /// Close the link and end the scope.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.events.disconnection().is_disconnected() {
            return Ok(());
        }
        let result = self.inner.submit(Disconnect).await;
        self.inner
            .events
            .report_disconnection(DisconnectReason::Requested);
        result
    }

    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        self.inner.submit(RequestMtu { mtu }).await
    }

    pub fn mtu(&self) -> u16 {
        self.inner.events.mtu().current()
    }

    pub async fn read_rssi(&self) -> Result<i16> {
        self.inner.submit(ReadRssi).await
    }

    /// Holds the queue for `settle` after the request so the new interval
    /// is in effect before the next operation.
    pub async fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
        settle: Duration,
    ) -> Result<()> {
        self.inner
            .submit(RequestConnectionPriority { priority, settle })
            .await
    }

    pub async fn read_phy(&self) -> Result<PhyPair> {
        self.inner.submit(ReadPhy).await
    }

    /// Resolves with the PHYs in use after the update.
    pub async fn set_preferred_phy(
        &self,
        tx: PhyMask,
        rx: PhyMask,
        coding: PhyCoding,
    ) -> Result<PhyPair> {
        self.inner.submit(SetPreferredPhy { tx, rx, coding }).await
    }

    // ── Attributes ──────────────────────────────────────────────

    /// Resolve `uuid` against the discovered table.
    pub async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        let services = self.discover_services().await?;
        services.characteristic(uuid).cloned()
    }

    /// Services from a finished discovery, without starting one.
    pub fn cached_services(&self) -> Option<Services> {
        self.inner.discovery.cached()
    }

    fn check_properties(&self, characteristic: &Characteristic, required: Properties) -> Result<()> {
        match characteristic.require(required) {
            Err(e) if self.inner.config.strict_property_checks => Err(e),
            Err(_) => {
                warn!(
                    "{} declares {}, needs {}; trying anyway",
                    characteristic.uuid(),
                    characteristic.properties,
                    required
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid).await?;
        self.check_properties(&characteristic, Properties::READ)?;
        self.inner
            .submit(ReadCharacteristic {
                characteristic: characteristic.id,
            })
            .await
    }

    /// Single write.  Resolves with the bytes written.
    pub async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid).await?;
        self.check_properties(&characteristic, Properties::ANY_WRITE)?;
        self.inner
            .submit(WriteCharacteristic {
                characteristic: characteristic.id,
                value: value.to_vec(),
            })
            .await
    }

    pub async fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>> {
        let services = self.discover_services().await?;
        let descriptor = services.descriptor(service, characteristic, descriptor)?;
        self.inner.submit(ReadDescriptor { descriptor }).await
    }

    pub async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let services = self.discover_services().await?;
        let descriptor = services.descriptor(service, characteristic, descriptor)?;
        self.inner
            .submit(WriteDescriptor {
                descriptor,
                value: value.to_vec(),
            })
            .await
    }

    /// Write `payload` in batches under one queue slot.
    ///
    /// The batch size is taken from `options`, then from the configuration,
    /// then from the current MTU.  Resolves with `payload` once the transfer
    /// ends, including when the ack strategy stops it early.
    pub async fn long_write<A: AckStrategy, R: RetryStrategy>(
        &self,
        uuid: Uuid,
        payload: &[u8],
        options: LongWrite<A, R>,
    ) -> Result<Vec<u8>> {
        let batch_size = options
            .batch_size
            .or(self.inner.config.long_write_batch_size.map(usize::from))
            .unwrap_or_else(|| self.inner.events.mtu().payload_limit());
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive"));
        }
        let characteristic = self.characteristic(uuid).await?;
        self.check_properties(&characteristic, Properties::ANY_WRITE)?;
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let session = LongWriteSession::new(
            characteristic.id,
            payload.to_vec(),
            batch_size,
            options.ack,
            options.retry,
        )?;
        self.inner.submit(session).await
    }

    /// Run a caller-defined operation through the queue.  The place in line
    /// is taken when this is called, not when the future is first polled.
    pub fn queue<'a, O: Operation + 'a>(
        &'a self,
        op: O,
    ) -> impl Future<Output = Result<O::Output>> + 'a {
        self.inner.submit(op)
    }

    // ── Driver ──────────────────────────────────────────────────

    /// Background driver.  Notification teardowns and quick-setup
    /// descriptor writes otherwise wait for the next queued operation; this
    /// runs them as soon as they are pushed.  Returns once the scope is
    /// disconnected.
    pub async fn run(&self) {
        let router = self.inner.events.disconnection();
        while !router.is_disconnected() {
            if self.inner.background.is_empty() {
                or(self.inner.background.woken(), async {
                    router.wait().await;
                })
                .await;
                continue;
            }
            if let Err(e) = self.inner.submit(DrainJobs).await {
                debug!("driver: {}", e);
            }
        }
        let dropped = self.inner.background.clear();
        info!("driver: scope ended, {} jobs dropped", dropped);
    }
}
