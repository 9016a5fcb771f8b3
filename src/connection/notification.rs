//! Notification / indication multiplexer.
//!
//! One physical subscription per characteristic, shared by any number of
//! [`NotificationStream`]s through a subscriber list:
//!
//! ```text
//!   INACTIVE ──first subscribe──▶ PENDING ──setup ok──▶ ACTIVE(mode)
//!      ▲                             │ setup failed            │ same mode: attach
//!      │                             ▼                         │ other mode: conflict
//!      └──────────────── entry removed ◀── last subscriber detaches
//!                                            (teardown queued)
//! ```
//!
//! Setup modes:
//! - `Default`: local enable, then descriptor write, then the stream exists.
//! - `QuickSetup`: local enable, stream exists at once, the descriptor write
//!   runs in the background and its failure terminates the stream.
//! - `Compat`: local enable only.

use core::cell::RefCell;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::collections::HashMap;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use futures_lite::future::or;
use futures_lite::stream::Stream;
use heapless::Deque;
use log::{debug, info, warn};
use uuid::Uuid;

use super::background::Job;
use super::{Connection, Inner};
use crate::config::MAX_NOTIFICATION_BUFFER;
use crate::error::{Error, Result};
use crate::gatt::{
    CLIENT_CHARACTERISTIC_CONFIG, CharacteristicId, DescriptorId, NotificationMode,
    OperationKind, Properties,
};
use crate::ops::{LocalNotification, NotificationTeardown, WriteDescriptor};
use crate::sync::OnceBroadcast;

/// How the client configuration descriptor is handled on first subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupMode {
    #[default]
    Default,
    QuickSetup,
    /// For peripherals without a usable configuration descriptor.
    Compat,
}

// ---------------------------------------------------------------------------
// Subscriber inbox
// ---------------------------------------------------------------------------

struct Inbox {
    buffer: Deque<Vec<u8>, MAX_NOTIFICATION_BUFFER>,
    capacity: usize,
    waker: Option<Waker>,
    terminal: Option<Error>,
    dropped: u32,
}

pub(crate) struct Subscriber {
    id: u64,
    inbox: Mutex<CriticalSectionRawMutex, RefCell<Inbox>>,
}

impl Subscriber {
    fn new(id: u64, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            inbox: Mutex::new(RefCell::new(Inbox {
                buffer: Deque::new(),
                capacity: capacity.clamp(1, MAX_NOTIFICATION_BUFFER),
                waker: None,
                terminal: None,
                dropped: 0,
            })),
        })
    }

    /// Buffer `value`, evicting the oldest one when full.
    fn push(&self, value: &[u8]) -> Option<Waker> {
        self.inbox.lock(|i| {
            let mut i = i.borrow_mut();
            if i.buffer.len() >= i.capacity {
                i.buffer.pop_front();
                i.dropped += 1;
                warn!(
                    "notify: subscriber {} lagging, dropped {} values",
                    self.id, i.dropped
                );
            }
            // Capacity is clamped to the deque size, so this cannot fail.
            let _ = i.buffer.push_back(value.to_vec());
            i.waker.take()
        })
    }

    fn terminate(&self, error: Error) -> Option<Waker> {
        self.inbox.lock(|i| {
            let mut i = i.borrow_mut();
            i.terminal.get_or_insert(error);
            i.waker.take()
        })
    }
}

// ---------------------------------------------------------------------------
// Characteristic table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetupOutcome {
    Ready,
    Failed(Error),
    /// The leading subscriber went away mid-setup; followers start over.
    Abandoned,
}

enum Phase {
    Pending(Arc<OnceBroadcast<SetupOutcome>>),
    Active,
}

struct Entry {
    generation: u64,
    mode: NotificationMode,
    teardown: NotificationTeardown,
    phase: Phase,
    subscribers: Vec<Arc<Subscriber>>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<CharacteristicId, Entry>,
    next_generation: u64,
    next_subscriber: u64,
}

impl Table {
    fn new_subscriber(&mut self, capacity: usize) -> Arc<Subscriber> {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        Subscriber::new(id, capacity)
    }
}

pub(crate) enum Begin {
    Lead { generation: u64 },
    Follow(Arc<OnceBroadcast<SetupOutcome>>),
    Attached {
        generation: u64,
        subscriber: Arc<Subscriber>,
    },
    Conflict(NotificationMode),
}

/// Characteristic identity → subscription entry.
pub struct NotificationTable {
    table: Mutex<CriticalSectionRawMutex, RefCell<Table>>,
}

impl NotificationTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(Table::default())),
        }
    }

    pub(crate) fn begin(
        &self,
        id: CharacteristicId,
        mode: NotificationMode,
        teardown: NotificationTeardown,
        capacity: usize,
    ) -> Begin {
        self.table.lock(|t| {
            let mut t = t.borrow_mut();
            if let Some(entry) = t.entries.get(&id) {
                if entry.mode != mode {
                    return Begin::Conflict(entry.mode);
                }
                if let Phase::Pending(outcome) = &entry.phase {
                    return Begin::Follow(outcome.clone());
                }
                let generation = entry.generation;
                let subscriber = t.new_subscriber(capacity);
                if let Some(entry) = t.entries.get_mut(&id) {
                    entry.subscribers.push(subscriber.clone());
                }
                return Begin::Attached {
                    generation,
                    subscriber,
                };
            }
            let generation = t.next_generation;
            t.next_generation += 1;
            t.entries.insert(
                id,
                Entry {
                    generation,
                    mode,
                    teardown,
                    phase: Phase::Pending(Arc::new(OnceBroadcast::new())),
                    subscribers: Vec::new(),
                },
            );
            Begin::Lead { generation }
        })
    }

    /// Pending → Active.  Returns the leader's subscriber.
    pub(crate) fn activate(
        &self,
        id: CharacteristicId,
        generation: u64,
        capacity: usize,
    ) -> Option<Arc<Subscriber>> {
        let activated = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let subscriber = t.new_subscriber(capacity);
            let entry = t
                .entries
                .get_mut(&id)
                .filter(|e| e.generation == generation)?;
            let Phase::Pending(outcome) = core::mem::replace(&mut entry.phase, Phase::Active)
            else {
                return None;
            };
            entry.subscribers.push(subscriber.clone());
            Some((subscriber, outcome))
        });
        let (subscriber, outcome) = activated?;
        outcome.set(SetupOutcome::Ready);
        info!("notify: {} active", id.uuid);
        Some(subscriber)
    }

    /// Drop a still-pending entry and tell its followers why.
    pub(crate) fn fail_setup(&self, id: CharacteristicId, generation: u64, why: SetupOutcome) {
        let outcome = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let pending = matches!(
                t.entries.get(&id),
                Some(e) if e.generation == generation && matches!(e.phase, Phase::Pending(_))
            );
            if !pending {
                return None;
            }
            match t.entries.remove(&id).map(|e| e.phase) {
                Some(Phase::Pending(outcome)) => Some(outcome),
                _ => None,
            }
        });
        if let Some(outcome) = outcome {
            outcome.set(why);
        }
    }

    /// Terminate an active entry with `error`.  Every subscriber sees the
    /// error; the caller schedules the returned teardown.
    pub(crate) fn fail_active(
        &self,
        id: CharacteristicId,
        generation: u64,
        error: Error,
    ) -> Option<NotificationTeardown> {
        let removed = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            if t.entries.get(&id).is_some_and(|e| e.generation == generation) {
                t.entries.remove(&id)
            } else {
                None
            }
        })?;
        for subscriber in &removed.subscribers {
            if let Some(waker) = subscriber.terminate(error) {
                waker.wake();
            }
        }
        Some(removed.teardown)
    }

    /// Remove one subscriber.  When it was the last, the entry goes away and
    /// its teardown is returned.
    pub(crate) fn detach(
        &self,
        id: CharacteristicId,
        generation: u64,
        subscriber: u64,
    ) -> Option<NotificationTeardown> {
        self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let entry = t
                .entries
                .get_mut(&id)
                .filter(|e| e.generation == generation)?;
            entry.subscribers.retain(|s| s.id != subscriber);
            if entry.subscribers.is_empty() && matches!(entry.phase, Phase::Active) {
                t.entries.remove(&id).map(|e| e.teardown)
            } else {
                None
            }
        })
    }

    /// Fan a value-changed callback out to every subscriber of an active
    /// entry.  Returns the number of subscribers reached.
    pub fn dispatch(&self, id: CharacteristicId, value: &[u8]) -> usize {
        let subscribers = self.table.lock(|t| {
            t.borrow()
                .entries
                .get(&id)
                .filter(|e| matches!(e.phase, Phase::Active))
                .map(|e| e.subscribers.clone())
                .unwrap_or_default()
        });
        if subscribers.is_empty() {
            debug!("notify: value for {} with no active subscription", id.uuid);
        }
        for subscriber in &subscribers {
            if let Some(waker) = subscriber.push(value) {
                waker.wake();
            }
        }
        subscribers.len()
    }

    pub fn is_active(&self, id: CharacteristicId) -> bool {
        self.table.lock(|t| {
            t.borrow()
                .entries
                .get(&id)
                .is_some_and(|e| matches!(e.phase, Phase::Active))
        })
    }

    pub fn subscriber_count(&self, id: CharacteristicId) -> usize {
        self.table.lock(|t| {
            t.borrow()
                .entries
                .get(&id)
                .map_or(0, |e| e.subscribers.len())
        })
    }
}

impl Default for NotificationTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// One logical subscriber.  Yields values in arrival order, then at most one
/// error (descriptor-write failure in quick setup, or disconnection) after
/// which it ends.  Dropping the last stream of a characteristic queues the
/// teardown.
pub struct NotificationStream {
    inner: Arc<Inner>,
    characteristic: CharacteristicId,
    mode: NotificationMode,
    generation: u64,
    subscriber: Arc<Subscriber>,
    listener: Option<u64>,
    finished: bool,
}

impl NotificationStream {
    pub fn characteristic(&self) -> CharacteristicId {
        self.characteristic
    }

    pub fn mode(&self) -> NotificationMode {
        self.mode
    }

    /// Values evicted because this subscriber fell behind.
    pub fn dropped(&self) -> u32 {
        self.subscriber.inbox.lock(|i| i.borrow().dropped)
    }
}

impl Stream for NotificationStream {
    type Item = Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let next = this.subscriber.inbox.lock(|i| {
            let mut i = i.borrow_mut();
            if let Some(value) = i.buffer.pop_front() {
                return Some(Ok(value));
            }
            if let Some(error) = i.terminal.take() {
                return Some(Err(error));
            }
            i.waker = Some(cx.waker().clone());
            None
        });
        if let Some(item) = next {
            this.finished = item.is_err();
            return Poll::Ready(Some(item));
        }
        let router = this.inner.events.disconnection();
        match router.poll_wait(&mut this.listener, cx) {
            Poll::Ready(error) => {
                this.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.inner
            .events
            .disconnection()
            .forget(&mut self.listener);
        if let Some(teardown) = self.inner.events.notifications().detach(
            self.characteristic,
            self.generation,
            self.subscriber.id,
        ) {
            info!("notify: last subscriber of {} gone", self.characteristic.uuid);
            self.inner.schedule(Job::Teardown(teardown));
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription setup
// ---------------------------------------------------------------------------

/// Held by the leading subscriber while the entry is pending.
struct SetupGuard<'a> {
    inner: &'a Arc<Inner>,
    id: CharacteristicId,
    generation: u64,
    teardown: NotificationTeardown,
    enabled_locally: bool,
    armed: bool,
}

impl SetupGuard<'_> {
    fn fail(&mut self, error: Error) {
        self.armed = false;
        self.inner
            .events
            .notifications()
            .fail_setup(self.id, self.generation, SetupOutcome::Failed(error));
    }
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!("notify: setup of {} abandoned", self.id.uuid);
        self.inner
            .events
            .notifications()
            .fail_setup(self.id, self.generation, SetupOutcome::Abandoned);
        if self.enabled_locally {
            self.inner.schedule(Job::Teardown(self.teardown));
        }
    }
}

impl Connection {
    /// Subscribe to notifications of the characteristic `uuid`.
    pub async fn setup_notification(&self, uuid: Uuid, setup: SetupMode) -> Result<NotificationStream> {
        self.subscribe(uuid, NotificationMode::Notification, setup)
            .await
    }

    /// Subscribe to indications of the characteristic `uuid`.
    pub async fn setup_indication(&self, uuid: Uuid, setup: SetupMode) -> Result<NotificationStream> {
        self.subscribe(uuid, NotificationMode::Indication, setup)
            .await
    }

    async fn subscribe(
        &self,
        uuid: Uuid,
        mode: NotificationMode,
        setup: SetupMode,
    ) -> Result<NotificationStream> {
        let characteristic = self.characteristic(uuid).await?;
        self.check_properties(
            &characteristic,
            match mode {
                NotificationMode::Notification => Properties::NOTIFY,
                NotificationMode::Indication => Properties::INDICATE,
            },
        )?;
        let descriptor = match setup {
            SetupMode::Compat => None,
            SetupMode::Default | SetupMode::QuickSetup => {
                Some(characteristic.descriptor(CLIENT_CHARACTERISTIC_CONFIG)?)
            }
        };
        let values = self.inner.config.notification_values;
        let teardown = NotificationTeardown {
            characteristic: characteristic.id,
            descriptor,
            disable: values.disable,
        };
        let enable = match mode {
            NotificationMode::Notification => values.notify,
            NotificationMode::Indication => values.indicate,
        };
        let capacity = self.inner.config.notification_buffer;
        let table = self.inner.events.notifications();
        let router = self.inner.events.disconnection();

        loop {
            match table.begin(characteristic.id, mode, teardown, capacity) {
                Begin::Conflict(active) => {
                    return Err(Error::ConflictingSubscriptionMode {
                        characteristic: uuid,
                        active,
                    });
                }
                Begin::Attached {
                    generation,
                    subscriber,
                } => {
                    debug!("notify: {} attached subscriber {}", uuid, subscriber.id);
                    return Ok(self.stream(characteristic.id, mode, generation, subscriber));
                }
                Begin::Follow(outcome) => {
                    let outcome = or(outcome.wait(), async {
                        SetupOutcome::Failed(router.wait().await)
                    })
                    .await;
                    if let SetupOutcome::Failed(error) = outcome {
                        return Err(error);
                    }
                }
                Begin::Lead { generation } => {
                    let guard = SetupGuard {
                        inner: &self.inner,
                        id: characteristic.id,
                        generation,
                        teardown,
                        enabled_locally: false,
                        armed: true,
                    };
                    return self.lead_setup(guard, setup, descriptor, enable, mode).await;
                }
            }
        }
    }

    async fn lead_setup(
        &self,
        mut guard: SetupGuard<'_>,
        setup: SetupMode,
        descriptor: Option<DescriptorId>,
        enable: [u8; 2],
        mode: NotificationMode,
    ) -> Result<NotificationStream> {
        let id = guard.id;
        let generation = guard.generation;

        let local = LocalNotification {
            characteristic: id,
            enable: true,
        };
        if let Err(error) = self.inner.submit(local).await {
            guard.fail(error);
            return Err(error);
        }
        guard.enabled_locally = true;

        if let (SetupMode::Default, Some(descriptor)) = (setup, descriptor) {
            let write = WriteDescriptor {
                descriptor,
                value: enable.to_vec(),
            };
            if let Err(error) = self.inner.submit(write).await {
                guard.fail(error);
                self.inner.schedule(Job::Teardown(NotificationTeardown {
                    descriptor: None,
                    ..guard.teardown
                }));
                return Err(error);
            }
        }

        let capacity = self.inner.config.notification_buffer;
        let Some(subscriber) = self
            .inner
            .events
            .notifications()
            .activate(id, generation, capacity)
        else {
            guard.fail(Error::CannotStart(OperationKind::LocalNotification));
            return Err(self
                .inner
                .events
                .disconnection()
                .error()
                .unwrap_or(Error::CannotStart(OperationKind::LocalNotification)));
        };
        guard.armed = false;

        if let (SetupMode::QuickSetup, Some(descriptor)) = (setup, descriptor) {
            self.inner.schedule(Job::EnableWrite {
                characteristic: id,
                generation,
                descriptor,
                value: enable,
            });
        }
        Ok(self.stream(id, mode, generation, subscriber))
    }

    fn stream(
        &self,
        characteristic: CharacteristicId,
        mode: NotificationMode,
        generation: u64,
        subscriber: Arc<Subscriber>,
    ) -> NotificationStream {
        NotificationStream {
            inner: self.inner.clone(),
            characteristic,
            mode,
            generation,
            subscriber,
            listener: None,
            finished: false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
