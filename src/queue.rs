//! Single-concurrency, priority-ordered operation queue.
//!
//! ```text
//!   reserve() ──▶ pending [HIGH … NORMAL … LOW]   (FIFO within a priority)
//!                         │ schedule(): slot free?
//!                         ▼
//!                   running: Option<seq> ──▶ QueueSlot (released exactly once)
//! ```
//!
//! The queue has no worker of its own: whoever awaits a [`Ticket`] drives the
//! operation once the slot is granted.  A ticket dropped before its turn is
//! removed without ever starting; a granted ticket or slot that is dropped
//! releases the slot and hands it to the next pending entry.
//!
//! After the disconnection router fires, new reservations fail immediately
//! and every pending or running operation that is preemptible resolves with
//! the cached disconnection error.

use core::cell::{Cell, RefCell};
use core::future::Future;
use core::task::{Context, Poll, Waker};

use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use futures_lite::future::{or, poll_fn};
use log::debug;

use crate::connection::DisconnectionRouter;
use crate::error::Result;
use crate::events::{EventSink, OperationEvent};
use crate::ops::{Operation, OperationContext};

/// Scheduling priority.  Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Slot grants.
    pub started: u64,
    /// Slot releases.  Equals `started` whenever the queue is idle.
    pub released: u64,
    /// Entries cancelled before their turn.
    pub removed: u64,
}

struct Entry {
    seq: u64,
    priority: Priority,
    waker: Option<Waker>,
}

struct QueueState {
    pending: Vec<Entry>,
    running: Option<u64>,
    next_seq: u64,
    stats: QueueStats,
}

impl QueueState {
    /// Grant the slot to the best pending entry if it is free.
    fn schedule(&mut self) -> Option<Waker> {
        if self.running.is_some() {
            return None;
        }
        let idx = self
            .pending
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)?;
        let entry = self.pending.remove(idx);
        self.running = Some(entry.seq);
        self.stats.started += 1;
        entry.waker
    }
}

struct Shared {
    state: Mutex<CriticalSectionRawMutex, RefCell<QueueState>>,
    router: Arc<DisconnectionRouter>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Shared {
    fn emit(&self, event: OperationEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(&event);
        }
    }

    fn release(&self, seq: u64) {
        let next = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.running != Some(seq) {
                return None;
            }
            s.running = None;
            s.stats.released += 1;
            Some(s.schedule())
        });
        let Some(next) = next else {
            return;
        };
        debug!("queue: #{} released", seq);
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

#[derive(Clone)]
pub struct OperationQueue {
    shared: Arc<Shared>,
}

impl OperationQueue {
    pub fn new(router: Arc<DisconnectionRouter>, sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RefCell::new(QueueState {
                    pending: Vec::new(),
                    running: None,
                    next_seq: 0,
                    stats: QueueStats::default(),
                })),
                router,
                sink,
            }),
        }
    }

    /// Take a place in line.  Fails with the cached error once the
    /// connection scope has been disconnected.
    pub fn reserve(&self, priority: Priority, name: &'static str) -> Result<Ticket> {
        if let Some(err) = self.shared.router.error() {
            return Err(err);
        }
        let (seq, waker) = self.shared.state.lock(|s| {
            let mut s = s.borrow_mut();
            let seq = s.next_seq;
            s.next_seq += 1;
            s.pending.push(Entry {
                seq,
                priority,
                waker: None,
            });
            (seq, s.schedule())
        });
        if let Some(waker) = waker {
            waker.wake();
        }
        debug!("queue: #{} {} queued ({:?})", seq, name, priority);
        self.shared.emit(OperationEvent::Queued {
            name,
            seq,
            priority,
        });
        Ok(Ticket {
            shared: self.shared.clone(),
            seq,
            name,
            armed: true,
        })
    }

    /// Reserve a place now and run `op` when the returned future is awaited.
    ///
    /// The reservation happens at call time, so arrival order is the order
    /// of `enqueue` calls, not of first polls.
    pub fn enqueue<'a, O>(
        &'a self,
        op: O,
        ctx: OperationContext<'a>,
    ) -> impl Future<Output = Result<O::Output>> + 'a
    where
        O: Operation + 'a,
    {
        let reserved = self.reserve(op.priority(), op.name());
        async move { self.execute(reserved?, op, ctx).await }
    }

    /// Run `op` under a ticket obtained earlier from [`reserve`](Self::reserve).
    pub async fn execute<O: Operation>(
        &self,
        ticket: Ticket,
        op: O,
        ctx: OperationContext<'_>,
    ) -> Result<O::Output> {
        let seq = ticket.seq;
        let name = op.name();
        let preemptible = op.preemptible();
        let started = Cell::new(None);

        let run = async {
            let mut slot = ticket.acquire().await;
            started.set(Some(Instant::now()));
            debug!("queue: #{} {} started", seq, name);
            self.shared.emit(OperationEvent::Started { name, seq });
            let result = op.run(&ctx, &mut slot).await;
            slot.release();
            result
        };

        let result = if preemptible {
            let router = &self.shared.router;
            or(async { Err(router.wait().await) }, run).await
        } else {
            run.await
        };

        match (&result, started.get()) {
            (Ok(_), Some(at)) => self.shared.emit(OperationEvent::Succeeded {
                name,
                seq,
                elapsed: at.elapsed(),
            }),
            (Ok(_), None) => {}
            (Err(error), _) => self.shared.emit(OperationEvent::Failed {
                name,
                seq,
                error: *error,
            }),
        }
        result
    }

    /// Sequence number the next reservation will get.
    pub fn next_seq(&self) -> u64 {
        self.shared.state.lock(|s| s.borrow().next_seq)
    }

    /// Sequence number of the slot holder.
    pub fn running(&self) -> Option<u64> {
        self.shared.state.lock(|s| s.borrow().running)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock(|s| s.borrow().pending.len())
    }

    pub fn is_idle(&self) -> bool {
        self.shared.state.lock(|s| {
            let s = s.borrow();
            s.running.is_none() && s.pending.is_empty()
        })
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.state.lock(|s| s.borrow().stats)
    }
}

// ---------------------------------------------------------------------------
// Ticket: a place in line
// ---------------------------------------------------------------------------

/// A reserved position.  Dropping it before [`acquire`](Self::acquire)
/// completes removes the entry (or releases the slot if it was already
/// granted).
pub struct Ticket {
    shared: Arc<Shared>,
    seq: u64,
    name: &'static str,
    armed: bool,
}

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for this ticket's turn and take the slot.
    pub async fn acquire(mut self) -> QueueSlot {
        poll_fn(|cx| self.poll_turn(cx)).await;
        self.armed = false;
        QueueSlot {
            shared: self.shared.clone(),
            seq: self.seq,
            released: false,
        }
    }

    fn poll_turn(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let seq = self.seq;
        self.shared.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.running == Some(seq) {
                return Poll::Ready(());
            }
            if let Some(entry) = s.pending.iter_mut().find(|e| e.seq == seq) {
                entry.waker = Some(cx.waker().clone());
            }
            Poll::Pending
        })
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let seq = self.seq;
        let granted = self.shared.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.running == Some(seq) {
                true
            } else {
                s.pending.retain(|e| e.seq != seq);
                s.stats.removed += 1;
                false
            }
        });
        if granted {
            self.shared.release(seq);
        } else {
            debug!("queue: #{} {} removed before start", seq, self.name);
            self.shared.emit(OperationEvent::Removed {
                name: self.name,
                seq,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// QueueSlot: exclusive transport access
// ---------------------------------------------------------------------------

/// Proof of exclusive transport access.  Released at most once, either
/// explicitly (possibly early) or on drop.
pub struct QueueSlot {
    shared: Arc<Shared>,
    seq: u64,
    released: bool,
}

impl QueueSlot {
    /// Give up exclusive access.  Idempotent.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(self.seq);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Tests ────────────────────────────────────────────────────
