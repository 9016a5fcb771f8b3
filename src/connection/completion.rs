//! Completion correlation table.
//!
//! Each in-flight exchange registers a one-shot waiter keyed by
//! `(OperationKind, Target)` before it calls `start`.  The binding's
//! completion feed is dispatched against the table: the oldest unfilled
//! waiter with the same key receives the event and nothing else does.
//! Events with no waiter (late completions after a timeout, or callbacks
//! nobody asked for) are dropped.

use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::debug;

use crate::gatt::{OperationKind, Target};
use crate::transport::CompletionEvent;

struct Waiter {
    id: u64,
    key: (OperationKind, Target),
    event: Option<CompletionEvent>,
    waker: Option<Waker>,
}

#[derive(Default)]
struct Table {
    waiters: Vec<Waiter>,
    next_id: u64,
    unmatched: u64,
}

pub struct CompletionRouter {
    table: Mutex<CriticalSectionRawMutex, RefCell<Table>>,
}

impl CompletionRouter {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(Table::default())),
        }
    }

    /// Register interest now; await the returned waiter for the event.
    pub fn register(&self, kind: OperationKind, target: Target) -> CompletionWaiter<'_> {
        let id = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let id = t.next_id;
            t.next_id += 1;
            t.waiters.push(Waiter {
                id,
                key: (kind, target),
                event: None,
                waker: None,
            });
            id
        });
        CompletionWaiter { router: self, id }
    }

    /// Hand `event` to its waiter.  Returns `false` when nobody was waiting.
    pub fn dispatch(&self, event: CompletionEvent) -> bool {
        let key = event.key();
        let delivered = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            match t
                .waiters
                .iter_mut()
                .find(|w| w.key == key && w.event.is_none())
            {
                Some(w) => {
                    w.event = Some(event);
                    Ok(w.waker.take())
                }
                None => {
                    t.unmatched += 1;
                    Err(())
                }
            }
        });
        match delivered {
            Ok(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
                true
            }
            Err(()) => {
                debug!("completion: no waiter for {} {:?}, dropped", key.0, key.1);
                false
            }
        }
    }

    /// Registered waiters, filled or not.
    pub fn waiting(&self) -> usize {
        self.table.lock(|t| t.borrow().waiters.len())
    }

    /// Events dropped for lack of a waiter.
    pub fn unmatched(&self) -> u64 {
        self.table.lock(|t| t.borrow().unmatched)
    }
}

impl Default for CompletionRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot registration.  Dropping it deregisters, discarding any event
/// that was delivered but not yet observed.
pub struct CompletionWaiter<'a> {
    router: &'a CompletionRouter,
    id: u64,
}

impl Future for CompletionWaiter<'_> {
    type Output = CompletionEvent;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CompletionEvent> {
        let id = self.id;
        self.router.table.lock(|t| {
            let mut t = t.borrow_mut();
            let Some(idx) = t.waiters.iter().position(|w| w.id == id) else {
                return Poll::Pending;
            };
            if t.waiters[idx].event.is_some() {
                let w = t.waiters.remove(idx);
                return w.event.map_or(Poll::Pending, Poll::Ready);
            }
            t.waiters[idx].waker = Some(cx.waker().clone());
            Poll::Pending
        })
    }
}

impl Drop for CompletionWaiter<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.router
            .table
            .lock(|t| t.borrow_mut().waiters.retain(|w| w.id != id));
    }
}

// ── Tests ────────────────────────────────────────────────────
