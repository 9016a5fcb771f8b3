//! Single-assignment broadcast cell.
//!
//! The first [`OnceBroadcast::set`] wins; the value is then cached and
//! replayed to every past, present and future waiter.  Waiters that are
//! dropped before the value arrives deregister themselves.
//!
//! State sits behind a critical-section blocking mutex, the same discipline
//! every other shared table in the crate uses.  Wakers are always woken after
//! the lock has been released.

use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

struct State<T> {
    value: Option<T>,
    listeners: Vec<(u64, Waker)>,
    next_id: u64,
}

pub struct OnceBroadcast<T: Clone> {
    state: Mutex<CriticalSectionRawMutex, RefCell<State<T>>>,
}

impl<T: Clone + Send> OnceBroadcast<T> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                value: None,
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Store `value` if the cell is empty.  Returns `true` for the first
    /// caller only; later values are discarded.
    pub fn set(&self, value: T) -> bool {
        let woken = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.value.is_some() {
                return None;
            }
            s.value = Some(value);
            Some(core::mem::take(&mut s.listeners))
        });
        match woken {
            Some(listeners) => {
                for (_, waker) in listeners {
                    waker.wake();
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self) -> Option<T> {
        self.state.lock(|s| s.borrow().value.clone())
    }

    pub fn is_set(&self) -> bool {
        self.state.lock(|s| s.borrow().value.is_some())
    }

    /// Resolves with the stored value, immediately if already set.
    pub fn wait(&self) -> Wait<'_, T> {
        Wait {
            cell: self,
            listener: None,
        }
    }

    /// Poll-style access for hand-written futures and streams.  `listener`
    /// holds the caller's registration between polls; hand it to
    /// [`forget`](Self::forget) when giving up.
    pub fn poll_wait(&self, listener: &mut Option<u64>, cx: &mut Context<'_>) -> Poll<T> {
        let registered = *listener;
        let (ready, id) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if let Some(v) = s.value.as_ref() {
                return (Some(v.clone()), None);
            }
            let id = match registered {
                Some(id) => {
                    match s.listeners.iter_mut().find(|(l, _)| *l == id) {
                        Some((_, w)) => w.clone_from(cx.waker()),
                        None => s.listeners.push((id, cx.waker().clone())),
                    }
                    id
                }
                None => {
                    let id = s.next_id;
                    s.next_id += 1;
                    s.listeners.push((id, cx.waker().clone()));
                    id
                }
            };
            (None, Some(id))
        });
        *listener = id;
        match ready {
            Some(v) => Poll::Ready(v),
            None => Poll::Pending,
        }
    }

    pub fn forget(&self, listener: &mut Option<u64>) {
        if let Some(id) = listener.take() {
            self.state
                .lock(|s| s.borrow_mut().listeners.retain(|(l, _)| *l != id));
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.state.lock(|s| s.borrow().listeners.len())
    }
}

impl<T: Clone + Send> Default for OnceBroadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`OnceBroadcast::wait`].
pub struct Wait<'a, T: Clone + Send> {
    cell: &'a OnceBroadcast<T>,
    listener: Option<u64>,
}

impl<T: Clone + Send> Future for Wait<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = &mut *self;
        this.cell.poll_wait(&mut this.listener, cx)
    }
}

impl<T: Clone + Send> Drop for Wait<'_, T> {
    fn drop(&mut self) {
        self.cell.forget(&mut self.listener);
    }
}

// ── Tests ────────────────────────────────────────────────────
