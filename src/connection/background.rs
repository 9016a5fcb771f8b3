//! Work queued from synchronous contexts (stream drops, quick-setup).
//!
//! A job takes no queue slot of its own.  It is stamped with the queue's
//! next sequence number when pushed, and the first operation granted the
//! slot with a sequence at or past that stamp runs it before its own work.
//! [`Connection::run`](super::Connection::run) reserves a slot only to
//! drain jobs when no other operation comes along.
//!
//! ```text
//!   push(job) ──▶ [ (barrier, job) … ] ──▶ slot holder with seq >= barrier
//!                                            runs due jobs, then itself
//! ```

use core::cell::RefCell;
use std::collections::VecDeque;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::gatt::{CharacteristicId, DescriptorId};
use crate::ops::NotificationTeardown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Teardown(NotificationTeardown),
    /// Quick-setup configuration write for an already active entry.
    EnableWrite {
        characteristic: CharacteristicId,
        generation: u64,
        descriptor: DescriptorId,
        value: [u8; 2],
    },
}

impl Job {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Job::Teardown(_) => "notification teardown",
            Job::EnableWrite { .. } => "write descriptor",
        }
    }
}

struct Queued {
    id: u64,
    barrier: u64,
    job: Job,
}

#[derive(Default)]
struct Jobs {
    list: VecDeque<Queued>,
    next_id: u64,
}

pub(crate) struct Background {
    jobs: Mutex<CriticalSectionRawMutex, RefCell<Jobs>>,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl Background {
    pub(crate) fn new() -> Self {
        Self {
            jobs: Mutex::new(RefCell::new(Jobs::default())),
            wake: Signal::new(),
        }
    }

    /// Queue `job` behind every operation reserved before `barrier`.
    pub(crate) fn push(&self, barrier: u64, job: Job) {
        self.jobs.lock(|j| {
            let mut j = j.borrow_mut();
            let id = j.next_id;
            j.next_id += 1;
            j.list.push_back(Queued { id, barrier, job });
        });
        self.wake.signal(());
    }

    /// Oldest job a slot holder with sequence `seq` must run.  The job stays
    /// listed until [`done`](Self::done), so an interrupted run leaves it for
    /// the next slot holder.
    pub(crate) fn due(&self, seq: u64) -> Option<(u64, Job)> {
        self.jobs.lock(|j| {
            j.borrow()
                .list
                .iter()
                .find(|q| q.barrier <= seq)
                .map(|q| (q.id, q.job))
        })
    }

    pub(crate) fn done(&self, id: u64) {
        self.jobs.lock(|j| j.borrow_mut().list.retain(|q| q.id != id));
    }

    /// Forget everything; used once the scope is disconnected.
    pub(crate) fn clear(&self) -> usize {
        self.jobs.lock(|j| {
            let mut j = j.borrow_mut();
            let n = j.list.len();
            j.list.clear();
            n
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock(|j| j.borrow().list.len())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) async fn woken(&self) {
        self.wake.wait().await;
    }
}
