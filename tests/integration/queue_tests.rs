//! Queue ordering, exclusivity, timeouts and release accounting, driven
//! through a live connection.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use embassy_time::{Duration, Instant};
use futures_lite::future::{block_on, yield_now, zip};
use gattqueue::adapters::sim::{Fault, ResponseMode};
use gattqueue::{Error, Operation, OperationContext, OperationKind, Priority, QueueSlot, Result};

use super::harness::{CONTROL, harness};

// ── Marker operations ──────────────────────────────────────────

struct Marker {
    label: &'static str,
    priority: Priority,
    log: Rc<RefCell<Vec<&'static str>>>,
}

impl Operation for Marker {
    type Output = ();

    fn name(&self) -> &'static str {
        self.label
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    async fn run(self, _ctx: &OperationContext<'_>, _slot: &mut QueueSlot) -> Result<()> {
        self.log.borrow_mut().push(self.label);
        Ok(())
    }
}

/// Holds the slot across several yields and records the highest number of
/// simultaneously running operations.
struct Overlap<'a> {
    active: &'a Cell<u32>,
    peak: &'a Cell<u32>,
    runs: &'a Cell<u32>,
}

impl Operation for Overlap<'_> {
    type Output = ();

    fn name(&self) -> &'static str {
        "overlap"
    }

    async fn run(self, _ctx: &OperationContext<'_>, _slot: &mut QueueSlot) -> Result<()> {
        self.active.set(self.active.get() + 1);
        self.peak.set(self.peak.get().max(self.active.get()));
        for _ in 0..3 {
            yield_now().await;
        }
        self.active.set(self.active.get() - 1);
        self.runs.set(self.runs.get() + 1);
        Ok(())
    }
}

fn marker(label: &'static str, priority: Priority, log: &Rc<RefCell<Vec<&'static str>>>) -> Marker {
    Marker {
        label,
        priority,
        log: log.clone(),
    }
}

// ── Ordering ──────────────────────────────────────────────────

#[test]
fn priority_order_is_stable_sort_descending() {
    let h = harness();
    let log = Rc::new(RefCell::new(Vec::new()));

    // `first` takes the free slot; the rest queue behind it.
    let first = h.conn.queue(marker("first", Priority::Low, &log));
    let low = h.conn.queue(marker("low", Priority::Low, &log));
    let high = h.conn.queue(marker("high", Priority::High, &log));
    let normal = h.conn.queue(marker("normal", Priority::Normal, &log));

    let (a, (b, (c, d))) = block_on(zip(first, zip(low, zip(high, normal))));
    assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
    assert_eq!(*log.borrow(), ["first", "high", "normal", "low"]);
}

#[test]
fn equal_priorities_keep_arrival_order() {
    let h = harness();
    let log = Rc::new(RefCell::new(Vec::new()));
    let ops: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|l| h.conn.queue(marker(l, Priority::Normal, &log)))
        .collect();

    // Spawned in reverse: first-poll order must not matter.
    let executor: edge_executor::LocalExecutor<'_, 16> = edge_executor::LocalExecutor::new();
    block_on(executor.run(async {
        let tasks: Vec<_> = ops.into_iter().rev().map(|op| executor.spawn(op)).collect();
        for task in tasks {
            task.await.unwrap();
        }
    }));
    assert_eq!(*log.borrow(), ["a", "b", "c", "d"]);
}

#[test]
fn cancelled_operation_never_runs() {
    let h = harness();
    let log = Rc::new(RefCell::new(Vec::new()));
    let first = h.conn.queue(marker("first", Priority::Normal, &log));
    let cancelled = h.conn.queue(marker("cancelled", Priority::High, &log));
    drop(cancelled);
    block_on(first).unwrap();

    assert_eq!(*log.borrow(), ["first"]);
    let stats = h.conn.queue_stats();
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.started, stats.released);
}

// ── Exclusivity ───────────────────────────────────────────────

#[test]
fn at_most_one_operation_runs_at_a_time() {
    let h = harness();
    let (active, peak, runs) = (Cell::new(0), Cell::new(0), Cell::new(0));

    let executor: edge_executor::LocalExecutor<'_, 16> = edge_executor::LocalExecutor::new();
    block_on(executor.run(async {
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                executor.spawn(h.conn.queue(Overlap {
                    active: &active,
                    peak: &peak,
                    runs: &runs,
                }))
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
    }));

    assert_eq!(runs.get(), 6);
    assert_eq!(peak.get(), 1);
    let stats = h.conn.queue_stats();
    assert_eq!(stats.started, 6);
    assert_eq!(stats.released, 6);
}

// ── Failure paths release the slot ────────────────────────────

#[test]
fn silent_completion_times_out_after_budget() {
    let h = harness();
    block_on(h.conn.discover_services()).unwrap();
    h.sim.inject(OperationKind::CharacteristicRead, Fault::Silent);

    let started = Instant::now();
    let result = block_on(h.conn.read_characteristic(CONTROL));
    assert_eq!(result, Err(Error::Timeout(OperationKind::CharacteristicRead)));
    assert!(started.elapsed() >= Duration::from_millis(100));

    // The queue is free again straight away.
    h.sim.clear_faults();
    assert_eq!(block_on(h.conn.write_characteristic(CONTROL, &[7])), Ok(vec![7]));
    let stats = h.conn.queue_stats();
    assert_eq!(stats.started, stats.released);
}

#[test]
fn refused_start_fails_without_waiting() {
    let h = harness();
    block_on(h.conn.discover_services()).unwrap();
    h.sim.inject(OperationKind::CharacteristicWrite, Fault::Reject);

    let started = Instant::now();
    assert_eq!(
        block_on(h.conn.write_characteristic(CONTROL, &[1])),
        Err(Error::CannotStart(OperationKind::CharacteristicWrite))
    );
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(block_on(h.conn.read_rssi()), Ok(-60));
}

#[test]
fn status_failure_is_typed() {
    let h = harness();
    block_on(h.conn.discover_services()).unwrap();
    h.sim.inject(
        OperationKind::CharacteristicRead,
        Fault::Status(gattqueue::GattStatus::READ_NOT_PERMITTED),
    );
    assert_eq!(
        block_on(h.conn.read_characteristic(CONTROL)),
        Err(Error::Status {
            kind: OperationKind::CharacteristicRead,
            status: gattqueue::GattStatus::READ_NOT_PERMITTED,
        })
    );
    let stats = h.conn.queue_stats();
    assert_eq!(stats.started, stats.released);
}

#[test]
fn late_completion_after_timeout_is_discarded() {
    let h = harness();
    h.sim.set_value(CONTROL, &[1]);
    block_on(h.conn.discover_services()).unwrap();

    h.sim.set_mode(ResponseMode::Manual);
    assert_eq!(
        block_on(h.conn.read_characteristic(CONTROL)),
        Err(Error::Timeout(OperationKind::CharacteristicRead))
    );
    let unmatched = h.events.completions().unmatched();
    assert_eq!(h.sim.flush(), 1);
    assert_eq!(h.events.completions().unmatched(), unmatched + 1);

    h.sim.set_mode(ResponseMode::Immediate);
    h.sim.set_value(CONTROL, &[2]);
    assert_eq!(block_on(h.conn.read_characteristic(CONTROL)), Ok(vec![2]));
}
