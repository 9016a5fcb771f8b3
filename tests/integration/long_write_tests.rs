//! Long write batching, acknowledgement and retry.

use futures_lite::future::block_on;
use gattqueue::adapters::sim::Fault;
use gattqueue::ops::{AckStrategy, BatchWritten, RetryUpTo};
use gattqueue::{Error, GattStatus, LongWrite, Missing, OperationKind};
use uuid::Uuid;

use super::harness::{CONTROL, LOCATION, harness};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

fn batch_lengths(h: &super::harness::Harness) -> Vec<usize> {
    h.sim.writes_to(CONTROL).iter().map(Vec::len).collect()
}

/// Stops once the given number of batches has been confirmed.
struct StopAfter(usize);

impl AckStrategy for StopAfter {
    async fn acknowledge(&mut self, batch: &BatchWritten) -> bool {
        batch.index + 1 < self.0
    }
}

#[test]
fn forty_five_bytes_go_out_as_twenty_twenty_five() {
    let h = harness();
    let data = payload(45);
    let written = block_on(h.conn.long_write(CONTROL, &data, LongWrite::new().batch_size(20)));
    assert_eq!(written, Ok(data.clone()));
    assert_eq!(batch_lengths(&h), [20, 20, 5]);

    let writes = h.sim.writes_to(CONTROL);
    assert_eq!(writes.concat(), data);
    let stats = h.conn.queue_stats();
    assert_eq!(stats.started, stats.released);
}

#[test]
fn empty_payload_completes_without_writes() {
    let h = harness();
    assert_eq!(
        block_on(h.conn.long_write(CONTROL, &[], LongWrite::new().batch_size(20))),
        Ok(Vec::new())
    );
    assert_eq!(h.sim.count(OperationKind::CharacteristicWrite), 0);
}

#[test]
fn empty_payload_still_resolves_the_characteristic() {
    let h = harness();
    let missing = Uuid::from_u128(0xdead);
    assert_eq!(
        block_on(h.conn.long_write(missing, &[], LongWrite::new())),
        Err(Error::NotFound(Missing::Characteristic(missing)))
    );
    assert!(matches!(
        block_on(h.conn.long_write(LOCATION, &[], LongWrite::new())),
        Err(Error::IllegalOperation { .. })
    ));
    assert_eq!(h.sim.count(OperationKind::CharacteristicWrite), 0);
}

#[test]
fn zero_batch_size_is_rejected_before_any_write() {
    let h = harness();
    assert_eq!(
        block_on(h.conn.long_write(CONTROL, &payload(10), LongWrite::new().batch_size(0))),
        Err(Error::Config("batch size must be positive"))
    );
    assert!(h.sim.requests().is_empty());
}

#[test]
fn default_batch_size_follows_mtu() {
    let h = harness();
    block_on(h.conn.long_write(CONTROL, &payload(45), LongWrite::new())).unwrap();
    assert_eq!(batch_lengths(&h), [20, 20, 5]);

    h.sim.set_max_mtu(185);
    assert_eq!(block_on(h.conn.request_mtu(247)), Ok(185));
    assert_eq!(h.conn.mtu(), 185);

    h.sim.clear_requests();
    block_on(h.conn.long_write(CONTROL, &payload(400), LongWrite::new())).unwrap();
    assert_eq!(batch_lengths(&h), [182, 182, 36]);
}

#[test]
fn failed_batch_is_retried_from_its_start() {
    let h = harness();
    h.sim.fail_writes(1, GattStatus::GATT_ERROR);
    let data = payload(45);
    let written = block_on(h.conn.long_write(
        CONTROL,
        &data,
        LongWrite::new().batch_size(20).retry(RetryUpTo(2)),
    ));
    assert_eq!(written, Ok(data.clone()));
    assert_eq!(batch_lengths(&h), [20, 20, 20, 5]);
    assert_eq!(h.sim.value(CONTROL), Some(data[40..].to_vec()));
}

#[test]
fn first_failure_surfaces_without_retry() {
    let h = harness();
    h.sim.fail_writes(1, GattStatus::INVALID_ATTRIBUTE_LENGTH);
    assert_eq!(
        block_on(h.conn.long_write(CONTROL, &payload(45), LongWrite::new().batch_size(20))),
        Err(Error::Status {
            kind: OperationKind::CharacteristicWrite,
            status: GattStatus::INVALID_ATTRIBUTE_LENGTH,
        })
    );
    assert_eq!(batch_lengths(&h), [20]);
}

#[test]
fn retry_budget_runs_out() {
    let h = harness();
    h.sim.fail_writes(10, GattStatus::GATT_ERROR);
    let result = block_on(h.conn.long_write(
        CONTROL,
        &payload(45),
        LongWrite::new().batch_size(20).retry(RetryUpTo(2)),
    ));
    assert!(matches!(result, Err(Error::Status { .. })));
    assert_eq!(batch_lengths(&h), [20, 20, 20]);
}

#[test]
fn timeouts_are_never_retried() {
    let h = harness();
    block_on(h.conn.discover_services()).unwrap();
    h.sim.inject(OperationKind::CharacteristicWrite, Fault::Silent);
    assert_eq!(
        block_on(h.conn.long_write(
            CONTROL,
            &payload(45),
            LongWrite::new().batch_size(20).retry(RetryUpTo(5)),
        )),
        Err(Error::Timeout(OperationKind::CharacteristicWrite))
    );
    assert_eq!(batch_lengths(&h), [20]);
}

#[test]
fn ack_strategy_can_stop_early() {
    let h = harness();
    let data = payload(45);
    let written = block_on(h.conn.long_write(
        CONTROL,
        &data,
        LongWrite::new().batch_size(20).ack(StopAfter(2)),
    ));
    // The session resolves with the whole payload even though only two
    // batches went out.
    assert_eq!(written, Ok(data.clone()));
    assert_eq!(batch_lengths(&h), [20, 20]);
    assert_eq!(h.sim.value(CONTROL), Some(data[20..40].to_vec()));
}

#[test]
fn long_write_waits_its_turn() {
    let h = harness();
    let data = payload(45);
    let first = h.conn.long_write(CONTROL, &data, LongWrite::new().batch_size(20));
    let second = h.conn.write_characteristic(CONTROL, &[0xff]);
    let (a, b) = block_on(futures_lite::future::zip(first, second));
    assert_eq!(a, Ok(data));
    assert_eq!(b, Ok(vec![0xff]));
    assert_eq!(batch_lengths(&h), [20, 20, 5, 1]);
}
