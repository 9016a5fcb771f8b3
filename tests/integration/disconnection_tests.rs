//! Disconnection fan-out and the end of a connection scope.

use futures_lite::future::{block_on, zip};
use gattqueue::adapters::sim::{Fault, ResponseMode, SimPeripheral};
use gattqueue::transport::AdapterState;
use gattqueue::{
    Connection, ConnectionState, DisconnectReason, Error, GattEvents, GattStatus, OperationKind,
};

use super::harness::{CONTROL, fast_config, harness, services, settle};

#[test]
fn queued_and_running_operations_share_the_error() {
    let h = harness();
    block_on(h.conn.discover_services()).unwrap();
    h.sim.set_mode(ResponseMode::Manual);

    let read = h.conn.read_characteristic(CONTROL);
    let write = h.conn.write_characteristic(CONTROL, &[1]);
    let rssi = h.conn.read_rssi();
    let trigger = async {
        settle().await;
        assert_eq!(h.sim.pending_count(), 1, "only the read is in flight");
        h.sim.drop_link(GattStatus(0x13));
    };
    let ((r, (w, s)), ()) = block_on(zip(zip(read, zip(write, rssi)), trigger));

    let expected = Error::Disconnected(DisconnectReason::Link(GattStatus(0x13)));
    assert_eq!(r, Err(expected));
    assert_eq!(w, Err(expected));
    assert_eq!(s, Err(expected));

    // Nothing new gets in.
    assert_eq!(block_on(h.conn.read_rssi()), Err(expected));
    let stats = h.conn.queue_stats();
    assert_eq!(stats.started, stats.released);
    assert!(expected.is_disconnection());
}

#[test]
fn first_report_wins() {
    let h = harness();
    h.sim.drop_link(GattStatus(0x08));
    h.events.on_adapter_state_changed(AdapterState::Off);
    assert_eq!(
        h.conn.disconnection_error(),
        Some(Error::Disconnected(DisconnectReason::Link(GattStatus(0x08))))
    );
}

#[test]
fn adapter_turning_off_ends_the_scope() {
    let h = harness();
    let (err, ()) = block_on(zip(h.conn.wait_disconnected(), async {
        settle().await;
        h.events.on_adapter_state_changed(AdapterState::TurningOff);
    }));
    assert_eq!(err, Error::Disconnected(DisconnectReason::AdapterUnusable));
    assert_eq!(
        block_on(h.conn.discover_services()),
        Err(Error::Disconnected(DisconnectReason::AdapterUnusable))
    );
}

#[test]
fn unusable_adapter_at_creation() {
    let events = GattEvents::new();
    let sim = SimPeripheral::new(events.clone(), services());
    sim.set_adapter_usable(false);
    let conn = Connection::new(sim.clone(), events, fast_config(), None).unwrap();
    assert_eq!(
        block_on(conn.read_rssi()),
        Err(Error::Disconnected(DisconnectReason::AdapterUnusable))
    );
    assert!(sim.requests().is_empty());
}

#[test]
fn requested_disconnect_is_reported_as_requested() {
    let h = harness();
    block_on(h.conn.connect(false)).unwrap();
    assert_eq!(h.conn.state(), ConnectionState::Connected);

    assert_eq!(block_on(h.conn.disconnect()), Ok(()));
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert_eq!(
        h.conn.disconnection_error(),
        Some(Error::Disconnected(DisconnectReason::Requested))
    );

    // Idempotent.
    assert_eq!(block_on(h.conn.disconnect()), Ok(()));
    assert_eq!(h.sim.count(OperationKind::Disconnect), 1);
}

#[test]
fn unconfirmed_disconnect_still_completes() {
    let h = harness();
    block_on(h.conn.connect(false)).unwrap();
    h.sim.inject(OperationKind::Disconnect, Fault::Silent);
    assert_eq!(block_on(h.conn.disconnect()), Ok(()));
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert_eq!(
        h.conn.disconnection_error(),
        Some(Error::Disconnected(DisconnectReason::Requested))
    );
}

#[test]
fn driver_returns_once_disconnected() {
    let h = harness();
    let conn = h.conn.clone();
    let ((), ()) = block_on(zip(conn.run(), async {
        settle().await;
        h.sim.drop_link(GattStatus(0x08));
    }));
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
}
