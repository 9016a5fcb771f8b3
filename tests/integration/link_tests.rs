//! PHY operations and connection-state watching.

use futures_lite::future::{block_on, zip};
use gattqueue::adapters::sim::{Fault, Recorded};
use gattqueue::transport::{Phy, PhyCoding, PhyMask, PhyPair};
use gattqueue::{ConnectionState, Error, GattStatus, OperationKind};

use super::harness::{harness, settle};

#[test]
fn read_phy_reports_the_link_phys() {
    let h = harness();
    assert_eq!(
        block_on(h.conn.read_phy()),
        Ok(PhyPair {
            tx: Phy::Le1M,
            rx: Phy::Le1M,
        })
    );
    assert_eq!(h.sim.requests(), vec![Recorded::ReadPhy]);
}

#[test]
fn preferred_phy_update_resolves_with_the_new_pair() {
    let h = harness();
    let tx = PhyMask::of(&[Phy::Le1M, Phy::Le2M]);
    let rx = PhyMask::LE_CODED;
    let pair = block_on(h.conn.set_preferred_phy(tx, rx, PhyCoding::S8));
    assert_eq!(
        pair,
        Ok(PhyPair {
            tx: Phy::Le2M,
            rx: Phy::LeCoded,
        })
    );
    assert_eq!(Ok(h.sim.phy()), pair);
    assert_eq!(
        h.sim.requests(),
        vec![Recorded::SetPreferredPhy {
            tx,
            rx,
            coding: PhyCoding::S8,
        }]
    );
}

#[test]
fn phy_failures_surface_as_status_and_timeout() {
    let h = harness();
    h.sim.inject(
        OperationKind::PhyUpdate,
        Fault::Status(GattStatus::GATT_ERROR),
    );
    assert_eq!(
        block_on(h.conn.set_preferred_phy(
            PhyMask::LE_2M,
            PhyMask::LE_2M,
            PhyCoding::NoPreference,
        )),
        Err(Error::Status {
            kind: OperationKind::PhyUpdate,
            status: GattStatus::GATT_ERROR,
        })
    );

    h.sim.inject(OperationKind::PhyRead, Fault::Silent);
    assert_eq!(
        block_on(h.conn.read_phy()),
        Err(Error::Timeout(OperationKind::PhyRead))
    );
}

#[test]
fn state_changes_follow_the_link() {
    let h = harness();
    let mut watcher = h.conn.state_changes().unwrap();
    assert_eq!(watcher.try_changed(), None);

    block_on(h.conn.connect(false)).unwrap();
    assert_eq!(watcher.try_changed(), Some(ConnectionState::Connected));

    let (state, ()) = block_on(zip(watcher.changed(), async {
        settle().await;
        h.sim.drop_link(GattStatus(0x08));
    }));
    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
}
