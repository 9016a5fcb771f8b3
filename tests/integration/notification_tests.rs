//! Notification multiplexing: shared setup, mode conflicts, setup modes,
//! teardown and buffering.

use embassy_time::{Duration, Timer};
use futures_lite::StreamExt;
use futures_lite::future::{block_on, or, zip};
use gattqueue::adapters::sim::{Fault, Recorded, ResponseMode};
use gattqueue::gatt::CLIENT_CHARACTERISTIC_CONFIG;
use gattqueue::{
    CharacteristicId, DescriptorId, DisconnectReason, Error, GattStatus, Missing,
    NotificationMode, OperationKind, SetupMode,
};

use super::harness::{CONTROL, LEGACY, MEASUREMENT, fast_config, harness, harness_with, settle};

fn cccd() -> DescriptorId {
    DescriptorId {
        characteristic: CharacteristicId::new(MEASUREMENT, 0),
        uuid: CLIENT_CHARACTERISTIC_CONFIG,
    }
}

fn enables(requests: &[Recorded]) -> usize {
    requests
        .iter()
        .filter(|r| matches!(r, Recorded::SetLocalNotification { enable: true, .. }))
        .count()
}

#[test]
fn default_setup_enables_then_writes_descriptor() {
    let h = harness();
    let mut stream =
        block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();

    let id = CharacteristicId::new(MEASUREMENT, 0);
    let tail: Vec<_> = h.sim.requests().into_iter().skip(1).collect();
    assert_eq!(
        tail,
        vec![
            Recorded::SetLocalNotification {
                characteristic: id,
                enable: true,
            },
            Recorded::WriteDescriptor {
                descriptor: cccd(),
                value: vec![0x01, 0x00],
            },
        ]
    );
    assert_eq!(stream.mode(), NotificationMode::Notification);

    h.sim.notify(MEASUREMENT, &[0x06, 0x48]);
    h.sim.notify(MEASUREMENT, &[0x06, 0x49]);
    assert_eq!(block_on(stream.next()), Some(Ok(vec![0x06, 0x48])));
    assert_eq!(block_on(stream.next()), Some(Ok(vec![0x06, 0x49])));
}

#[test]
fn indication_writes_indicate_value() {
    let h = harness();
    let _stream = block_on(h.conn.setup_indication(MEASUREMENT, SetupMode::Default)).unwrap();
    assert_eq!(h.sim.descriptor_value(cccd()), Some(vec![0x02, 0x00]));
}

#[test]
fn concurrent_subscribers_share_one_setup() {
    let h = harness();
    h.sim.set_mode(ResponseMode::Manual);

    let pump = async {
        for _ in 0..8 {
            settle().await;
            h.sim.flush();
        }
    };
    let ((a, b), ()) = block_on(zip(
        zip(
            h.conn.setup_notification(MEASUREMENT, SetupMode::Default),
            h.conn.setup_notification(MEASUREMENT, SetupMode::Default),
        ),
        pump,
    ));
    let (mut a, mut b) = (a.unwrap(), b.unwrap());

    let requests = h.sim.requests();
    assert_eq!(h.sim.count(OperationKind::ServiceDiscovery), 1);
    assert_eq!(enables(&requests), 1);
    assert_eq!(h.sim.count(OperationKind::DescriptorWrite), 1);
    assert_eq!(h.events.notifications().subscriber_count(a.characteristic()), 2);

    h.sim.notify(MEASUREMENT, &[1]);
    assert_eq!(block_on(a.next()), Some(Ok(vec![1])));
    assert_eq!(block_on(b.next()), Some(Ok(vec![1])));
}

#[test]
fn last_detach_tears_down_and_next_subscribe_sets_up_again() {
    let h = harness();
    let a = block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();
    let b = block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();
    assert_eq!(enables(&h.sim.requests()), 1);

    drop(a);
    block_on(or(h.conn.run(), settle()));
    assert!(h.sim.local_notification_enabled(MEASUREMENT));

    drop(b);
    block_on(or(h.conn.run(), settle()));
    assert!(!h.sim.local_notification_enabled(MEASUREMENT));
    assert_eq!(h.sim.descriptor_value(cccd()), Some(vec![0x00, 0x00]));

    let _c = block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();
    assert_eq!(enables(&h.sim.requests()), 2);
    assert!(h.sim.local_notification_enabled(MEASUREMENT));
}

#[test]
fn other_mode_conflicts_without_disturbing_active_stream() {
    let h = harness();
    let mut notify =
        block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();
    let before = h.sim.requests().len();

    let conflict = block_on(h.conn.setup_indication(MEASUREMENT, SetupMode::Default));
    assert_eq!(
        conflict.err(),
        Some(Error::ConflictingSubscriptionMode {
            characteristic: MEASUREMENT,
            active: NotificationMode::Notification,
        })
    );
    assert_eq!(h.sim.requests().len(), before);

    h.sim.notify(MEASUREMENT, &[9]);
    assert_eq!(block_on(notify.next()), Some(Ok(vec![9])));
}

#[test]
fn missing_descriptor_requires_compat() {
    let h = harness();
    assert_eq!(
        block_on(h.conn.setup_notification(LEGACY, SetupMode::Default)).err(),
        Some(Error::NotFound(Missing::Descriptor(CLIENT_CHARACTERISTIC_CONFIG)))
    );

    let mut stream = block_on(h.conn.setup_notification(LEGACY, SetupMode::Compat)).unwrap();
    assert_eq!(h.sim.count(OperationKind::DescriptorWrite), 0);
    h.sim.notify(LEGACY, &[3]);
    assert_eq!(block_on(stream.next()), Some(Ok(vec![3])));

    drop(stream);
    block_on(or(h.conn.run(), settle()));
    assert!(!h.sim.local_notification_enabled(LEGACY));
    assert_eq!(h.sim.count(OperationKind::DescriptorWrite), 0);
}

#[test]
fn quick_setup_failure_ends_the_stream() {
    let h = harness();
    h.sim.inject(
        OperationKind::DescriptorWrite,
        Fault::Status(GattStatus::WRITE_NOT_PERMITTED),
    );
    let mut stream =
        block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::QuickSetup)).unwrap();
    assert_eq!(h.sim.count(OperationKind::DescriptorWrite), 0);

    let item = block_on(or(
        async {
            h.conn.run().await;
            None
        },
        stream.next(),
    ));
    assert_eq!(
        item,
        Some(Err(Error::Status {
            kind: OperationKind::DescriptorWrite,
            status: GattStatus::WRITE_NOT_PERMITTED,
        }))
    );
    assert_eq!(block_on(stream.next()), None);

    block_on(or(h.conn.run(), settle()));
    assert!(!h.sim.local_notification_enabled(MEASUREMENT));
    assert!(!h.events.notifications().is_active(CharacteristicId::new(MEASUREMENT, 0)));
}

#[test]
fn quick_setup_stream_sees_values_before_write_completes() {
    let h = harness();
    block_on(h.conn.discover_services()).unwrap();
    let mut stream =
        block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::QuickSetup)).unwrap();

    h.sim.notify(MEASUREMENT, &[5]);
    assert_eq!(block_on(stream.next()), Some(Ok(vec![5])));

    block_on(or(h.conn.run(), settle()));
    assert_eq!(h.sim.descriptor_value(cccd()), Some(vec![0x01, 0x00]));
}

#[test]
fn slow_subscriber_loses_oldest_values() {
    let mut config = fast_config();
    config.notification_buffer = 2;
    let h = harness_with(config);
    let mut stream =
        block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();

    for v in 1..=4u8 {
        h.sim.notify(MEASUREMENT, &[v]);
    }
    assert_eq!(stream.dropped(), 2);
    assert_eq!(block_on(stream.next()), Some(Ok(vec![3])));
    assert_eq!(block_on(stream.next()), Some(Ok(vec![4])));
}

#[test]
fn disconnection_ends_every_stream() {
    let h = harness();
    let mut a = block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();
    let mut b = block_on(h.conn.setup_notification(LEGACY, SetupMode::Compat)).unwrap();

    h.sim.drop_link(GattStatus(0x08));
    let expected = Error::Disconnected(DisconnectReason::Link(GattStatus(0x08)));
    assert_eq!(block_on(a.next()), Some(Err(expected)));
    assert_eq!(block_on(b.next()), Some(Err(expected)));
    assert_eq!(block_on(a.next()), None);

    // No teardown traffic once the scope is gone.
    let before = h.sim.requests().len();
    drop((a, b));
    block_on(h.conn.run());
    assert_eq!(h.sim.requests().len(), before);
}

#[test]
fn teardown_runs_ahead_of_the_next_operation_without_the_driver() {
    let h = harness();
    let stream = block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();
    drop(stream);
    h.sim.clear_requests();

    let read = block_on(or(
        async { Some(h.conn.read_characteristic(CONTROL).await) },
        async {
            Timer::after(Duration::from_secs(1)).await;
            None
        },
    ));
    assert_eq!(read, Some(Ok(Vec::new())));
    assert_eq!(
        h.sim.requests(),
        vec![
            Recorded::WriteDescriptor {
                descriptor: cccd(),
                value: vec![0x00, 0x00],
            },
            Recorded::SetLocalNotification {
                characteristic: CharacteristicId::new(MEASUREMENT, 0),
                enable: false,
            },
            Recorded::ReadCharacteristic(CharacteristicId::new(CONTROL, 0)),
        ]
    );
    let stats = h.conn.queue_stats();
    assert_eq!(stats.started, stats.released);

    // A new subscriber sets everything up again, still without the driver.
    let _again = block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::Default)).unwrap();
    assert!(h.sim.local_notification_enabled(MEASUREMENT));
    assert_eq!(h.sim.descriptor_value(cccd()), Some(vec![0x01, 0x00]));
}

#[test]
fn quick_setup_write_goes_out_with_the_next_operation() {
    let h = harness();
    let _stream =
        block_on(h.conn.setup_notification(MEASUREMENT, SetupMode::QuickSetup)).unwrap();
    assert_eq!(h.sim.count(OperationKind::DescriptorWrite), 0);

    assert_eq!(block_on(h.conn.read_rssi()), Ok(-60));
    assert_eq!(h.sim.count(OperationKind::DescriptorWrite), 1);
    assert_eq!(h.sim.descriptor_value(cccd()), Some(vec![0x01, 0x00]));
}
