//! Shared fixture: a heart-rate style peripheral behind the simulator.

use std::sync::Arc;

use futures_lite::future::yield_now;
use gattqueue::adapters::sim::SimPeripheral;
use gattqueue::gatt::CLIENT_CHARACTERISTIC_CONFIG;
use gattqueue::{
    Characteristic, Connection, ConnectionConfig, GattEvents, Properties, Service, Services,
};
use uuid::Uuid;

pub const HEART_RATE: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);
/// Notify + indicate, with a configuration descriptor.
pub const MEASUREMENT: Uuid = Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);
/// Read + write.
pub const CONTROL: Uuid = Uuid::from_u128(0x0000_2a39_0000_1000_8000_0080_5f9b_34fb);
/// Notify without a configuration descriptor.
pub const LEGACY: Uuid = Uuid::from_u128(0x0000_ff01_0000_1000_8000_0080_5f9b_34fb);
/// Read only.
pub const LOCATION: Uuid = Uuid::from_u128(0x0000_2a38_0000_1000_8000_0080_5f9b_34fb);
pub const USER_DESCRIPTION: Uuid = Uuid::from_u128(0x0000_2901_0000_1000_8000_0080_5f9b_34fb);

pub fn services() -> Services {
    Services::new(vec![
        Service::new(HEART_RATE)
            .with_characteristic(
                Characteristic::new(
                    MEASUREMENT,
                    0,
                    Properties::NOTIFY.union(Properties::INDICATE),
                )
                .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG),
            )
            .with_characteristic(
                Characteristic::new(CONTROL, 0, Properties::READ.union(Properties::WRITE))
                    .with_descriptor(USER_DESCRIPTION),
            )
            .with_characteristic(Characteristic::new(LEGACY, 0, Properties::NOTIFY))
            .with_characteristic(Characteristic::new(LOCATION, 0, Properties::READ)),
    ])
}

/// Short timeouts so timeout paths finish quickly on the host.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        operation_timeout_ms: 100,
        connect_timeout_ms: 100,
        disconnect_timeout_ms: 100,
        discovery_timeout_ms: 100,
        ..ConnectionConfig::default()
    }
}

pub struct Harness {
    pub events: Arc<GattEvents>,
    pub sim: Arc<SimPeripheral>,
    pub conn: Connection,
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: ConnectionConfig) -> Harness {
    let events = GattEvents::new();
    let sim = SimPeripheral::new(events.clone(), services());
    let conn = Connection::new(sim.clone(), events.clone(), config, None)
        .expect("valid config");
    Harness { events, sim, conn }
}

/// Give spawned or racing futures a few turns.
pub async fn settle() {
    for _ in 0..16 {
        yield_now().await;
    }
}
