//! Simulated peripheral.
//!
//! An in-memory [`Transport`] holding a GATT table and attribute values.  It
//! answers requests by pushing completions into the connection's
//! [`GattEvents`] hub, either from inside `start` (`Immediate`) or when the
//! test calls [`complete_next`](SimPeripheral::complete_next) (`Manual`).
//!
//! Every start call is recorded, accepted or not, so tests can assert on the
//! exact request history.

use core::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::debug;
use uuid::Uuid;

use crate::config::GATT_MTU_MINIMUM;
use crate::connection::GattEvents;
use crate::gatt::{
    CharacteristicId, ConnectionState, DescriptorId, GattStatus, OperationKind, Services, Target,
};
use crate::transport::{
    CompletionEvent, ConnectionPriority, Payload, Phy, PhyCoding, PhyMask, PhyPair, Request,
    Transport,
};

/// When replies are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// From inside `start`, before it returns.
    #[default]
    Immediate,
    /// Held until [`SimPeripheral::complete_next`] or [`SimPeripheral::flush`].
    Manual,
}

/// Injected misbehaviour for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `start` returns `false`.
    Reject,
    /// Completes with this status.
    Status(GattStatus),
    /// Accepts and never completes.
    Silent,
}

/// Owned copy of a [`Request`], as recorded by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Connect { auto_connect: bool },
    Disconnect,
    DiscoverServices,
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    ReadDescriptor(DescriptorId),
    WriteDescriptor {
        descriptor: DescriptorId,
        value: Vec<u8>,
    },
    SetLocalNotification {
        characteristic: CharacteristicId,
        enable: bool,
    },
    RequestMtu(u16),
    ReadRssi,
    RequestConnectionPriority(ConnectionPriority),
    ReadPhy,
    SetPreferredPhy {
        tx: PhyMask,
        rx: PhyMask,
        coding: PhyCoding,
    },
}

impl Recorded {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Connect { .. } => OperationKind::Connect,
            Self::Disconnect => OperationKind::Disconnect,
            Self::DiscoverServices => OperationKind::ServiceDiscovery,
            Self::ReadCharacteristic(_) => OperationKind::CharacteristicRead,
            Self::WriteCharacteristic { .. } => OperationKind::CharacteristicWrite,
            Self::ReadDescriptor(_) => OperationKind::DescriptorRead,
            Self::WriteDescriptor { .. } => OperationKind::DescriptorWrite,
            Self::SetLocalNotification { .. } => OperationKind::LocalNotification,
            Self::RequestMtu(_) => OperationKind::Mtu,
            Self::ReadRssi => OperationKind::ReadRssi,
            Self::RequestConnectionPriority(_) => OperationKind::ConnectionPriority,
            Self::ReadPhy => OperationKind::PhyRead,
            Self::SetPreferredPhy { .. } => OperationKind::PhyUpdate,
        }
    }
}

impl From<&Request<'_>> for Recorded {
    fn from(request: &Request<'_>) -> Self {
        match *request {
            Request::Connect { auto_connect } => Self::Connect { auto_connect },
            Request::Disconnect => Self::Disconnect,
            Request::DiscoverServices => Self::DiscoverServices,
            Request::ReadCharacteristic(c) => Self::ReadCharacteristic(c),
            Request::WriteCharacteristic {
                characteristic,
                value,
            } => Self::WriteCharacteristic {
                characteristic,
                value: value.to_vec(),
            },
            Request::ReadDescriptor(d) => Self::ReadDescriptor(d),
            Request::WriteDescriptor { descriptor, value } => Self::WriteDescriptor {
                descriptor,
                value: value.to_vec(),
            },
            Request::SetLocalNotification {
                characteristic,
                enable,
            } => Self::SetLocalNotification {
                characteristic,
                enable,
            },
            Request::RequestMtu(mtu) => Self::RequestMtu(mtu),
            Request::ReadRssi => Self::ReadRssi,
            Request::RequestConnectionPriority(p) => Self::RequestConnectionPriority(p),
            Request::ReadPhy => Self::ReadPhy,
            Request::SetPreferredPhy { tx, rx, coding } => {
                Self::SetPreferredPhy { tx, rx, coding }
            }
        }
    }
}

enum Reply {
    Completion(CompletionEvent),
    Link(ConnectionState, GattStatus),
}

struct SimState {
    services: Services,
    cached_services: Option<Services>,
    adapter_usable: bool,
    values: HashMap<CharacteristicId, Vec<u8>>,
    descriptor_values: HashMap<DescriptorId, Vec<u8>>,
    local_notifications: HashSet<CharacteristicId>,
    mode: ResponseMode,
    faults: HashMap<OperationKind, Fault>,
    failing_writes: Option<(u32, GattStatus)>,
    max_mtu: u16,
    rssi: i16,
    phy: PhyPair,
    requests: Vec<Recorded>,
    held: VecDeque<Reply>,
}

impl SimState {
    /// Decide the outcome of `request`.  `None` from the outer option means
    /// the start call is refused.
    fn answer(&mut self, request: &Request<'_>) -> Option<Option<Reply>> {
        let kind = request.kind();
        let fault = self.faults.get(&kind).copied().or_else(|| {
            if kind != OperationKind::CharacteristicWrite {
                return None;
            }
            let (left, status) = self.failing_writes.as_mut()?;
            if *left == 0 {
                return None;
            }
            *left -= 1;
            Some(Fault::Status(*status))
        });

        match fault {
            Some(Fault::Reject) => return None,
            Some(Fault::Silent) => return Some(None),
            Some(Fault::Status(status)) => return Some(Some(self.failure(request, status))),
            None => {}
        }

        let ok = |target: Target, payload: Payload| {
            Some(Some(Reply::Completion(CompletionEvent::success(
                kind, target, payload,
            ))))
        };
        match *request {
            Request::Connect { .. } => Some(Some(Reply::Link(
                ConnectionState::Connected,
                GattStatus::SUCCESS,
            ))),
            Request::Disconnect => Some(Some(Reply::Link(
                ConnectionState::Disconnected,
                GattStatus::SUCCESS,
            ))),
            Request::DiscoverServices => ok(Target::Device, Payload::Services(self.services.clone())),
            Request::ReadCharacteristic(c) => {
                let value = self.values.get(&c).cloned().unwrap_or_default();
                ok(Target::Characteristic(c), Payload::Value(value))
            }
            Request::WriteCharacteristic {
                characteristic,
                value,
            } => {
                self.values.insert(characteristic, value.to_vec());
                ok(Target::Characteristic(characteristic), Payload::Value(value.to_vec()))
            }
            Request::ReadDescriptor(d) => {
                let value = self.descriptor_values.get(&d).cloned().unwrap_or_default();
                ok(Target::Descriptor(d), Payload::Value(value))
            }
            Request::WriteDescriptor { descriptor, value } => {
                self.descriptor_values.insert(descriptor, value.to_vec());
                ok(Target::Descriptor(descriptor), Payload::None)
            }
            Request::SetLocalNotification {
                characteristic,
                enable,
            } => {
                if enable {
                    self.local_notifications.insert(characteristic);
                } else {
                    self.local_notifications.remove(&characteristic);
                }
                Some(None)
            }
            Request::RequestMtu(mtu) => ok(Target::Device, Payload::Mtu(mtu.min(self.max_mtu))),
            Request::ReadRssi => ok(Target::Device, Payload::Rssi(self.rssi)),
            Request::RequestConnectionPriority(_) => Some(None),
            Request::ReadPhy => ok(Target::Device, Payload::Phy(self.phy)),
            Request::SetPreferredPhy { tx, rx, .. } => {
                self.phy = PhyPair {
                    tx: preferred(tx),
                    rx: preferred(rx),
                };
                ok(Target::Device, Payload::Phy(self.phy))
            }
        }
    }

    fn failure(&self, request: &Request<'_>, status: GattStatus) -> Reply {
        let target = match *request {
            Request::ReadCharacteristic(c)
            | Request::WriteCharacteristic {
                characteristic: c, ..
            }
            | Request::SetLocalNotification {
                characteristic: c, ..
            } => Target::Characteristic(c),
            Request::ReadDescriptor(d) | Request::WriteDescriptor { descriptor: d, .. } => {
                Target::Descriptor(d)
            }
            Request::Connect { .. } | Request::Disconnect => {
                return Reply::Link(ConnectionState::Disconnected, status);
            }
            _ => Target::Device,
        };
        Reply::Completion(CompletionEvent::new(
            request.kind(),
            target,
            status,
            Payload::None,
        ))
    }
}

/// The PHY the simulated controller settles on: 2M, then Coded, then 1M.
fn preferred(mask: PhyMask) -> Phy {
    if mask.contains(PhyMask::LE_2M) {
        Phy::Le2M
    } else if mask.contains(PhyMask::LE_CODED) {
        Phy::LeCoded
    } else {
        Phy::Le1M
    }
}

/// In-memory peripheral implementing [`Transport`].
pub struct SimPeripheral {
    events: Arc<GattEvents>,
    state: Mutex<CriticalSectionRawMutex, RefCell<SimState>>,
}

impl SimPeripheral {
    pub fn new(events: Arc<GattEvents>, services: Services) -> Arc<Self> {
        Arc::new(Self {
            events,
            state: Mutex::new(RefCell::new(SimState {
                services,
                cached_services: None,
                adapter_usable: true,
                values: HashMap::new(),
                descriptor_values: HashMap::new(),
                local_notifications: HashSet::new(),
                mode: ResponseMode::Immediate,
                faults: HashMap::new(),
                failing_writes: None,
                max_mtu: 517,
                rssi: -60,
                phy: PhyPair {
                    tx: Phy::Le1M,
                    rx: Phy::Le1M,
                },
                requests: Vec::new(),
                held: VecDeque::new(),
            })),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    fn deliver(&self, reply: Reply) {
        match reply {
            Reply::Completion(event) => {
                self.events.on_completion(event);
            }
            Reply::Link(state, status) => self.events.on_connection_state_changed(state, status),
        }
    }

    fn id_of(&self, uuid: Uuid) -> CharacteristicId {
        self.with(|s| {
            s.services
                .characteristic(uuid)
                .map_or(CharacteristicId::new(uuid, 0), |c| c.id)
        })
    }

    // ── Setup ───────────────────────────────────────────────────

    pub fn set_mode(&self, mode: ResponseMode) {
        self.with(|s| s.mode = mode);
    }

    pub fn set_value(&self, uuid: Uuid, value: &[u8]) {
        let id = self.id_of(uuid);
        self.with(|s| s.values.insert(id, value.to_vec()));
    }

    pub fn value(&self, uuid: Uuid) -> Option<Vec<u8>> {
        let id = self.id_of(uuid);
        self.with(|s| s.values.get(&id).cloned())
    }

    pub fn descriptor_value(&self, descriptor: DescriptorId) -> Option<Vec<u8>> {
        self.with(|s| s.descriptor_values.get(&descriptor).cloned())
    }

    pub fn set_cached_services(&self, services: Option<Services>) {
        self.with(|s| s.cached_services = services);
    }

    pub fn set_adapter_usable(&self, usable: bool) {
        self.with(|s| s.adapter_usable = usable);
    }

    /// Largest MTU the peripheral accepts.
    pub fn set_max_mtu(&self, mtu: u16) {
        self.with(|s| s.max_mtu = mtu.max(GATT_MTU_MINIMUM));
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.with(|s| s.rssi = rssi);
    }

    /// PHYs of the simulated link.
    pub fn phy(&self) -> PhyPair {
        self.with(|s| s.phy)
    }

    // ── Fault injection ─────────────────────────────────────────

    pub fn inject(&self, kind: OperationKind, fault: Fault) {
        self.with(|s| s.faults.insert(kind, fault));
    }

    /// Fail the next `count` characteristic writes with `status`.
    pub fn fail_writes(&self, count: u32, status: GattStatus) {
        self.with(|s| s.failing_writes = Some((count, status)));
    }

    pub fn clear_faults(&self) {
        self.with(|s| {
            s.faults.clear();
            s.failing_writes = None;
        });
    }

    // ── Peripheral-initiated events ─────────────────────────────

    /// Push a value-changed callback, as the stack would for a notification
    /// or indication.
    pub fn notify(&self, uuid: Uuid, value: &[u8]) {
        let id = self.id_of(uuid);
        self.events.on_characteristic_changed(id, value);
    }

    /// The link drops with `status`.
    pub fn drop_link(&self, status: GattStatus) {
        self.events
            .on_connection_state_changed(ConnectionState::Disconnected, status);
    }

    // ── Manual completions ──────────────────────────────────────

    /// Deliver the oldest held reply.  Returns `false` if none was held.
    pub fn complete_next(&self) -> bool {
        match self.with(|s| s.held.pop_front()) {
            Some(reply) => {
                self.deliver(reply);
                true
            }
            None => false,
        }
    }

    /// Deliver every held reply.  Returns how many were delivered.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        while self.complete_next() {
            delivered += 1;
        }
        delivered
    }

    pub fn pending_count(&self) -> usize {
        self.with(|s| s.held.len())
    }

    // ── Inspection ──────────────────────────────────────────────

    pub fn requests(&self) -> Vec<Recorded> {
        self.with(|s| s.requests.clone())
    }

    pub fn count(&self, kind: OperationKind) -> usize {
        self.with(|s| s.requests.iter().filter(|r| r.kind() == kind).count())
    }

    /// Values written to one characteristic, in order.
    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.with(|s| {
            s.requests
                .iter()
                .filter_map(|r| match r {
                    Recorded::WriteCharacteristic {
                        characteristic,
                        value,
                    } if characteristic.uuid == uuid => Some(value.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn clear_requests(&self) {
        self.with(|s| s.requests.clear());
    }

    pub fn local_notification_enabled(&self, uuid: Uuid) -> bool {
        let id = self.id_of(uuid);
        self.with(|s| s.local_notifications.contains(&id))
    }
}

impl Transport for SimPeripheral {
    fn start(&self, request: &Request<'_>) -> bool {
        let (answer, mode) = self.with(|s| {
            s.requests.push(Recorded::from(request));
            (s.answer(request), s.mode)
        });
        debug!("sim: {:?} -> {}", request.kind(), if answer.is_some() { "accepted" } else { "refused" });
        let Some(reply) = answer else {
            return false;
        };
        if let Some(reply) = reply {
            match mode {
                ResponseMode::Immediate => self.deliver(reply),
                ResponseMode::Manual => self.with(|s| s.held.push_back(reply)),
            }
        }
        true
    }

    fn cached_services(&self) -> Option<Services> {
        self.with(|s| s.cached_services.clone())
    }

    fn adapter_usable(&self) -> bool {
        self.with(|s| s.adapter_usable)
    }
}

// ── Tests ────────────────────────────────────────────────────
