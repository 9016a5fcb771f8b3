//! Transport port: the boundary between the engine and a BLE stack binding.
//!
//! ```text
//!   Connection ──start(Request)──▶ Transport (binding) ──▶ radio
//!        ▲                                  │
//!        └──────── GattEvents::on_* ◀───────┘  (callbacks, any context)
//! ```
//!
//! The outbound direction is a single synchronous accept/reject call.  The
//! inbound direction is pushed by the binding into the connection's
//! [`GattEvents`](crate::connection::GattEvents) hub as [`CompletionEvent`]s.
//! A binding may deliver the completion from inside `start`, before it
//! returns `true`; the engine registers interest first.

use crate::gatt::{
    CharacteristicId, ConnectionState, DescriptorId, GattStatus, OperationKind, Services, Target,
};

/// Requested link parameters trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// LE physical layer, as reported in PHY callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
    /// A value the stack reported that has no name here.
    Other(u8),
}

impl Phy {
    /// Decode the callback value (1 = 1M, 2 = 2M, 3 = Coded).
    pub fn from_value(value: u8) -> Self {
        match value {
            1 => Self::Le1M,
            2 => Self::Le2M,
            3 => Self::LeCoded,
            other => Self::Other(other),
        }
    }

    pub fn value(self) -> u8 {
        match self {
            Self::Le1M => 1,
            Self::Le2M => 2,
            Self::LeCoded => 3,
            Self::Other(v) => v,
        }
    }
}

/// Set of PHYs one direction may use, in the stack's mask encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhyMask(u8);

impl PhyMask {
    pub const LE_1M: Self = Self(1);
    pub const LE_2M: Self = Self(1 << 1);
    pub const LE_CODED: Self = Self(1 << 2);

    /// Mask with the given PHYs.  An empty set means 1M.
    pub fn of(phys: &[Phy]) -> Self {
        let bits = phys.iter().fold(0, |acc, phy| {
            acc | match phy {
                Phy::Le1M => Self::LE_1M.0,
                Phy::Le2M => Self::LE_2M.0,
                Phy::LeCoded => Self::LE_CODED.0,
                Phy::Other(_) => 0,
            }
        });
        if bits == 0 { Self::LE_1M } else { Self(bits) }
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Coding requested for transmissions on the LE Coded PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PhyCoding {
    #[default]
    NoPreference,
    S2,
    S8,
}

/// Transmit and receive PHY of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhyPair {
    pub tx: Phy,
    pub rx: Phy,
}

/// One hardware call, as seen by the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Connect {
        auto_connect: bool,
    },
    Disconnect,
    DiscoverServices,
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic {
        characteristic: CharacteristicId,
        value: &'a [u8],
    },
    ReadDescriptor(DescriptorId),
    WriteDescriptor {
        descriptor: DescriptorId,
        value: &'a [u8],
    },
    /// Route value-changed callbacks for this characteristic to the host.
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

impl Request<'_> {
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

/// Host adapter power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    On,
    TurningOff,
    Off,
    TurningOn,
}

impl AdapterState {
    pub fn is_usable(self) -> bool {
        self == Self::On
    }
}

/// Data carried by a completion, by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Value(Vec<u8>),
    Mtu(u16),
    Rssi(i16),
    Services(Services),
    State(ConnectionState),
    Phy(PhyPair),
}

/// Asynchronous completion reported by the binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub kind: OperationKind,
    pub target: Target,
    pub status: GattStatus,
    pub payload: Payload,
}

impl CompletionEvent {
    pub fn new(kind: OperationKind, target: Target, status: GattStatus, payload: Payload) -> Self {
        Self {
            kind,
            target,
            status,
            payload,
        }
    }

    pub fn success(kind: OperationKind, target: Target, payload: Payload) -> Self {
        Self::new(kind, target, GattStatus::SUCCESS, payload)
    }

    pub fn key(&self) -> (OperationKind, Target) {
        (self.kind, self.target)
    }
}

// ───────────────────────────────────────────────────────────────
// Transport port (driven adapter: engine → BLE stack)
// ───────────────────────────────────────────────────────────────

/// Implemented by the platform binding.
///
/// `start` must not block and must not call back into the engine's queue;
/// pushing events into the hub is fine.
pub trait Transport: Send + Sync {
    /// Issue the hardware call.  `false` means the stack refused it.
    fn start(&self, request: &Request<'_>) -> bool;

    /// Attribute table the stack already holds, if any.
    fn cached_services(&self) -> Option<Services> {
        None
    }

    /// Current adapter usability, sampled once when a connection is created.
    fn adapter_usable(&self) -> bool {
        true
    }
}
