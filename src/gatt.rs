//! GATT identity and attribute-table types.
//!
//! ```text
//!   Services ─┬─ Service (uuid)
//!             │    └─ Characteristic (uuid, instance, properties)
//!             │         └─ descriptor uuids (0x2902 = client configuration)
//!             └─ ...
//! ```
//!
//! Identity is by value: a characteristic is addressed by its UUID plus the
//! instance number the stack assigned, so two characteristics sharing a UUID
//! in different services remain distinct.

use core::fmt;

use uuid::Uuid;

use crate::error::{Error, Missing, Result};

/// Client Characteristic Configuration Descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Raw ATT/GATT status code reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    pub const INVALID_ATTRIBUTE_LENGTH: Self = Self(0x0d);
    pub const GATT_ERROR: Self = Self(0x85);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

/// Every kind of work that goes through the queue, and the key under which
/// its completion is correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    /// Connection-state callbacks; awaited by connect and disconnect.
    ConnectionState,
    ServiceDiscovery,
    CharacteristicRead,
    CharacteristicWrite,
    DescriptorRead,
    DescriptorWrite,
    LocalNotification,
    Mtu,
    ReadRssi,
    ConnectionPriority,
    PhyRead,
    PhyUpdate,
    Custom,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::ConnectionState => "connection state",
            Self::ServiceDiscovery => "service discovery",
            Self::CharacteristicRead => "characteristic read",
            Self::CharacteristicWrite => "characteristic write",
            Self::DescriptorRead => "descriptor read",
            Self::DescriptorWrite => "descriptor write",
            Self::LocalNotification => "local notification",
            Self::Mtu => "mtu request",
            Self::ReadRssi => "rssi read",
            Self::ConnectionPriority => "connection priority",
            Self::PhyRead => "phy read",
            Self::PhyUpdate => "phy update",
            Self::Custom => "custom operation",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub uuid: Uuid,
    pub instance: u16,
}

impl CharacteristicId {
    pub const fn new(uuid: Uuid, instance: u16) -> Self {
        Self { uuid, instance }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
    pub characteristic: CharacteristicId,
    pub uuid: Uuid,
}

/// What a completion event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Connection-wide: discovery, MTU, RSSI, connection state.
    Device,
    Characteristic(CharacteristicId),
    Descriptor(DescriptorId),
}

/// Delivery mode of spontaneous characteristic updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationMode {
    Notification,
    /// Acknowledged at the protocol level by the central.
    Indication,
}

impl fmt::Display for NotificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notification => f.write_str("notification"),
            Self::Indication => f.write_str("indication"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

// ---------------------------------------------------------------------------
// Characteristic properties
// ---------------------------------------------------------------------------

/// Characteristic property bit field as declared by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Properties(pub u8);

impl Properties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);
    pub const SIGNED_WRITE: Self = Self(0x40);

    /// Any form of write.
    pub const ANY_WRITE: Self = Self(0x04 | 0x08 | 0x40);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// `true` when at least one bit of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 7] = [
            (0x01, "BROADCAST"),
            (0x02, "READ"),
            (0x04, "WRITE_NO_RESPONSE"),
            (0x08, "WRITE"),
            (0x10, "NOTIFY"),
            (0x20, "INDICATE"),
            (0x40, "SIGNED_WRITE"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Attribute table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub id: CharacteristicId,
    pub service: Uuid,
    pub properties: Properties,
    pub descriptors: Vec<Uuid>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, instance: u16, properties: Properties) -> Self {
        Self {
            id: CharacteristicId::new(uuid, instance),
            service: Uuid::nil(),
            properties,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(uuid);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.id.uuid
    }

    /// Resolve one of this characteristic's descriptors.
    pub fn descriptor(&self, uuid: Uuid) -> Result<DescriptorId> {
        if self.descriptors.contains(&uuid) {
            Ok(DescriptorId {
                characteristic: self.id,
                uuid,
            })
        } else {
            Err(Missing::Descriptor(uuid).into())
        }
    }

    /// Fails with [`Error::IllegalOperation`] unless any bit of `required`
    /// is declared.
    pub fn require(&self, required: Properties) -> Result<()> {
        if self.properties.intersects(required) {
            Ok(())
        } else {
            Err(Error::IllegalOperation {
                characteristic: self.id.uuid,
                required,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, mut characteristic: Characteristic) -> Self {
        characteristic.service = self.uuid;
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.id.uuid == uuid)
            .ok_or(Error::NotFound(Missing::Characteristic(uuid)))
    }
}

/// Result of a successful service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Services {
    pub services: Vec<Service>,
}

impl Services {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, uuid: Uuid) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.uuid == uuid)
            .ok_or(Error::NotFound(Missing::Service(uuid)))
    }

    /// First characteristic with `uuid` in any service.
    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.id.uuid == uuid)
            .ok_or(Error::NotFound(Missing::Characteristic(uuid)))
    }

    pub fn descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Result<DescriptorId> {
        self.service(service)?
            .characteristic(characteristic)?
            .descriptor(descriptor)
    }
}

// ── Tests ────────────────────────────────────────────────────
