//! Unified error type for the GATT operation engine.
//!
//! Every public call resolves with a value or exactly one [`Error`].  All
//! variants are `Copy` so the disconnection router can replay the same
//! terminal error to any number of waiters without allocation.

use core::fmt;

use uuid::Uuid;

use crate::gatt::{GattStatus, NotificationMode, OperationKind, Properties};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The transport rejected the start call.
    CannotStart(OperationKind),
    /// No matching completion arrived within the operation's budget.
    Timeout(OperationKind),
    /// Terminal: the connection scope is gone.
    Disconnected(DisconnectReason),
    /// A subscription in the other delivery mode is already active.
    ConflictingSubscriptionMode {
        characteristic: Uuid,
        active: NotificationMode,
    },
    /// The addressed attribute is absent from the discovered table.
    NotFound(Missing),
    /// The transport completed the operation with a non-success status.
    Status {
        kind: OperationKind,
        status: GattStatus,
    },
    /// The characteristic does not declare a property the operation needs.
    IllegalOperation {
        characteristic: Uuid,
        required: Properties,
    },
    /// Configuration is invalid.
    Config(&'static str),
}

impl Error {
    /// `true` for the terminal, scope-wide error class.
    pub fn is_disconnection(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CannotStart(kind) => write!(f, "{kind}: transport refused to start"),
            Self::Timeout(kind) => write!(f, "{kind}: timed out waiting for completion"),
            Self::Disconnected(reason) => write!(f, "disconnected: {reason}"),
            Self::ConflictingSubscriptionMode {
                characteristic,
                active,
            } => write!(f, "{characteristic}: {active} subscription already active"),
            Self::NotFound(missing) => write!(f, "not found: {missing}"),
            Self::Status { kind, status } => write!(f, "{kind}: failed with status {status}"),
            Self::IllegalOperation {
                characteristic,
                required,
            } => write!(f, "{characteristic}: missing property {required}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

// ---------------------------------------------------------------------------
// Disconnection reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local adapter was switched off or became unusable.
    AdapterUnusable,
    /// The application asked for the disconnection.
    Requested,
    /// The link dropped, or a connection-state callback carried an error.
    Link(GattStatus),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterUnusable => write!(f, "adapter unusable"),
            Self::Requested => write!(f, "requested by application"),
            Self::Link(status) => write!(f, "link lost (status {status})"),
        }
    }
}

impl From<DisconnectReason> for Error {
    fn from(reason: DisconnectReason) -> Self {
        Self::Disconnected(reason)
    }
}

// ---------------------------------------------------------------------------
// Missing attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Service(Uuid),
    Characteristic(Uuid),
    Descriptor(Uuid),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(uuid) => write!(f, "service {uuid}"),
            Self::Characteristic(uuid) => write!(f, "characteristic {uuid}"),
            Self::Descriptor(uuid) => write!(f, "descriptor {uuid}"),
        }
    }
}

impl From<Missing> for Error {
    fn from(missing: Missing) -> Self {
        Self::NotFound(missing)
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

// ── Tests ────────────────────────────────────────────────────
