//! Connection configuration parameters
//!
//! All tunable timing and protocol values for one connection scope.
//! Defaults follow the platform stack's behaviour; every field may be
//! overridden, e.g. from a JSON document supplied by the host application.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest ATT MTU every link supports.
pub const GATT_MTU_MINIMUM: u16 = 23;
/// Opcode + handle bytes consumed by a write request.
pub const GATT_WRITE_MTU_OVERHEAD: u16 = 3;
/// Largest attribute value the protocol allows.
pub const GATT_MAX_ATTRIBUTE_LENGTH: u16 = 512;
/// Hard cap on values buffered per notification subscriber.
pub const MAX_NOTIFICATION_BUFFER: usize = 32;
/// Concurrent connection-state watchers per connection.
pub const MAX_STATE_WATCHERS: usize = 4;

/// Values written to the client configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationValues {
    pub notify: [u8; 2],
    pub indicate: [u8; 2],
    pub disable: [u8; 2],
}

impl Default for NotificationValues {
    fn default() -> Self {
        Self {
            notify: [0x01, 0x00],
            indicate: [0x02, 0x00],
            disable: [0x00, 0x00],
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    // --- Timeouts ---
    /// Budget for a single request/response operation (milliseconds)
    pub operation_timeout_ms: u32,
    /// Budget for a direct (non auto-connect) connection attempt
    pub connect_timeout_ms: u32,
    /// Budget for a disconnection to be confirmed
    pub disconnect_timeout_ms: u32,
    /// Budget for service discovery
    pub discovery_timeout_ms: u32,

    // --- Long write ---
    /// Fixed batch size; `None` derives it from the negotiated MTU
    pub long_write_batch_size: Option<u16>,

    // --- Notifications ---
    pub notification_values: NotificationValues,
    /// Values buffered per subscriber before the oldest is dropped
    pub notification_buffer: usize,

    /// Reject operations the characteristic's properties do not allow
    /// instead of only logging them.
    pub strict_property_checks: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 30_000,
            connect_timeout_ms: 35_000,
            disconnect_timeout_ms: 10_000,
            discovery_timeout_ms: 20_000,

            long_write_batch_size: None,

            notification_values: NotificationValues::default(),
            notification_buffer: 16,

            strict_property_checks: true,
        }
    }
}

impl ConnectionConfig {
    /// Parse a JSON document and validate it.  Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|_| Error::Config("malformed JSON"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == 0
            || self.connect_timeout_ms == 0
            || self.disconnect_timeout_ms == 0
            || self.discovery_timeout_ms == 0
        {
            return Err(Error::Config("timeouts must be non-zero"));
        }
        if self.long_write_batch_size == Some(0) {
            return Err(Error::Config("batch size must be positive"));
        }
        if self.notification_buffer == 0 || self.notification_buffer > MAX_NOTIFICATION_BUFFER {
            return Err(Error::Config("notification buffer out of range"));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.into())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.into())
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms.into())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms.into())
    }
}
