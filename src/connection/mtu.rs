//! Negotiated MTU tracking and the write payload limit derived from it.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::config::{GATT_MAX_ATTRIBUTE_LENGTH, GATT_MTU_MINIMUM, GATT_WRITE_MTU_OVERHEAD};

pub struct MtuWatcher {
    mtu: AtomicU16,
}

impl MtuWatcher {
    pub const fn new() -> Self {
        Self {
            mtu: AtomicU16::new(GATT_MTU_MINIMUM),
        }
    }

    pub fn current(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    /// Values below the protocol minimum are ignored.
    pub fn update(&self, mtu: u16) {
        if mtu >= GATT_MTU_MINIMUM {
            self.mtu.store(mtu, Ordering::Release);
        }
    }

    /// Largest value one write request can carry.
    pub fn payload_limit(&self) -> usize {
        (self.current() - GATT_WRITE_MTU_OVERHEAD).min(GATT_MAX_ATTRIBUTE_LENGTH) as usize
    }
}

impl Default for MtuWatcher {
    fn default() -> Self {
        Self::new()
    }
}
