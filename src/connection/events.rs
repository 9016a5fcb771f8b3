//! Inbound event hub.
//!
//! Everything the platform binding reports lands here: completions, value
//! changes, link state, MTU changes and adapter state.  Each callback is
//! forwarded to the table that owns it.
//!
//! ```text
//!   binding ──on_completion──────────────▶ CompletionRouter
//!           ──on_characteristic_changed──▶ NotificationTable
//!           ──on_connection_state_changed─▶ CompletionRouter + DisconnectionRouter
//!                                            + state watchers
//!           ──on_mtu_changed─────────────▶ MtuWatcher
//!           ──on_adapter_state_changed───▶ DisconnectionRouter
//! ```

use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::watch::{Receiver, Watch};
use log::{debug, info};

use super::completion::CompletionRouter;
use super::disconnection::DisconnectionRouter;
use super::mtu::MtuWatcher;
use super::notification::NotificationTable;
use crate::config::MAX_STATE_WATCHERS;
use crate::error::DisconnectReason;
use crate::gatt::{CharacteristicId, ConnectionState, GattStatus, OperationKind, Target};
use crate::transport::{AdapterState, CompletionEvent, Payload};

/// Observer of link state changes.  Sees the latest state, not every
/// intermediate one.
pub type StateWatcher<'a> =
    Receiver<'a, CriticalSectionRawMutex, ConnectionState, MAX_STATE_WATCHERS>;

pub struct GattEvents {
    completions: CompletionRouter,
    disconnection: Arc<DisconnectionRouter>,
    notifications: NotificationTable,
    mtu: MtuWatcher,
    state: Watch<CriticalSectionRawMutex, ConnectionState, MAX_STATE_WATCHERS>,
}

impl GattEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completions: CompletionRouter::new(),
            disconnection: Arc::new(DisconnectionRouter::new()),
            notifications: NotificationTable::new(),
            mtu: MtuWatcher::new(),
            state: Watch::new_with(ConnectionState::Disconnected),
        })
    }

    // ── Binding callbacks ───────────────────────────────────────

    /// Returns `false` when no operation was waiting for `event`.
    pub fn on_completion(&self, event: CompletionEvent) -> bool {
        self.completions.dispatch(event)
    }

    pub fn on_characteristic_changed(&self, characteristic: CharacteristicId, value: &[u8]) {
        self.notifications.dispatch(characteristic, value);
    }

    /// Link state callback.  `Connected` and `Disconnected` complete a
    /// pending connect; a drop of the link, or any failure status, ends the
    /// connection scope.
    pub fn on_connection_state_changed(&self, state: ConnectionState, status: GattStatus) {
        let previous = self.state();
        self.set_state(state);
        debug!("link: {:?} -> {:?} (status {})", previous, state, status);

        if matches!(state, ConnectionState::Connected | ConnectionState::Disconnected) {
            self.completions.dispatch(CompletionEvent::new(
                OperationKind::ConnectionState,
                Target::Device,
                status,
                Payload::State(state),
            ));
        }

        if state == ConnectionState::Disconnected || !status.is_success() {
            let reason = if previous == ConnectionState::Disconnecting && status.is_success() {
                DisconnectReason::Requested
            } else {
                DisconnectReason::Link(status)
            };
            self.disconnection.report(reason.into());
        } else if state == ConnectionState::Connected {
            info!("link: connected");
        }
    }

    pub fn on_mtu_changed(&self, mtu: u16) {
        self.mtu.update(mtu);
    }

    pub fn on_adapter_state_changed(&self, state: AdapterState) {
        self.disconnection.on_adapter_state(state);
    }

    /// Report a disconnection that did not arrive through the link callback.
    pub fn report_disconnection(&self, reason: DisconnectReason) -> bool {
        self.disconnection.report(reason.into())
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn completions(&self) -> &CompletionRouter {
        &self.completions
    }

    pub fn disconnection(&self) -> &Arc<DisconnectionRouter> {
        &self.disconnection
    }

    pub fn notifications(&self) -> &NotificationTable {
        &self.notifications
    }

    pub fn mtu(&self) -> &MtuWatcher {
        &self.mtu
    }

    pub fn state(&self) -> ConnectionState {
        self.state.try_get().unwrap_or(ConnectionState::Disconnected)
    }

    /// Record `state`; watchers are woken only when it differs.
    pub fn set_state(&self, state: ConnectionState) {
        if self.state() != state {
            self.state.sender().send(state);
        }
    }

    /// New state watcher, or `None` when all watcher slots are taken.
    pub fn watch_state(&self) -> Option<StateWatcher<'_>> {
        self.state.receiver()
    }
}

// ── Tests ────────────────────────────────────────────────────
