//! Disconnection router: fan-in of every disconnect-class signal into one
//! cached terminal error.
//!
//! ```text
//!   adapter feed ──┐
//!   link callback ─┼──▶ report(err) ──▶ first wins ──▶ broadcast + replay
//!   operations ────┘                     (later reports ignored)
//! ```

use core::task::{Context, Poll};

use log::{debug, info};

use crate::error::{DisconnectReason, Error};
use crate::sync::{OnceBroadcast, Wait};
use crate::transport::AdapterState;

pub struct DisconnectionRouter {
    terminal: OnceBroadcast<Error>,
}

impl DisconnectionRouter {
    pub const fn new() -> Self {
        Self {
            terminal: OnceBroadcast::new(),
        }
    }

    /// Returns `true` if this report became the terminal error.
    pub fn report(&self, error: Error) -> bool {
        let first = self.terminal.set(error);
        if first {
            info!("disconnection: {}", error);
        } else {
            debug!("disconnection: ignoring later report ({})", error);
        }
        first
    }

    /// Adapter feed: anything but `On` terminates the scope.
    pub fn on_adapter_state(&self, state: AdapterState) -> bool {
        if state.is_usable() {
            return false;
        }
        self.report(DisconnectReason::AdapterUnusable.into())
    }

    pub fn error(&self) -> Option<Error> {
        self.terminal.get()
    }

    pub fn is_disconnected(&self) -> bool {
        self.terminal.is_set()
    }

    /// Resolves with the terminal error, immediately if already known.
    pub fn wait(&self) -> Wait<'_, Error> {
        self.terminal.wait()
    }

    pub(crate) fn poll_wait(&self, listener: &mut Option<u64>, cx: &mut Context<'_>) -> Poll<Error> {
        self.terminal.poll_wait(listener, cx)
    }

    pub(crate) fn forget(&self, listener: &mut Option<u64>) {
        self.terminal.forget(listener);
    }
}

impl Default for DisconnectionRouter {
    fn default() -> Self {
        Self::new()
    }
}
