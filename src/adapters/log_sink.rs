//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing operation lifecycle events to the
//! `log` facade.  A metrics or tracing adapter would implement the same
//! trait.

use log::{debug, info, warn};

use crate::events::{EventSink, OperationEvent};

/// Adapter that logs every [`OperationEvent`].
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for LogEventSink {
    fn emit(&self, event: &OperationEvent) {
        match event {
            OperationEvent::Queued {
                name,
                seq,
                priority,
            } => {
                debug!("OP | #{} {} queued ({:?})", seq, name, priority);
            }
            OperationEvent::Started { name, seq } => {
                debug!("OP | #{} {} started", seq, name);
            }
            OperationEvent::Succeeded { name, seq, elapsed } => {
                info!(
                    "OP | #{} {} ok in {} ms",
                    seq,
                    name,
                    elapsed.as_millis()
                );
            }
            OperationEvent::Failed { name, seq, error } => {
                warn!("OP | #{} {} failed: {}", seq, name, error);
            }
            OperationEvent::Removed { name, seq } => {
                debug!("OP | #{} {} cancelled before start", seq, name);
            }
        }
    }
}
