//! Operation lifecycle events and the sink port that receives them.
//!
//! ```text
//! ┌──────────────┐  Queued/Started/   ┌────────────┐
//! │ OperationQ.  │──Succeeded/Failed─▶│ EventSink  │──▶ log / metrics / trace
//! │ + protocol   │     /Removed       │  (port)    │
//! └──────────────┘                    └────────────┘
//! ```
//!
//! Emission is gated on a sink being attached to the connection; without
//! one, nothing is formatted or allocated.

use embassy_time::Duration;

use crate::error::Error;
use crate::queue::Priority;

/// Structured operation lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationEvent {
    /// Accepted into the pending list.
    Queued {
        name: &'static str,
        seq: u64,
        priority: Priority,
    },
    /// Took the queue slot.
    Started { name: &'static str, seq: u64 },
    Succeeded {
        name: &'static str,
        seq: u64,
        elapsed: Duration,
    },
    Failed {
        name: &'static str,
        seq: u64,
        error: Error,
    },
    /// Cancelled by its caller before it ever ran.
    Removed { name: &'static str, seq: u64 },
}

/// Receives [`OperationEvent`]s.  Called from whichever context drives the
/// operation, so implementations must be cheap and non-blocking.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &OperationEvent);
}
