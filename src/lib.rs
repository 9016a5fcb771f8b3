//! gattqueue: serialized GATT operation engine for BLE central roles.
//!
//! A platform binding implements [`transport::Transport`] and feeds its
//! callbacks into a [`connection::GattEvents`] hub.  Everything else (the
//! single-slot priority queue, completion correlation, notification
//! multiplexing, long writes, service discovery caching, disconnection
//! fan-out) is platform independent and runtime agnostic.
//!
//! ```text
//!   Connection ──▶ OperationQueue ──▶ Operation::run ──start──▶ Transport
//!       ▲                                   ▲                      │
//!       │                      CompletionRouter ◀── GattEvents ◀───┘
//!       └────────── DisconnectionRouter ◀───────────┘
//! ```

#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gatt;
pub mod ops;
pub mod queue;
pub mod sync;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{Connection, GattEvents, NotificationStream, SetupMode};
pub use error::{DisconnectReason, Error, Missing, Result};
pub use gatt::{
    Characteristic, CharacteristicId, ConnectionState, DescriptorId, GattStatus,
    NotificationMode, OperationKind, Properties, Service, Services, Target,
};
pub use ops::{LongWrite, Operation, OperationContext};
pub use queue::{Priority, QueueSlot};
pub use transport::{
    CompletionEvent, Payload, Phy, PhyCoding, PhyMask, PhyPair, Request, Transport,
};
