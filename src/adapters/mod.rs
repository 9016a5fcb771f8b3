//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter    | Implements | Connects to                        |
//! |------------|------------|------------------------------------|
//! | `log_sink` | EventSink  | `log` facade                       |
//! | `sim`      | Transport  | In-memory peripheral for host tests|

pub mod log_sink;
pub mod sim;
