//! Integration tests: a [`Connection`](gattqueue::Connection) driven against
//! the in-memory simulator peripheral.
//!
//! Each file covers one area; `harness` holds the shared fixture.

mod disconnection_tests;
mod harness;
mod link_tests;
mod long_write_tests;
mod notification_tests;
mod queue_tests;
