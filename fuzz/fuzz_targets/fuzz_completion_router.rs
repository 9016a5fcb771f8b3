//! Fuzz target: `CompletionRouter`
//!
//! Interleaves register / dispatch / drop in arbitrary order and checks the
//! routing invariants: an event fills at most one waiter, the oldest
//! matching one, and a dropped waiter never receives anything.
//!
//! cargo fuzz run fuzz_completion_router

#![no_main]

use std::collections::VecDeque;

use futures_lite::future::{block_on, poll_once};
use gattqueue::connection::CompletionRouter;
use gattqueue::gatt::{CharacteristicId, GattStatus, OperationKind, Target};
use gattqueue::transport::{CompletionEvent, Payload};
use libfuzzer_sys::fuzz_target;
use uuid::Uuid;

fn target(n: u8) -> Target {
    Target::Characteristic(CharacteristicId::new(Uuid::from_u128(u128::from(n & 0x3)), 0))
}

fuzz_target!(|data: &[u8]| {
    let router = CompletionRouter::new();
    let mut waiters = VecDeque::new();
    let mut tag = 0u8;

    for op in data {
        let n = op & 0x3;
        match op >> 6 {
            0 => {
                let waiter = router.register(OperationKind::CharacteristicRead, target(n));
                waiters.push_back((n, waiter));
            }
            1 => {
                tag = tag.wrapping_add(1);
                let oldest = waiters.iter().position(|(k, _)| *k == n);
                let event = CompletionEvent::new(
                    OperationKind::CharacteristicRead,
                    target(n),
                    GattStatus::SUCCESS,
                    Payload::Value(vec![tag]),
                );
                let delivered = router.dispatch(event);
                assert_eq!(delivered, oldest.is_some(), "delivery must match a live waiter");
                if let Some(idx) = oldest {
                    if let Some((_, mut waiter)) = waiters.remove(idx) {
                        let got = block_on(poll_once(&mut waiter));
                        let Some(event) = got else {
                            panic!("delivered event not observable");
                        };
                        assert_eq!(event.payload, Payload::Value(vec![tag]));
                    }
                }
            }
            2 => {
                waiters.pop_front();
            }
            _ => {
                waiters.pop_back();
            }
        }
        assert_eq!(router.waiting(), waiters.len());
    }
});
