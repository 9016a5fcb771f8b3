//! Service discovery cache.
//!
//! Discovery runs at most once per connection scope: the first caller leads,
//! concurrent callers follow its result, later callers read the cache.  A
//! failed discovery leaves the cache empty so the next caller tries again;
//! a leader that is cancelled hands the turn to its followers.

use core::cell::RefCell;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use futures_lite::future::or;
use log::{debug, info};

use super::Connection;
use crate::error::Result;
use crate::gatt::Services;
use crate::ops::DiscoverServices;
use crate::sync::OnceBroadcast;

/// `None` means the leader gave up without a result.
type Flight = Arc<OnceBroadcast<Option<Result<Services>>>>;

enum Slot {
    Empty,
    Pending(Flight),
    Ready(Services),
}

pub(crate) enum Begin {
    Cached(Services),
    Follow(Flight),
    Lead(Flight),
}

pub(crate) struct DiscoveryCache {
    slot: Mutex<CriticalSectionRawMutex, RefCell<Slot>>,
}

impl DiscoveryCache {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(RefCell::new(Slot::Empty)),
        }
    }

    pub(crate) fn begin(&self) -> Begin {
        self.slot.lock(|s| {
            let mut s = s.borrow_mut();
            match &*s {
                Slot::Ready(services) => Begin::Cached(services.clone()),
                Slot::Pending(flight) => Begin::Follow(flight.clone()),
                Slot::Empty => {
                    let flight: Flight = Arc::new(OnceBroadcast::new());
                    *s = Slot::Pending(flight.clone());
                    Begin::Lead(flight)
                }
            }
        })
    }

    fn finish(&self, flight: &Flight, outcome: Option<Result<Services>>) {
        self.slot.lock(|s| {
            let mut s = s.borrow_mut();
            if matches!(&*s, Slot::Pending(f) if Arc::ptr_eq(f, flight)) {
                *s = match &outcome {
                    Some(Ok(services)) => Slot::Ready(services.clone()),
                    _ => Slot::Empty,
                };
            }
        });
        flight.set(outcome);
    }

    pub(crate) fn cached(&self) -> Option<Services> {
        self.slot.lock(|s| match &*s.borrow() {
            Slot::Ready(services) => Some(services.clone()),
            _ => None,
        })
    }
}

/// Leader-side guard: abandoning the flight resets the cache.
struct FlightGuard<'a> {
    cache: &'a DiscoveryCache,
    flight: Flight,
    armed: bool,
}

impl FlightGuard<'_> {
    fn complete(mut self, outcome: Result<Services>) {
        self.armed = false;
        self.cache.finish(&self.flight, Some(outcome));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("discovery: leader cancelled");
            self.cache.finish(&self.flight, None);
        }
    }
}

impl Connection {
    /// Discover services with the configured timeout.
    pub async fn discover_services(&self) -> Result<Services> {
        self.discover_services_with_timeout(self.inner.config.discovery_timeout())
            .await
    }

    /// Discover services, or return the cached table.  Concurrent callers
    /// share one discovery.
    pub async fn discover_services_with_timeout(&self, timeout: Duration) -> Result<Services> {
        let router = self.inner.events.disconnection();
        loop {
            match self.inner.discovery.begin() {
                Begin::Cached(services) => return Ok(services),
                Begin::Follow(flight) => {
                    let outcome = or(flight.wait(), async { Some(Err(router.wait().await)) }).await;
                    if let Some(result) = outcome {
                        return result;
                    }
                }
                Begin::Lead(flight) => {
                    let guard = FlightGuard {
                        cache: &self.inner.discovery,
                        flight,
                        armed: true,
                    };
                    let result = self.lead_discovery(timeout).await;
                    guard.complete(result.clone());
                    return result;
                }
            }
        }
    }

    async fn lead_discovery(&self, timeout: Duration) -> Result<Services> {
        if let Some(services) = self
            .inner
            .transport
            .cached_services()
            .filter(|s| !s.is_empty())
        {
            info!("discovery: using {} services held by the stack", services.services.len());
            return Ok(services);
        }
        let services = self.inner.submit(DiscoverServices { timeout }).await?;
        info!("discovery: {} services", services.services.len());
        Ok(services)
    }
}

// ── Tests ────────────────────────────────────────────────────
