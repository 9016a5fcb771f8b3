//! Connection-wide operations: link setup and teardown, discovery, MTU,
//! RSSI, connection priority and PHY.

use embassy_time::{Duration, Timer, with_timeout};
use log::{info, warn};

use super::{Operation, OperationContext, SingleResponse, malformed};
use crate::error::{DisconnectReason, Error, Result};
use crate::gatt::{ConnectionState, OperationKind, Services, Target};
use crate::queue::{Priority, QueueSlot};
use crate::transport::{ConnectionPriority, Payload, PhyCoding, PhyMask, PhyPair, Request};

/// Establish the link.
///
/// With `auto_connect` the stack may take arbitrarily long, so the slot is
/// released right after the start call and no timeout applies.
pub struct Connect {
    pub auto_connect: bool,
}

impl Operation for Connect {
    type Output = ();

    fn name(&self) -> &'static str {
        "connect"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<()> {
        let events = ctx.events();
        if events.state() == ConnectionState::Connected {
            return Ok(());
        }
        events.set_state(ConnectionState::Connecting);
        let waiter = events
            .completions()
            .register(OperationKind::ConnectionState, Target::Device);
        if !ctx.transport().start(&Request::Connect {
            auto_connect: self.auto_connect,
        }) {
            events.set_state(ConnectionState::Disconnected);
            return Err(Error::CannotStart(OperationKind::Connect));
        }

        let event = if self.auto_connect {
            slot.release();
            waiter.await
        } else {
            let event = with_timeout(ctx.config().connect_timeout(), waiter).await;
            slot.release();
            match event {
                Ok(event) => event,
                Err(_) => {
                    events.set_state(ConnectionState::Disconnected);
                    return Err(Error::Timeout(OperationKind::Connect));
                }
            }
        };

        if !event.status.is_success() {
            return Err(Error::Status {
                kind: OperationKind::Connect,
                status: event.status,
            });
        }
        match event.payload {
            Payload::State(ConnectionState::Connected) => Ok(()),
            Payload::State(_) => Err(DisconnectReason::Link(event.status).into()),
            _ => Err(malformed(OperationKind::Connect)),
        }
    }
}

/// Close the link.  Never preempted by the disconnection it causes; a
/// refused start or a timeout still counts as disconnected.
pub struct Disconnect;

impl Operation for Disconnect {
    type Output = ();

    fn name(&self) -> &'static str {
        "disconnect"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn preemptible(&self) -> bool {
        false
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<()> {
        let events = ctx.events();
        if events.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        events.set_state(ConnectionState::Disconnecting);
        let waiter = events
            .completions()
            .register(OperationKind::ConnectionState, Target::Device);
        if ctx.transport().start(&Request::Disconnect) {
            if with_timeout(ctx.config().disconnect_timeout(), waiter)
                .await
                .is_err()
            {
                warn!("disconnect: no confirmation, assuming link is down");
            }
        } else {
            warn!("disconnect: start refused, assuming link is down");
        }
        slot.release();
        events.set_state(ConnectionState::Disconnected);
        info!("disconnect: complete");
        Ok(())
    }
}

/// Discover the attribute table.  On timeout, whatever the stack already
/// holds is accepted if non-empty.
pub struct DiscoverServices {
    pub timeout: Duration,
}

impl Operation for DiscoverServices {
    type Output = Services;

    fn name(&self) -> &'static str {
        "discover services"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<Services> {
        let kind = OperationKind::ServiceDiscovery;
        SingleResponse::new(kind, Target::Device, self.timeout)
            .run_with_fallback(
                ctx,
                slot,
                &Request::DiscoverServices,
                |payload| match payload {
                    Payload::Services(services) => Ok(services),
                    _ => Err(malformed(kind)),
                },
                || {
                    ctx.transport()
                        .cached_services()
                        .filter(|s| !s.is_empty())
                        .ok_or(Error::Timeout(kind))
                },
            )
            .await
    }
}

/// Negotiate a larger ATT MTU.  Resolves with the MTU the peer accepted.
pub struct RequestMtu {
    pub mtu: u16,
}

impl Operation for RequestMtu {
    type Output = u16;

    fn name(&self) -> &'static str {
        "request mtu"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<u16> {
        let kind = OperationKind::Mtu;
        let mtu = SingleResponse::new(kind, Target::Device, ctx.config().operation_timeout())
            .run(ctx, slot, &Request::RequestMtu(self.mtu), |payload| match payload {
                Payload::Mtu(mtu) => Ok(mtu),
                _ => Err(malformed(kind)),
            })
            .await?;
        ctx.events().mtu().update(mtu);
        Ok(mtu)
    }
}

pub struct ReadRssi;

impl Operation for ReadRssi {
    type Output = i16;

    fn name(&self) -> &'static str {
        "read rssi"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<i16> {
        let kind = OperationKind::ReadRssi;
        SingleResponse::new(kind, Target::Device, ctx.config().operation_timeout())
            .run(ctx, slot, &Request::ReadRssi, |payload| match payload {
                Payload::Rssi(rssi) => Ok(rssi),
                _ => Err(malformed(kind)),
            })
            .await
    }
}

/// Ask for new link parameters.  The stack gives no completion for this, so
/// the slot is held for `settle` to let the new interval take effect.
pub struct RequestConnectionPriority {
    pub priority: ConnectionPriority,
    pub settle: Duration,
}

impl Operation for RequestConnectionPriority {
    type Output = ();

    fn name(&self) -> &'static str {
        "request connection priority"
    }

    async fn run(self, ctx: &OperationContext<'_>, _slot: &mut QueueSlot) -> Result<()> {
        if !ctx
            .transport()
            .start(&Request::RequestConnectionPriority(self.priority))
        {
            return Err(Error::CannotStart(OperationKind::ConnectionPriority));
        }
        Timer::after(self.settle).await;
        Ok(())
    }
}

fn expect_phy(kind: OperationKind, payload: Payload) -> Result<PhyPair> {
    match payload {
        Payload::Phy(pair) => Ok(pair),
        _ => Err(malformed(kind)),
    }
}

pub struct ReadPhy;

impl Operation for ReadPhy {
    type Output = PhyPair;

    fn name(&self) -> &'static str {
        "read phy"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<PhyPair> {
        let kind = OperationKind::PhyRead;
        SingleResponse::new(kind, Target::Device, ctx.config().operation_timeout())
            .run(ctx, slot, &Request::ReadPhy, |payload| expect_phy(kind, payload))
            .await
    }
}

/// Ask for preferred PHYs.  Resolves with the PHYs the link ended up on,
/// which may differ from the preference.
pub struct SetPreferredPhy {
    pub tx: PhyMask,
    pub rx: PhyMask,
    pub coding: PhyCoding,
}

impl Operation for SetPreferredPhy {
    type Output = PhyPair;

    fn name(&self) -> &'static str {
        "set preferred phy"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<PhyPair> {
        let kind = OperationKind::PhyUpdate;
        let request = Request::SetPreferredPhy {
            tx: self.tx,
            rx: self.rx,
            coding: self.coding,
        };
        let pair = SingleResponse::new(kind, Target::Device, ctx.config().operation_timeout())
            .run(ctx, slot, &request, |payload| expect_phy(kind, payload))
            .await?;
        info!("link: phy tx {:?} rx {:?}", pair.tx, pair.rx);
        Ok(pair)
    }
}
