//! Attribute operations: characteristic and descriptor reads and writes,
//! plus local notification routing.

use log::warn;

use super::{Exchange, Operation, OperationContext, SingleResponse, exchange, expect_value};
use crate::error::{Error, Result};
use crate::gatt::{CharacteristicId, DescriptorId, OperationKind, Target};
use crate::queue::QueueSlot;
use crate::transport::Request;

pub struct ReadCharacteristic {
    pub characteristic: CharacteristicId,
}

impl Operation for ReadCharacteristic {
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "read characteristic"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<Vec<u8>> {
        let kind = OperationKind::CharacteristicRead;
        SingleResponse::new(
            kind,
            Target::Characteristic(self.characteristic),
            ctx.config().operation_timeout(),
        )
        .run(
            ctx,
            slot,
            &Request::ReadCharacteristic(self.characteristic),
            |payload| expect_value(kind, payload),
        )
        .await
    }
}

/// Resolves with the bytes that were written.
pub struct WriteCharacteristic {
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}

impl Operation for WriteCharacteristic {
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "write characteristic"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<Vec<u8>> {
        let request = Request::WriteCharacteristic {
            characteristic: self.characteristic,
            value: &self.value,
        };
        SingleResponse::new(
            OperationKind::CharacteristicWrite,
            Target::Characteristic(self.characteristic),
            ctx.config().operation_timeout(),
        )
        .run(ctx, slot, &request, |_| Ok(()))
        .await?;
        Ok(self.value)
    }
}

pub struct ReadDescriptor {
    pub descriptor: DescriptorId,
}

impl Operation for ReadDescriptor {
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "read descriptor"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<Vec<u8>> {
        let kind = OperationKind::DescriptorRead;
        SingleResponse::new(
            kind,
            Target::Descriptor(self.descriptor),
            ctx.config().operation_timeout(),
        )
        .run(
            ctx,
            slot,
            &Request::ReadDescriptor(self.descriptor),
            |payload| expect_value(kind, payload),
        )
        .await
    }
}

pub struct WriteDescriptor {
    pub descriptor: DescriptorId,
    pub value: Vec<u8>,
}

impl Operation for WriteDescriptor {
    type Output = ();

    fn name(&self) -> &'static str {
        "write descriptor"
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<()> {
        let result = self.perform(ctx).await;
        slot.release();
        result
    }
}

impl WriteDescriptor {
    /// The write without slot handling.
    pub(crate) async fn perform(&self, ctx: &OperationContext<'_>) -> Result<()> {
        let request = Request::WriteDescriptor {
            descriptor: self.descriptor,
            value: &self.value,
        };
        SingleResponse::new(
            OperationKind::DescriptorWrite,
            Target::Descriptor(self.descriptor),
            ctx.config().operation_timeout(),
        )
        .run_unslotted(ctx, &request, |_| Ok(()))
        .await
    }
}

/// Toggle host-side routing of value-changed callbacks.  The stack answers
/// synchronously, so there is no completion to wait for.
pub struct LocalNotification {
    pub characteristic: CharacteristicId,
    pub enable: bool,
}

impl Operation for LocalNotification {
    type Output = ();

    fn name(&self) -> &'static str {
        if self.enable {
            "enable local notification"
        } else {
            "disable local notification"
        }
    }

    async fn run(self, ctx: &OperationContext<'_>, slot: &mut QueueSlot) -> Result<()> {
        let accepted = ctx.transport().start(&Request::SetLocalNotification {
            characteristic: self.characteristic,
            enable: self.enable,
        });
        slot.release();
        if accepted {
            Ok(())
        } else {
            Err(Error::CannotStart(OperationKind::LocalNotification))
        }
    }
}

/// Best-effort notification shutdown: write the disable value (unless the
/// peripheral has no configuration descriptor in use), then stop local
/// routing.  Runs as a background job inside another operation's slot and
/// never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationTeardown {
    pub characteristic: CharacteristicId,
    pub descriptor: Option<DescriptorId>,
    pub disable: [u8; 2],
}

impl NotificationTeardown {
    pub(crate) async fn perform(self, ctx: &OperationContext<'_>) {
        if let Some(descriptor) = self.descriptor {
            let request = Request::WriteDescriptor {
                descriptor,
                value: &self.disable,
            };
            match exchange(
                ctx,
                &request,
                OperationKind::DescriptorWrite,
                Target::Descriptor(descriptor),
                ctx.config().operation_timeout(),
            )
            .await
            {
                Ok(Exchange::Completed(event)) if event.status.is_success() => {}
                Ok(Exchange::Completed(event)) => warn!(
                    "notify teardown: {} disable write failed (status {})",
                    self.characteristic.uuid, event.status
                ),
                Ok(Exchange::TimedOut) => warn!(
                    "notify teardown: {} disable write timed out",
                    self.characteristic.uuid
                ),
                Err(e) => warn!("notify teardown: {} {}", self.characteristic.uuid, e),
            }
        }
        if !ctx.transport().start(&Request::SetLocalNotification {
            characteristic: self.characteristic,
            enable: false,
        }) {
            warn!(
                "notify teardown: {} local disable refused",
                self.characteristic.uuid
            );
        }
    }
}
