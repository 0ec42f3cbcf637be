use super::{decode_version, encode_version, Version};
use crate::error::Result;
use crate::transport::{drain_if_near_full, NotificationId, QueueId, Rank, SegmentId, Transport};
use std::fmt;
use std::sync::Arc;

/// Receives model versions from the parent and acknowledges them.
pub struct TransferConsumer<Tr: Transport> {
    transport: Arc<Tr>,
    parent: Rank,
    segment: SegmentId,
    local_notification: NotificationId,
    remote_notification: NotificationId,
    queue: QueueId,
    queue_margin: usize,
    status: Version,
}

impl<Tr: Transport> TransferConsumer<Tr> {
    pub fn new(
        transport: Arc<Tr>,
        parent: Rank,
        segment: SegmentId,
        local_notification: NotificationId,
        remote_notification: NotificationId,
        queue: QueueId,
        queue_margin: usize,
    ) -> Self {
        Self {
            transport,
            parent,
            segment,
            local_notification,
            remote_notification,
            queue,
            queue_margin,
            status: 0,
        }
    }

    /// Newest version the parent has delivered.
    pub fn status(&mut self) -> Result<Version> {
        let value = self
            .transport
            .notify_reset(self.segment, self.local_notification)?;
        if let Some(version) = decode_version(value) {
            self.status = version;
        }
        Ok(self.status)
    }

    /// Tells the parent that this subtree is done with `version`.
    pub fn acknowledge(&mut self, version: Version) -> Result<()> {
        let value = encode_version(version, self.transport.notification_max())?;
        drain_if_near_full(&*self.transport, self.queue, self.queue_margin)?;
        self.transport.notify(
            self.parent,
            self.segment,
            self.remote_notification,
            value,
            self.queue,
        )?;
        tracing::trace!(parent = self.parent, version, "acknowledged model");
        Ok(())
    }

    pub fn parent(&self) -> Rank {
        self.parent
    }
}

impl<Tr: Transport> fmt::Debug for TransferConsumer<Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferConsumer")
            .field("parent", &self.parent)
            .field("segment", &self.segment)
            .field("local_notification", &self.local_notification)
            .field("remote_notification", &self.remote_notification)
            .field("queue", &self.queue)
            .field("queue_depth", &self.transport.queue_depth())
            .field("status", &self.status)
            .finish()
    }
}
