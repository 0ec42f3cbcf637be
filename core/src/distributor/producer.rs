use super::{decode_version, encode_version, Version};
use crate::error::Result;
use crate::transport::{drain_if_near_full, NotificationId, QueueId, Rank, SegmentId, Transport, WriteRequest};
use std::fmt;
use std::sync::Arc;

/// Pushes model versions to one child of the broadcast tree.
///
/// Counters only move forward: `have >= started_sending >= finished_sending`.
/// A new version is sent only after the child has acknowledged the previous
/// one, so at most one transfer per edge is ever in flight and the child never
/// sees its parameters overwritten while it reads them.
///
/// `finished_sending` tracks local put completion for status dumps only.
/// Upstream acknowledgements wait for `acknowledged_by_remote`, which implies
/// the put has landed.
pub struct TransferProducer<Tr: Transport> {
    transport: Arc<Tr>,
    child: Rank,
    segment: SegmentId,
    size: usize,
    local_notification: NotificationId,
    remote_notification: NotificationId,
    queue: QueueId,
    have: Version,
    started_sending: Version,
    finished_sending: Version,
    acknowledged_by_remote: Version,
}

impl<Tr: Transport> TransferProducer<Tr> {
    /// `size` is the model size in bytes, located at offset 0 on both sides.
    pub fn new(
        transport: Arc<Tr>,
        child: Rank,
        segment: SegmentId,
        size: usize,
        local_notification: NotificationId,
        remote_notification: NotificationId,
        queue: QueueId,
    ) -> Self {
        Self {
            transport,
            child,
            segment,
            size,
            local_notification,
            remote_notification,
            queue,
            have: 0,
            started_sending: 0,
            finished_sending: 0,
            acknowledged_by_remote: 0,
        }
    }

    /// Raises the newest locally available version. Never lowers it.
    pub fn lift_local_status(&mut self, version: Version) {
        self.have = self.have.max(version);
    }

    /// Refreshes the counters and sends the newest version if the child is ready.
    pub fn step(&mut self) -> Result<()> {
        self.refresh_remote_acknowledgement()?;
        self.poll_local_completion()?;

        if self.have > self.started_sending && self.started_sending <= self.acknowledged_by_remote {
            let value = encode_version(self.have, self.transport.notification_max())?;
            drain_if_near_full(&*self.transport, self.queue, 1)?;
            let request = WriteRequest {
                local_segment: self.segment,
                local_offset: 0,
                rank: self.child,
                remote_segment: self.segment,
                remote_offset: 0,
                size: self.size,
                queue: self.queue,
            };
            self.transport
                .write_notify(&request, self.remote_notification, value)?;
            tracing::trace!(child = self.child, version = self.have, "sent model");
            self.started_sending = self.have;
        }
        Ok(())
    }

    /// Picks up the newest acknowledgement the child has sent.
    pub fn refresh_remote_acknowledgement(&mut self) -> Result<Version> {
        let value = self
            .transport
            .notify_reset(self.segment, self.local_notification)?;
        if let Some(version) = decode_version(value) {
            self.acknowledged_by_remote = version;
        }
        Ok(self.acknowledged_by_remote)
    }

    /// Marks the last transfer as locally complete once the queue reports it.
    pub fn poll_local_completion(&mut self) -> Result<Version> {
        if self.started_sending > self.finished_sending && self.transport.poll(self.queue)? {
            self.finished_sending = self.started_sending;
        }
        Ok(self.finished_sending)
    }

    pub fn child(&self) -> Rank {
        self.child
    }

    pub fn have(&self) -> Version {
        self.have
    }

    pub fn started_sending(&self) -> Version {
        self.started_sending
    }

    pub fn finished_sending(&self) -> Version {
        self.finished_sending
    }

    pub fn acknowledged_by_remote(&self) -> Version {
        self.acknowledged_by_remote
    }
}

impl<Tr: Transport> fmt::Debug for TransferProducer<Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferProducer")
            .field("size", &self.size)
            .field("child", &self.child)
            .field("segment", &self.segment)
            .field("local_notification", &self.local_notification)
            .field("remote_notification", &self.remote_notification)
            .field("queue", &self.queue)
            .field("have", &self.have)
            .field("started_sending", &self.started_sending)
            .field("finished_sending", &self.finished_sending)
            .field("acknowledged_by_remote", &self.acknowledged_by_remote)
            .finish()
    }
}
