//! # One-Sided Transport
//!
//! Every collective in this crate is built on a small set of one-sided
//! remote-memory primitives, the kind offered by RDMA fabrics through
//! PGAS-style APIs.
//!
//! ## 🎓 The Model
//!
//! - Each rank registers **segments**: byte regions that any other rank may
//!   write into without involving the owner's CPU.
//! - A **put** copies bytes from a local segment into a remote segment. It is
//!   posted on a numbered **completion queue** and returns immediately.
//! - A put may carry a **notification**: a `(slot, value)` pair stored at the
//!   target once all bytes of the put have landed. The owner reads the slot
//!   and atomically resets it to zero. `0` therefore means "nothing new".
//! - A **raw notify** sets a remote slot without moving data.
//!
//! Write-before-notify is the only ordering guarantee the protocols rely on:
//! once a rank sees a notification, the data that came with it is in memory.
//!
//! ## 📦 Implementations
//!
//! * [`LocalFabric`](local::LocalFabric): simulates a whole cluster inside one
//!   process. Used by tests, benches and the simulation binary.
//! * Production fabrics implement [`Transport`] on top of their native API.

use std::fmt;
use thiserror::Error;

pub mod local;

pub use local::{FabricConfig, LocalFabric, LocalTransport};

/// Identity of one participant in the cluster, in `[0, num_ranks)`.
pub type Rank = usize;
/// Small integer naming a registered memory segment.
pub type SegmentId = u8;
/// Index of a notification slot within a segment.
pub type NotificationId = u32;
/// Value carried by a notification. Zero is reserved for "no update".
pub type NotificationValue = u32;
/// Index of a completion queue.
pub type QueueId = u8;

/// Error type for transport operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Rank {rank} is outside a cluster of {num_ranks} ranks")]
    InvalidRank { rank: Rank, num_ranks: usize },

    #[error("Segment {segment} is not registered on rank {rank}")]
    SegmentNotFound { rank: Rank, segment: SegmentId },

    #[error("Segment {segment} is already registered on rank {rank}")]
    SegmentExists { rank: Rank, segment: SegmentId },

    #[error("Access of {size} bytes at offset {offset} exceeds segment {segment} of {len} bytes")]
    OutOfBounds {
        segment: SegmentId,
        offset: usize,
        size: usize,
        len: usize,
    },

    #[error("Notification id {id} exceeds the {slots} slots per segment")]
    InvalidNotification { id: NotificationId, slots: usize },

    #[error("Notification value 0 is reserved")]
    ZeroNotification,

    #[error("Invalid queue {queue}, the fabric has {queues} queues")]
    InvalidQueue { queue: QueueId, queues: usize },

    /// Posting to a full queue is rejected; callers must drain first.
    #[error("Queue {queue} is full ({depth} outstanding requests)")]
    QueueFull { queue: QueueId, depth: usize },

    #[error("Fabric failure: {0}")]
    Fabric(String),
}

/// Source and destination of a one-sided put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub local_segment: SegmentId,
    pub local_offset: usize,
    pub rank: Rank,
    pub remote_segment: SegmentId,
    pub remote_offset: usize,
    /// Number of bytes to transfer.
    pub size: usize,
    pub queue: QueueId,
}

impl fmt::Display for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}B seg{}+{} -> rank{} seg{}+{} (q{})",
            self.size,
            self.local_segment,
            self.local_offset,
            self.rank,
            self.remote_segment,
            self.remote_offset,
            self.queue
        )
    }
}

/// Abstraction for a one-sided remote-memory fabric.
///
/// Every method except [`wait`](Transport::wait), [`barrier`](Transport::barrier)
/// and segment creation/deletion must return without waiting on a remote rank.
///
/// Segments are at least 8-byte aligned, so element views at offsets that are
/// multiples of the element size are always aligned.
pub trait Transport: Send + Sync {
    /// Returns the rank of the calling process.
    fn rank(&self) -> Rank;

    /// Returns the total number of ranks.
    fn num_ranks(&self) -> usize;

    /// Registers a zero-initialized segment of `size` bytes.
    fn segment_create(&self, segment: SegmentId, size: usize) -> Result<(), TransportError>;

    /// Releases a segment. Remote writes into it fail afterwards.
    fn segment_delete(&self, segment: SegmentId) -> Result<(), TransportError>;

    /// Runs `f` on the local bytes of a segment.
    fn with_segment<R>(
        &self,
        segment: SegmentId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, TransportError>;

    /// Runs `f` on the local bytes of a segment, mutably.
    fn with_segment_mut<R>(
        &self,
        segment: SegmentId,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, TransportError>;

    /// Posts an unnotified put.
    fn write(&self, request: &WriteRequest) -> Result<(), TransportError>;

    /// Posts a put whose notification is delivered after all of its bytes.
    fn write_notify(
        &self,
        request: &WriteRequest,
        notification: NotificationId,
        value: NotificationValue,
    ) -> Result<(), TransportError>;

    /// Posts a data-less notification to a remote slot.
    fn notify(
        &self,
        rank: Rank,
        segment: SegmentId,
        notification: NotificationId,
        value: NotificationValue,
        queue: QueueId,
    ) -> Result<(), TransportError>;

    /// Atomically reads a local notification slot and resets it to zero.
    fn notify_reset(
        &self,
        segment: SegmentId,
        notification: NotificationId,
    ) -> Result<NotificationValue, TransportError>;

    /// Checks whether every request posted on `queue` has completed.
    ///
    /// Returns `Ok(false)` when requests are still outstanding ("not yet").
    fn poll(&self, queue: QueueId) -> Result<bool, TransportError>;

    /// Blocks until every request posted on `queue` has completed.
    fn wait(&self, queue: QueueId) -> Result<(), TransportError>;

    /// Number of requests currently outstanding on `queue`.
    fn queue_size(&self, queue: QueueId) -> Result<usize, TransportError>;

    /// Maximum number of outstanding requests per queue.
    fn queue_depth(&self) -> usize;

    /// Largest value a notification slot can hold.
    fn notification_max(&self) -> NotificationValue;

    /// Number of notification slots per segment.
    fn notification_slots(&self) -> usize;

    /// Collective barrier across all ranks.
    fn barrier(&self) -> Result<(), TransportError>;
}

/// Drains the queue if fewer than `margin` slots are free.
///
/// This is the only place a steady-state operation may block: a request
/// posted to a full queue would be rejected, so the caller waits for the
/// outstanding ones before posting more.
pub(crate) fn drain_if_near_full<Tr: Transport>(
    transport: &Tr,
    queue: QueueId,
    margin: usize,
) -> Result<(), TransportError> {
    let entries = transport.queue_size(queue)?;
    if transport.queue_depth().saturating_sub(entries) < margin {
        tracing::trace!(queue, entries, "draining completion queue");
        transport.wait(queue)?;
    }
    Ok(())
}
