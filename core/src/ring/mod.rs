//! # Ring Channels
//!
//! A ring channel is a one-directional, flow-controlled element stream
//! between two ranks. The writer owns a staging region and puts data into the
//! reader's region; the reader consumes it and tells the writer how far it
//! got. Notification slots are the only synchronization signal:
//!
//! ```text
//!   writer                                   reader
//!   ------                                   ------
//!   write_pointer  --put_notify(wp + 1)-->   learns write_pointer
//!   learns read_pointer  <--notify(rp + 1)-- read_pointer
//! ```
//!
//! One slot is always left empty so that `read_pointer == write_pointer`
//! unambiguously means "empty". A channel of capacity `n` therefore carries
//! at most `n - 1` elements in flight.
//!
//! Neither side ever waits for the other. [`RingWriter::write`] and
//! [`RingReader::read`] return `Ok(false)` when there is not enough room or
//! data, and the caller retries on a later step.

use crate::error::{CommError, Result};
use crate::transport::{NotificationId, NotificationValue, QueueId, Rank, SegmentId};

pub mod reader;
pub mod writer;

pub use reader::RingReader;
pub use writer::RingWriter;

/// Default number of free queue slots a writer keeps before posting.
///
/// A wrapping write posts two requests.
pub const WRITER_QUEUE_MARGIN: usize = 3;
/// Default number of free queue slots a reader keeps before notifying.
pub const READER_QUEUE_MARGIN: usize = 1;

/// Where one end of a channel lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub rank: Rank,
    pub segment: SegmentId,
    /// Notification slot this end is signalled on.
    pub notification: NotificationId,
    /// Byte offset of the ring region within the segment.
    pub offset: usize,
}

/// Everything needed to build either half of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Capacity in elements.
    pub capacity: usize,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub queue: QueueId,
    /// Free queue slots required before posting without draining first.
    pub queue_margin: usize,
}

/// Rejects capacities whose pointers cannot be carried by a notification.
///
/// Pointers live in `[0, capacity)` and travel as `pointer + 1`, so the
/// capacity itself is the largest value ever sent.
pub fn check_capacity(capacity: usize, notification_max: NotificationValue) -> Result<()> {
    if capacity < 2 {
        return Err(CommError::CapacityTooSmall(capacity));
    }
    if capacity > notification_max as usize {
        return Err(CommError::CapacityExceedsNotificationRange {
            capacity,
            max: notification_max,
        });
    }
    Ok(())
}

/// Elements between `read` and `write`, going forward around the ring.
pub(crate) fn occupied(read: usize, write: usize, capacity: usize) -> usize {
    if read <= write {
        write - read
    } else {
        capacity - read + write
    }
}

pub(crate) fn encode_pointer(pointer: usize) -> NotificationValue {
    // Bounded by check_capacity.
    (pointer + 1) as NotificationValue
}

/// Decodes a notification; `None` means nothing arrived since the last reset.
pub(crate) fn decode_pointer(value: NotificationValue) -> Option<usize> {
    (value > 0).then(|| value as usize - 1)
}
