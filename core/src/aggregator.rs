//! # Gradient Reduction
//!
//! The [`DiffAggregator`] sums per-layer gradient blobs up the reduce tree.
//! Every rank except the root forwards exactly one stream to its parent; the
//! root ends up with the element-wise sum over all ranks.
//!
//! ## 🎓 Pipelining
//!
//! Backpropagation produces gradients last layer first. Each blob is appended
//! with [`add_calculated_blob`](DiffAggregator::add_calculated_blob) as soon as
//! it exists, and every [`step`](DiffAggregator::step) pushes as far as the
//! rings allow:
//!
//! ```text
//!   blob index:        0   1   2   3
//!   read from child A  ✔   ✔   ✔   .
//!   read from child B  ✔   ✔   .   .
//!   written to parent  ✔   ✔   .   .     <- waits for B to finish blob 2
//! ```
//!
//! A blob is forwarded only once every child has folded its contribution in,
//! so the parent always receives subtree sums. The blob order is the same on
//! every rank, which is what keeps the byte streams aligned.

use crate::blob::{Blob, Element};
use crate::config::{CommConfig, DiffConfig};
use crate::error::{CommError, Result};
use crate::ring::{check_capacity, ChannelConfig, Endpoint, RingReader, RingWriter};
use crate::topology::{Edge, EdgeLayout, ReduceTree};
use crate::transport::{NotificationId, SegmentId, Transport};
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

/// A channel together with the index of the next blob it handles.
struct Tracked<C> {
    channel: C,
    next: usize,
}

/// Sums gradient blobs along the reduce tree.
pub struct DiffAggregator<T: Element, Tr: Transport> {
    transport: Arc<Tr>,
    segment: SegmentId,
    capacity: usize,
    writers: Vec<Tracked<RingWriter<T, Tr>>>,
    readers: Vec<Tracked<RingReader<T, Tr>>>,
    blobs: Vec<Blob<T>>,
}

impl<T: Element, Tr: Transport> DiffAggregator<T, Tr> {
    /// Derives the reduce tree, registers the ring segment and builds one
    /// channel per tree edge.
    ///
    /// Segment creation is local: in a multi-process deployment the host must
    /// run a [`barrier`](Transport::barrier) after every rank has constructed
    /// its aggregator and before the first [`step`](Self::step).
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration (see [`CommConfig::validate`]), on a
    /// capacity beyond the notification range, when the topology
    /// needs more notification ids than the transport offers, or when the
    /// segment cannot be registered.
    pub fn new(transport: Arc<Tr>, config: &CommConfig) -> Result<Self> {
        config.validate()?;
        let diff = &config.diff;
        check_capacity(diff.capacity, transport.notification_max())?;

        let rank = transport.rank();
        let tree = ReduceTree::new(transport.num_ranks(), diff.branching_factor)?;
        let layout = EdgeLayout::new(&tree, rank)?;
        check_notification_ids(diff.notification_base, layout.len(), transport.notification_slots())?;

        let elem = size_of::<T>();
        let size = (diff.capacity * elem * layout.len()).max(elem);
        transport.segment_create(diff.segment, size)?;
        tracing::debug!(
            rank,
            writes = ?layout.writes.iter().map(|e| e.peer).collect::<Vec<_>>(),
            reads = ?layout.reads.iter().map(|e| e.peer).collect::<Vec<_>>(),
            segment = diff.segment,
            size,
            "diff aggregator ready"
        );

        let mut aggregator = Self {
            transport: Arc::clone(&transport),
            segment: diff.segment,
            capacity: diff.capacity,
            writers: Vec::with_capacity(layout.writes.len()),
            readers: Vec::with_capacity(layout.reads.len()),
            blobs: Vec::new(),
        };
        // From here on Drop releases the segment if a channel fails to build.
        for edge in &layout.writes {
            let config = channel_config::<T>(diff, rank, edge, diff.writer_queue_margin);
            aggregator.writers.push(Tracked {
                channel: RingWriter::new(Arc::clone(&transport), config)?,
                next: 0,
            });
        }
        for edge in &layout.reads {
            let config = channel_config::<T>(diff, rank, edge, diff.reader_queue_margin);
            aggregator.readers.push(Tracked {
                channel: RingReader::new(Arc::clone(&transport), config)?,
                next: 0,
            });
        }
        Ok(aggregator)
    }

    /// Advances every channel as far as it goes without waiting.
    pub fn step(&mut self) -> Result<()> {
        let count = self.blobs.len();
        for reader in &mut self.readers {
            while reader.next < count {
                let blob = &mut self.blobs[reader.next];
                if !reader.channel.add(blob.data_mut())? {
                    break;
                }
                reader.next += 1;
            }
        }

        let folded = self.folded();
        for writer in &mut self.writers {
            while writer.next < folded {
                let blob = &self.blobs[writer.next];
                if !writer.channel.write(blob.data())? {
                    break;
                }
                tracing::trace!(index = writer.next, count = blob.count(), "forwarded blob");
                writer.next += 1;
            }
        }
        Ok(())
    }

    /// Number of leading blobs every child has contributed to.
    fn folded(&self) -> usize {
        self.readers
            .iter()
            .map(|r| r.next)
            .min()
            .unwrap_or(self.blobs.len())
    }

    /// Whether every child has contributed to blob `index`.
    pub fn read_finished(&self, index: usize) -> bool {
        self.readers.iter().all(|r| r.next > index)
    }

    /// Whether every registered blob has been received and forwarded.
    ///
    /// With no blobs registered this is trivially true.
    pub fn finished(&self) -> bool {
        let count = self.blobs.len();
        self.readers.iter().all(|r| r.next >= count) && self.writers.iter().all(|w| w.next >= count)
    }

    /// Appends the next gradient blob.
    ///
    /// # Errors
    ///
    /// `BlobExceedsCapacity` if the blob could never pass through a ring.
    pub fn add_calculated_blob(&mut self, blob: Blob<T>) -> Result<()> {
        if blob.count() >= self.capacity {
            return Err(CommError::BlobExceedsCapacity {
                count: blob.count(),
                capacity: self.capacity,
            });
        }
        self.blobs.push(blob);
        Ok(())
    }

    /// Starts a new iteration and hands back the blobs of the last one.
    ///
    /// Ring pointers carry over, so the next iteration continues where the
    /// streams left off.
    pub fn reset(&mut self) -> Vec<Blob<T>> {
        for reader in &mut self.readers {
            reader.next = 0;
        }
        for writer in &mut self.writers {
            writer.next = 0;
        }
        std::mem::take(&mut self.blobs)
    }

    pub fn blobs(&self) -> &[Blob<T>] {
        &self.blobs
    }

    pub fn blob(&self, index: usize) -> Option<&Blob<T>> {
        self.blobs.get(index)
    }

    /// Ring capacity per edge, in elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_writers(&self) -> usize {
        self.writers.len()
    }

    pub fn num_readers(&self) -> usize {
        self.readers.len()
    }
}

fn channel_config<T: Element>(diff: &DiffConfig, rank: usize, edge: &Edge, margin: usize) -> ChannelConfig {
    let stride = diff.capacity * size_of::<T>();
    ChannelConfig {
        capacity: diff.capacity,
        local: Endpoint {
            rank,
            segment: diff.segment,
            notification: diff.notification_base + edge.local_index as NotificationId,
            offset: edge.local_index * stride,
        },
        remote: Endpoint {
            rank: edge.peer,
            segment: diff.segment,
            notification: diff.notification_base + edge.remote_index as NotificationId,
            offset: edge.remote_index * stride,
        },
        queue: diff.queue,
        queue_margin: margin,
    }
}

/// Rejects a layout whose notification ids would run past the last slot.
pub(crate) fn check_notification_ids(
    base: NotificationId,
    needed: usize,
    available: usize,
) -> Result<()> {
    if (base as usize).saturating_add(needed) > available {
        return Err(CommError::NotificationIdsExhausted {
            base,
            needed,
            available,
        });
    }
    Ok(())
}

impl<T: Element, Tr: Transport> Drop for DiffAggregator<T, Tr> {
    fn drop(&mut self) {
        if let Err(err) = self.transport.segment_delete(self.segment) {
            tracing::error!(error = %err, segment = self.segment, "failed to release diff segment");
        }
    }
}

impl<T: Element, Tr: Transport> fmt::Debug for DiffAggregator<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = |peer: usize, next: usize| format!("rank{peer}@{next}");
        f.debug_struct("DiffAggregator")
            .field("rank", &self.transport.rank())
            .field("segment", &self.segment)
            .field("capacity", &self.capacity)
            .field("blobs", &self.blobs.len())
            .field(
                "writers",
                &self
                    .writers
                    .iter()
                    .map(|w| progress(w.channel.config().remote.rank, w.next))
                    .collect::<Vec<_>>(),
            )
            .field(
                "readers",
                &self
                    .readers
                    .iter()
                    .map(|r| progress(r.channel.config().remote.rank, r.next))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
