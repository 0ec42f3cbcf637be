//! An in-process fabric that simulates a cluster of ranks.
//!
//! All ranks share one [`LocalFabric`]. Each rank gets a [`LocalTransport`]
//! handle implementing [`Transport`]. Segments are plain heap buffers guarded
//! by a mutex, notification slots are atomics, and completion queues are
//! counters with a finite depth, so queue exhaustion behaves like on a real
//! fabric: posting to a full queue is an error.
//!
//! Puts complete synchronously: data and notification land before the call
//! returns, which trivially satisfies write-before-notify. Completion
//! reporting can still lag behind (see [`FabricConfig::completion_latency`])
//! to exercise the "not yet" path of [`Transport::poll`].
//!
//! Ranks may be driven round-robin from a single thread or from one thread
//! each. [`Transport::barrier`] needs one thread per rank.

use super::{
    NotificationId, NotificationValue, QueueId, Rank, SegmentId, Transport, TransportError,
    WriteRequest,
};
use crossbeam::utils::CachePadded;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, RwLock};

/// Limits of the simulated fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricConfig {
    /// Completion queues per rank.
    pub queues: usize,
    /// Outstanding requests a queue accepts before rejecting posts.
    pub queue_depth: usize,
    /// Notification slots per segment.
    pub notification_slots: usize,
    /// Largest value a notification slot can hold.
    pub notification_max: NotificationValue,
    /// Number of polls that report "not yet" after each post.
    pub completion_latency: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            queues: 8,
            queue_depth: 1024,
            notification_slots: 1 << 16,
            notification_max: NotificationValue::MAX,
            completion_latency: 0,
        }
    }
}

struct Segment {
    // u64 words keep the bytes 8-byte aligned.
    words: Mutex<Vec<u64>>,
    len: usize,
    notifications: Box<[AtomicU32]>,
}

impl Segment {
    fn new(len: usize, slots: usize) -> Self {
        Self {
            words: Mutex::new(vec![0u64; len.div_ceil(8)]),
            len,
            notifications: (0..slots).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    fn check_range(
        &self,
        segment: SegmentId,
        offset: usize,
        size: usize,
    ) -> Result<(), TransportError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TransportError::OutOfBounds {
                segment,
                offset,
                size,
                len: self.len,
            }),
        }
    }

    fn notification(&self, id: NotificationId) -> Result<&AtomicU32, TransportError> {
        self.notifications
            .get(id as usize)
            .ok_or(TransportError::InvalidNotification {
                id,
                slots: self.notifications.len(),
            })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<u64>>, TransportError> {
        self.words
            .lock()
            .map_err(|_| TransportError::Fabric("segment lock poisoned".to_string()))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    outstanding: usize,
    pending_polls: usize,
}

struct FabricInner {
    num_ranks: usize,
    config: FabricConfig,
    segments: RwLock<HashMap<(Rank, SegmentId), Arc<Segment>>>,
    queues: Vec<CachePadded<Mutex<QueueState>>>,
    barrier: Barrier,
}

impl FabricInner {
    fn segment(&self, rank: Rank, segment: SegmentId) -> Result<Arc<Segment>, TransportError> {
        let table = self
            .segments
            .read()
            .map_err(|_| TransportError::Fabric("segment table poisoned".to_string()))?;
        table
            .get(&(rank, segment))
            .cloned()
            .ok_or(TransportError::SegmentNotFound { rank, segment })
    }

    fn check_rank(&self, rank: Rank) -> Result<(), TransportError> {
        if rank >= self.num_ranks {
            return Err(TransportError::InvalidRank {
                rank,
                num_ranks: self.num_ranks,
            });
        }
        Ok(())
    }

    fn queue(&self, rank: Rank, queue: QueueId) -> Result<MutexGuard<'_, QueueState>, TransportError> {
        if queue as usize >= self.config.queues {
            return Err(TransportError::InvalidQueue {
                queue,
                queues: self.config.queues,
            });
        }
        self.queues[rank * self.config.queues + queue as usize]
            .lock()
            .map_err(|_| TransportError::Fabric("queue lock poisoned".to_string()))
    }

    /// Reserves a slot on a queue for a new request.
    fn post(&self, rank: Rank, queue: QueueId) -> Result<(), TransportError> {
        let mut state = self.queue(rank, queue)?;
        if state.outstanding >= self.config.queue_depth {
            return Err(TransportError::QueueFull {
                queue,
                depth: self.config.queue_depth,
            });
        }
        state.outstanding += 1;
        state.pending_polls = self.config.completion_latency;
        Ok(())
    }

    fn transfer(&self, rank: Rank, request: &WriteRequest) -> Result<Arc<Segment>, TransportError> {
        self.check_rank(request.rank)?;
        let source = self.segment(rank, request.local_segment)?;
        source.check_range(request.local_segment, request.local_offset, request.size)?;
        let target = self.segment(request.rank, request.remote_segment)?;
        target.check_range(request.remote_segment, request.remote_offset, request.size)?;

        // Staged through a temporary so a rank may put into its own segment.
        let staged = {
            let words = source.lock()?;
            let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
            bytes[request.local_offset..request.local_offset + request.size].to_vec()
        };
        {
            let mut words = target.lock()?;
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
            bytes[request.remote_offset..request.remote_offset + request.size]
                .copy_from_slice(&staged);
        }
        Ok(target)
    }

    fn check_value(&self, value: NotificationValue) -> Result<(), TransportError> {
        if value == 0 {
            return Err(TransportError::ZeroNotification);
        }
        Ok(())
    }
}

/// A simulated cluster shared by all rank handles.
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl LocalFabric {
    /// Creates a fabric for `num_ranks` ranks with default limits.
    pub fn new(num_ranks: usize) -> Self {
        Self::with_config(num_ranks, FabricConfig::default())
    }

    pub fn with_config(num_ranks: usize, config: FabricConfig) -> Self {
        let queues = (0..num_ranks * config.queues)
            .map(|_| CachePadded::new(Mutex::new(QueueState::default())))
            .collect();
        Self {
            inner: Arc::new(FabricInner {
                num_ranks,
                barrier: Barrier::new(num_ranks.max(1)),
                segments: RwLock::new(HashMap::new()),
                queues,
                config,
            }),
        }
    }

    pub fn num_ranks(&self) -> usize {
        self.inner.num_ranks
    }

    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    /// Returns the handle for one rank.
    pub fn transport(&self, rank: Rank) -> Result<LocalTransport, TransportError> {
        self.inner.check_rank(rank)?;
        Ok(LocalTransport {
            rank,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Returns the handles of all ranks, in rank order.
    pub fn transports(&self) -> Vec<LocalTransport> {
        (0..self.inner.num_ranks)
            .map(|rank| LocalTransport {
                rank,
                inner: Arc::clone(&self.inner),
            })
            .collect()
    }
}

impl fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFabric")
            .field("num_ranks", &self.inner.num_ranks)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// One rank's view of a [`LocalFabric`].
#[derive(Clone)]
pub struct LocalTransport {
    rank: Rank,
    inner: Arc<FabricInner>,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("rank", &self.rank)
            .field("num_ranks", &self.inner.num_ranks)
            .finish()
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.inner.num_ranks
    }

    fn segment_create(&self, segment: SegmentId, size: usize) -> Result<(), TransportError> {
        let mut table = self
            .inner
            .segments
            .write()
            .map_err(|_| TransportError::Fabric("segment table poisoned".to_string()))?;
        if table.contains_key(&(self.rank, segment)) {
            return Err(TransportError::SegmentExists {
                rank: self.rank,
                segment,
            });
        }
        let slots = self.inner.config.notification_slots;
        table.insert((self.rank, segment), Arc::new(Segment::new(size, slots)));
        Ok(())
    }

    fn segment_delete(&self, segment: SegmentId) -> Result<(), TransportError> {
        let mut table = self
            .inner
            .segments
            .write()
            .map_err(|_| TransportError::Fabric("segment table poisoned".to_string()))?;
        table
            .remove(&(self.rank, segment))
            .map(|_| ())
            .ok_or(TransportError::SegmentNotFound {
                rank: self.rank,
                segment,
            })
    }

    fn with_segment<R>(
        &self,
        segment: SegmentId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, TransportError> {
        let seg = self.inner.segment(self.rank, segment)?;
        let words = seg.lock()?;
        let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
        Ok(f(&bytes[..seg.len]))
    }

    fn with_segment_mut<R>(
        &self,
        segment: SegmentId,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, TransportError> {
        let seg = self.inner.segment(self.rank, segment)?;
        let mut words = seg.lock()?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
        Ok(f(&mut bytes[..seg.len]))
    }

    fn write(&self, request: &WriteRequest) -> Result<(), TransportError> {
        self.inner.post(self.rank, request.queue)?;
        self.inner.transfer(self.rank, request)?;
        Ok(())
    }

    fn write_notify(
        &self,
        request: &WriteRequest,
        notification: NotificationId,
        value: NotificationValue,
    ) -> Result<(), TransportError> {
        self.inner.check_value(value)?;
        self.inner.post(self.rank, request.queue)?;
        let target = self.inner.transfer(self.rank, request)?;
        target.notification(notification)?.store(value, Ordering::Release);
        Ok(())
    }

    fn notify(
        &self,
        rank: Rank,
        segment: SegmentId,
        notification: NotificationId,
        value: NotificationValue,
        queue: QueueId,
    ) -> Result<(), TransportError> {
        self.inner.check_value(value)?;
        self.inner.check_rank(rank)?;
        self.inner.post(self.rank, queue)?;
        let target = self.inner.segment(rank, segment)?;
        target.notification(notification)?.store(value, Ordering::Release);
        Ok(())
    }

    fn notify_reset(
        &self,
        segment: SegmentId,
        notification: NotificationId,
    ) -> Result<NotificationValue, TransportError> {
        let seg = self.inner.segment(self.rank, segment)?;
        Ok(seg.notification(notification)?.swap(0, Ordering::AcqRel))
    }

    fn poll(&self, queue: QueueId) -> Result<bool, TransportError> {
        let mut state = self.inner.queue(self.rank, queue)?;
        if state.outstanding == 0 {
            return Ok(true);
        }
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(false);
        }
        state.outstanding = 0;
        Ok(true)
    }

    fn wait(&self, queue: QueueId) -> Result<(), TransportError> {
        let mut state = self.inner.queue(self.rank, queue)?;
        state.outstanding = 0;
        state.pending_polls = 0;
        Ok(())
    }

    fn queue_size(&self, queue: QueueId) -> Result<usize, TransportError> {
        Ok(self.inner.queue(self.rank, queue)?.outstanding)
    }

    fn queue_depth(&self) -> usize {
        self.inner.config.queue_depth
    }

    fn notification_max(&self) -> NotificationValue {
        self.inner.config.notification_max
    }

    fn notification_slots(&self) -> usize {
        self.inner.config.notification_slots
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.inner.barrier.wait();
        Ok(())
    }
}
