use super::{check_capacity, decode_pointer, encode_pointer, occupied, ChannelConfig};
use crate::blob::Element;
use crate::error::Result;
use crate::transport::{drain_if_near_full, Transport, WriteRequest};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

/// The sending half of a ring channel.
///
/// Data is staged in the writer's own region (same layout as the reader's) and
/// put from there, so a put never depends on caller memory staying alive.
pub struct RingWriter<T: Element, Tr: Transport> {
    transport: Arc<Tr>,
    config: ChannelConfig,
    read_pointer: usize,
    write_pointer: usize,
    _marker: PhantomData<T>,
}

impl<T: Element, Tr: Transport> RingWriter<T, Tr> {
    /// Creates the writer end of a channel.
    ///
    /// # Errors
    ///
    /// Fails if the capacity cannot be represented in the notification range.
    pub fn new(transport: Arc<Tr>, config: ChannelConfig) -> Result<Self> {
        check_capacity(config.capacity, transport.notification_max())?;
        Ok(Self {
            transport,
            config,
            read_pointer: 0,
            write_pointer: 0,
            _marker: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn read_pointer(&self) -> usize {
        self.read_pointer
    }

    pub fn write_pointer(&self) -> usize {
        self.write_pointer
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Number of elements that can be written right now.
    pub fn free_space(&mut self) -> Result<usize> {
        self.update_read_pointer()?;
        Ok(self.config.capacity - 1 - occupied(self.read_pointer, self.write_pointer, self.config.capacity))
    }

    fn update_read_pointer(&mut self) -> Result<()> {
        let value = self
            .transport
            .notify_reset(self.config.local.segment, self.config.local.notification)?;
        if let Some(pointer) = decode_pointer(value) {
            self.read_pointer = pointer;
        }
        Ok(())
    }

    /// Sends `data` to the reader.
    ///
    /// Returns `Ok(false)` without side effects if the channel has less free
    /// space than `data.len()`; retry once the reader has caught up.
    pub fn write(&mut self, data: &[T]) -> Result<bool> {
        let len = data.len();
        if len == 0 {
            return Ok(true);
        }
        let free = self.free_space()?;
        if len > free {
            tracing::trace!(len, free, peer = self.config.remote.rank, "ring full");
            return Ok(false);
        }
        drain_if_near_full(&*self.transport, self.config.queue, self.config.queue_margin)?;

        let capacity = self.config.capacity;
        let start = self.write_pointer;
        let head = len.min(capacity - start);
        let tail = len - head;
        self.stage(start, &data[..head])?;
        self.stage(0, &data[head..])?;

        if tail == 0 {
            let next = (start + head) % capacity;
            self.put_notify(start, head, next)?;
            self.write_pointer = next;
        } else {
            // The notification rides on the second put so the reader only
            // sees the write once both spans have landed.
            self.transport.write(&self.request(start, head))?;
            self.put_notify(0, tail, tail)?;
            self.write_pointer = tail;
        }
        Ok(true)
    }

    fn stage(&self, start: usize, data: &[T]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let from = self.config.local.offset + start * size_of::<T>();
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.transport.with_segment_mut(self.config.local.segment, |segment| {
            segment[from..from + bytes.len()].copy_from_slice(bytes)
        })?;
        Ok(())
    }

    fn request(&self, start: usize, len: usize) -> WriteRequest {
        let elem = size_of::<T>();
        WriteRequest {
            local_segment: self.config.local.segment,
            local_offset: self.config.local.offset + start * elem,
            rank: self.config.remote.rank,
            remote_segment: self.config.remote.segment,
            remote_offset: self.config.remote.offset + start * elem,
            size: len * elem,
            queue: self.config.queue,
        }
    }

    fn put_notify(&self, start: usize, len: usize, next: usize) -> Result<()> {
        self.transport.write_notify(
            &self.request(start, len),
            self.config.remote.notification,
            encode_pointer(next),
        )?;
        Ok(())
    }
}

impl<T: Element, Tr: Transport> fmt::Debug for RingWriter<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingWriter")
            .field("capacity", &self.config.capacity)
            .field("read_pointer", &self.read_pointer)
            .field("write_pointer", &self.write_pointer)
            .field("local", &self.config.local)
            .field("remote", &self.config.remote)
            .field("queue", &self.config.queue)
            .finish()
    }
}
