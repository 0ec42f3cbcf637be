use super::{check_capacity, decode_pointer, encode_pointer, occupied, ChannelConfig};
use crate::blob::{accumulate, Element};
use crate::error::{CommError, Result};
use crate::transport::{drain_if_near_full, Transport};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

/// The receiving half of a ring channel.
///
/// Consuming and acknowledging are one operation: every successful
/// [`read`](Self::read) or [`add`](Self::add) immediately tells the writer the
/// new read pointer. A reader that consumed without notifying would stall its
/// writer forever.
pub struct RingReader<T: Element, Tr: Transport> {
    transport: Arc<Tr>,
    config: ChannelConfig,
    read_pointer: usize,
    write_pointer: usize,
    _marker: PhantomData<T>,
}

impl<T: Element, Tr: Transport> RingReader<T, Tr> {
    /// Creates the reader end of a channel.
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

    /// Number of elements that can be read right now.
    pub fn available(&mut self) -> Result<usize> {
        self.update_write_pointer()?;
        Ok(occupied(self.read_pointer, self.write_pointer, self.config.capacity))
    }

    fn update_write_pointer(&mut self) -> Result<()> {
        let value = self
            .transport
            .notify_reset(self.config.local.segment, self.config.local.notification)?;
        if let Some(pointer) = decode_pointer(value) {
            self.write_pointer = pointer;
        }
        Ok(())
    }

    /// Copies the next `out.len()` elements into `out`.
    ///
    /// Returns `Ok(false)` without side effects if fewer elements are available.
    pub fn read(&mut self, out: &mut [T]) -> Result<bool> {
        self.consume(out, |dst, src| dst.copy_from_slice(src))
    }

    /// Adds the next `out.len()` elements into `out` element-wise.
    ///
    /// Returns `Ok(false)` without side effects if fewer elements are available.
    pub fn add(&mut self, out: &mut [T]) -> Result<bool> {
        self.consume(out, accumulate)
    }

    fn consume(&mut self, out: &mut [T], op: impl Fn(&mut [T], &[T])) -> Result<bool> {
        let len = out.len();
        if len == 0 {
            return Ok(true);
        }
        let available = self.available()?;
        if len > available {
            tracing::trace!(len, available, peer = self.config.remote.rank, "ring drained");
            return Ok(false);
        }

        let capacity = self.config.capacity;
        let start = self.read_pointer;
        let head = len.min(capacity - start);
        let from = self.config.local.offset;
        let to = from + capacity * size_of::<T>();
        self.transport
            .with_segment(self.config.local.segment, |segment| -> Result<()> {
                let region: &[T] = bytemuck::try_cast_slice(&segment[from..to])
                    .map_err(|e| CommError::Layout(e.to_string()))?;
                let (first, rest) = out.split_at_mut(head);
                op(first, &region[start..start + head]);
                op(rest, &region[..len - head]);
                Ok(())
            })??;
        self.read_pointer = (start + len) % capacity;

        drain_if_near_full(&*self.transport, self.config.queue, self.config.queue_margin)?;
        self.transport.notify(
            self.config.remote.rank,
            self.config.remote.segment,
            self.config.remote.notification,
            encode_pointer(self.read_pointer),
            self.config.queue,
        )?;
        Ok(true)
    }
}

impl<T: Element, Tr: Transport> fmt::Debug for RingReader<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingReader")
            .field("capacity", &self.config.capacity)
            .field("read_pointer", &self.read_pointer)
            .field("write_pointer", &self.write_pointer)
            .field("local", &self.config.local)
            .field("remote", &self.config.remote)
            .field("queue", &self.config.queue)
            .finish()
    }
}
