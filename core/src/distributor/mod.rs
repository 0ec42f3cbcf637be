//! # Model Broadcast
//!
//! The [`ModelDistributor`] replicates the parameter blob from rank 0 down the
//! broadcast tree. Each rank's registered segment *is* its copy of the model:
//! parents put straight into their children's segments.
//!
//! ## 🎓 Versions and acknowledgements
//!
//! Every publication on the root bumps a version counter. A version travels
//! down an edge only after the child has acknowledged the previous one, and a
//! child acknowledges only after its own compute step *and* its entire subtree
//! are done with it:
//!
//! ```text
//!            root  status=3  ack_total=2
//!           /    \
//!   status=3      status=3       <- both hold version 3
//!   ack_total=2   ack_total=3    <- left subtree still reading
//! ```
//!
//! This bounds asynchrony to one version per edge and guarantees that a rank's
//! model is never overwritten while it is being read.
//!
//! ## 📦 Host loop contract
//!
//! - Call [`step`](ModelDistributor::step) repeatedly.
//! - When [`status`](ModelDistributor::status) shows a new version, read the
//!   model with [`read_model`](ModelDistributor::read_model) and call
//!   [`acknowledge`](ModelDistributor::acknowledge) once done with it.
//! - On the root, wait for [`complete`](ModelDistributor::complete) before
//!   [`write_model`](ModelDistributor::write_model), then publish with
//!   [`update_model_on_root`](ModelDistributor::update_model_on_root).

use crate::aggregator::check_notification_ids;
use crate::blob::Element;
use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::topology::{broadcast_branching_factor, BroadcastTree, EdgeLayout, TreeTopology};
use crate::transport::{NotificationId, NotificationValue, SegmentId, Transport};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

pub mod consumer;
pub mod producer;

pub use consumer::TransferConsumer;
pub use producer::TransferProducer;

/// A model version. Version 0 is the model every rank starts with.
pub type Version = u64;

/// Encodes a version as a notification value; `0` stays reserved.
pub(crate) fn encode_version(version: Version, max: NotificationValue) -> Result<NotificationValue> {
    match version.checked_add(1) {
        Some(value) if value <= Version::from(max) => Ok(value as NotificationValue),
        _ => Err(CommError::VersionOverflow(version)),
    }
}

pub(crate) fn decode_version(value: NotificationValue) -> Option<Version> {
    (value > 0).then(|| Version::from(value) - 1)
}

/// Broadcasts the parameter blob along the broadcast tree.
pub struct ModelDistributor<T: Element, Tr: Transport> {
    transport: Arc<Tr>,
    segment: SegmentId,
    count: usize,
    branching_factor: usize,
    producers: Vec<TransferProducer<Tr>>,
    consumer: Option<TransferConsumer<Tr>>,
    status: Version,
    status_completed: Version,
    acknowledgement_local: Version,
    acknowledgement_total: Version,
    _marker: PhantomData<T>,
}

impl<T: Element, Tr: Transport> ModelDistributor<T, Tr> {
    /// Registers the model segment seeded with `initial` and wires the edges
    /// of this rank.
    ///
    /// Every rank must pass a model of the same length. As with the
    /// aggregator, the host runs a [`barrier`](Transport::barrier) between
    /// construction and the first [`step`](Self::step) when ranks are separate
    /// processes.
    pub fn new(transport: Arc<Tr>, config: &CommConfig, initial: &[T]) -> Result<Self> {
        config.validate()?;
        let model = &config.model;
        let rank = transport.rank();
        let num_ranks = transport.num_ranks();
        let branching_factor = match model.branching_factor {
            Some(b) => b,
            None => broadcast_branching_factor(num_ranks, model.max_branching_factor),
        };
        let tree = BroadcastTree::with_branching_factor(num_ranks, branching_factor)?;
        let layout = EdgeLayout::new(&tree, rank)?;
        check_notification_ids(model.notification_base, layout.len(), transport.notification_slots())?;

        let elem = size_of::<T>();
        let bytes = initial.len() * elem;
        transport.segment_create(model.segment, bytes.max(elem))?;
        tracing::debug!(
            rank,
            branching_factor,
            children = ?tree.write_ranks(rank),
            parent = ?tree.read_ranks(rank).first(),
            bytes,
            "model distributor ready"
        );

        let mut distributor = Self {
            transport: Arc::clone(&transport),
            segment: model.segment,
            count: initial.len(),
            branching_factor,
            producers: Vec::with_capacity(layout.writes.len()),
            consumer: None,
            status: 0,
            status_completed: 0,
            acknowledgement_local: 0,
            acknowledgement_total: 0,
            _marker: PhantomData,
        };
        distributor.store(initial)?;

        let notification = |index: usize| model.notification_base + index as NotificationId;
        for edge in &layout.writes {
            distributor.producers.push(TransferProducer::new(
                Arc::clone(&transport),
                edge.peer,
                model.segment,
                bytes,
                notification(edge.local_index),
                notification(edge.remote_index),
                model.transfer_queue,
            ));
        }
        distributor.consumer = layout.reads.first().map(|edge| {
            TransferConsumer::new(
                Arc::clone(&transport),
                edge.peer,
                model.segment,
                notification(edge.local_index),
                notification(edge.remote_index),
                model.acknowledge_queue,
                model.consumer_queue_margin,
            )
        });
        Ok(distributor)
    }

    /// Refreshes the local version, passes finished acknowledgements upstream
    /// and sends to children that are ready.
    pub fn step(&mut self) -> Result<()> {
        if let Some(consumer) = &mut self.consumer {
            self.status = consumer.status()?;
        }
        self.update_acknowledgement()?;

        for producer in &mut self.producers {
            producer.lift_local_status(self.status);
            producer.step()?;
        }
        self.status_completed = self
            .producers
            .iter()
            .map(TransferProducer::started_sending)
            .min()
            .unwrap_or(self.status);
        Ok(())
    }

    fn update_acknowledgement(&mut self) -> Result<()> {
        let mut acknowledgement = self.acknowledgement_local;
        for producer in &mut self.producers {
            acknowledgement = acknowledgement.min(producer.refresh_remote_acknowledgement()?);
        }
        if acknowledgement > self.acknowledgement_total {
            if let Some(consumer) = &mut self.consumer {
                consumer.acknowledge(acknowledgement)?;
            }
            self.acknowledgement_total = acknowledgement;
        }
        Ok(())
    }

    /// Records that the local compute step is done with the current version.
    pub fn acknowledge(&mut self) -> Result<()> {
        self.acknowledgement_local = self.status;
        self.update_acknowledgement()
    }

    /// Whether this rank and its whole subtree have acknowledged the version
    /// this rank last acknowledged locally.
    pub fn complete(&mut self) -> Result<bool> {
        self.update_acknowledgement()?;
        Ok(self.acknowledgement_total == self.acknowledgement_local)
    }

    /// Publishes the model currently in the segment as a new version.
    ///
    /// Only the root publishes; elsewhere this does nothing and returns `false`.
    pub fn update_model_on_root(&mut self) -> bool {
        if !self.has_update_source() {
            return false;
        }
        self.status += 1;
        true
    }

    /// Whether this rank originates model updates, i.e. has no parent.
    pub fn has_update_source(&self) -> bool {
        self.consumer.is_none()
    }

    /// Copies the local model copy into `out`.
    pub fn read_model(&self, out: &mut [T]) -> Result<()> {
        self.check_len(out.len())?;
        let bytes = self.count * size_of::<T>();
        self.transport.with_segment(self.segment, |segment| -> Result<()> {
            let model: &[T] = bytemuck::try_cast_slice(&segment[..bytes])
                .map_err(|e| CommError::Layout(e.to_string()))?;
            out.copy_from_slice(model);
            Ok(())
        })?
    }

    /// Overwrites the root's model. Publish it with
    /// [`update_model_on_root`](Self::update_model_on_root).
    ///
    /// # Errors
    ///
    /// `NotRoot` on ranks that receive the model from a parent.
    pub fn write_model(&mut self, data: &[T]) -> Result<()> {
        if !self.has_update_source() {
            return Err(CommError::NotRoot(self.transport.rank()));
        }
        self.check_len(data.len())?;
        self.store(data)
    }

    fn store(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.transport.with_segment_mut(self.segment, |segment| {
            segment[..bytes.len()].copy_from_slice(bytes)
        })?;
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.count {
            return Err(CommError::ShapeMismatch {
                expected: vec![self.count],
                got: vec![len],
            });
        }
        Ok(())
    }

    /// Newest version this rank holds.
    pub fn status(&self) -> Version {
        self.status
    }

    /// Oldest version any child has been sent.
    pub fn status_completed(&self) -> Version {
        self.status_completed
    }

    pub fn acknowledgement_local(&self) -> Version {
        self.acknowledgement_local
    }

    pub fn acknowledgement_total(&self) -> Version {
        self.acknowledgement_total
    }

    /// Number of elements in the model.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    pub fn producers(&self) -> &[TransferProducer<Tr>] {
        &self.producers
    }

    pub fn consumer(&self) -> Option<&TransferConsumer<Tr>> {
        self.consumer.as_ref()
    }
}

impl<T: Element, Tr: Transport> Drop for ModelDistributor<T, Tr> {
    fn drop(&mut self) {
        if let Err(err) = self.transport.segment_delete(self.segment) {
            tracing::error!(error = %err, segment = self.segment, "failed to release model segment");
        }
    }
}

impl<T: Element, Tr: Transport> fmt::Debug for ModelDistributor<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDistributor")
            .field("rank", &self.transport.rank())
            .field("segment", &self.segment)
            .field("count", &self.count)
            .field("status", &self.status)
            .field("status_completed", &self.status_completed)
            .field("acknowledgement_local", &self.acknowledgement_local)
            .field("acknowledgement_total", &self.acknowledgement_total)
            .field("consumer", &self.consumer)
            .field("producers", &self.producers)
            .finish()
    }
}
