//! The data-loading side of a training rank.
//!
//! Decoding is the framework's business. What matters to an asynchronous
//! cluster is that every rank draws its own batches, starting at its own shard
//! of the dataset, so that the gradients being summed come from different
//! samples.
//!
//! # Components
//!
//! - **Dataset**: indexed access to individual items.
//! - **Sampler**: the order in which items are visited.
//! - **BatchSource**: what the training loop pulls once per step.
//! - **ShardedBatches**: a `BatchSource` over a `Dataset`, offset by rank.

pub mod sampler;

pub use sampler::{RandomSampler, Sampler, SequentialSampler};

use crate::transport::Rank;

/// A trait for accessing data items.
///
/// # Type Parameters
///
/// * `T`: The type of the data item returned by `get`.
pub trait Dataset<T>: Send + Sync {
    /// Returns the total number of items in the dataset.
    fn len(&self) -> usize;

    /// Returns `true` if the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the item at the given index.
    ///
    /// # Panics
    ///
    /// May panic if `index` is out of bounds.
    fn get(&self, index: usize) -> T;
}

impl<T: Clone + Send + Sync> Dataset<T> for Vec<T> {
    fn len(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> T {
        self[index].clone()
    }
}

/// Supplies one batch per training step.
pub trait BatchSource<T>: Send {
    fn next_batch(&mut self) -> Vec<T>;
}

/// First item of `rank`'s shard: each rank starts `len / num_ranks` items
/// after its predecessor.
pub fn shard_offset(len: usize, rank: Rank, num_ranks: usize) -> usize {
    if num_ranks == 0 {
        return 0;
    }
    (len / num_ranks) * rank
}

/// Endless batches over a dataset, starting at the rank's shard and wrapping
/// around at the end.
pub struct ShardedBatches<T, D: Dataset<T>> {
    dataset: D,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, D: Dataset<T>> ShardedBatches<T, D> {
    pub fn new(
        dataset: D,
        sampler: &dyn Sampler,
        batch_size: usize,
        rank: Rank,
        num_ranks: usize,
    ) -> Self {
        let len = dataset.len();
        Self {
            order: sampler.sample(len),
            cursor: shard_offset(len, rank, num_ranks),
            dataset,
            batch_size,
            _marker: std::marker::PhantomData,
        }
    }

    /// Position of the next item within the visiting order.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl<T, D: Dataset<T>> BatchSource<T> for ShardedBatches<T, D> {
    fn next_batch(&mut self) -> Vec<T> {
        let len = self.order.len();
        if len == 0 {
            return Vec::new();
        }
        let batch = (0..self.batch_size)
            .map(|i| self.dataset.get(self.order[(self.cursor + i) % len]))
            .collect();
        self.cursor = (self.cursor + self.batch_size) % len;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_offset() {
        assert_eq!(shard_offset(100, 0, 4), 0);
        assert_eq!(shard_offset(100, 3, 4), 75);
        assert_eq!(shard_offset(10, 2, 3), 6);
        assert_eq!(shard_offset(5, 1, 0), 0);
    }

    #[test]
    fn test_batches_start_at_shard_and_wrap() {
        let data: Vec<u32> = (0..10).collect();
        let mut batches = ShardedBatches::new(data, &SequentialSampler, 4, 1, 2);
        assert_eq!(batches.next_batch(), vec![5, 6, 7, 8]);
        assert_eq!(batches.next_batch(), vec![9, 0, 1, 2]);
        assert_eq!(batches.cursor(), 3);
    }

    #[test]
    fn test_empty_dataset_yields_empty_batches() {
        let data: Vec<u32> = Vec::new();
        let mut batches = ShardedBatches::new(data, &SequentialSampler, 4, 0, 1);
        assert!(batches.next_batch().is_empty());
    }
}
