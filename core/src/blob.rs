//! Element types and the blob container handed over by the training loop.
//!
//! # What is a Blob?
//!
//! The training framework owns the real tensors. The communication layer only
//! needs to know two things about them: how many elements they hold and where
//! those elements live. A [`Blob`] is exactly that, a flat buffer of elements
//! plus the shape it had in the framework (kept for error messages and for
//! handing the data back unchanged).
//!
//! Gradient blobs are appended to the [`DiffAggregator`](crate::aggregator::DiffAggregator)
//! as backpropagation produces them; the parameter blob seeds the registered
//! segment of the [`ModelDistributor`](crate::distributor::ModelDistributor).

use crate::error::{CommError, Result};
use bytemuck::Pod;
use num_traits::{Num, NumAssign};
use rayon::prelude::*;
use std::fmt::Debug;

/// Above this many elements the accumulation is split across the rayon pool.
const PARALLEL_ACCUMULATE_THRESHOLD: usize = 1 << 15;

/// Trait bound for elements that can travel through a channel.
///
/// # Requirements
/// - `Num + NumAssign`: gradients are summed element-wise on arrival.
/// - `Pod`: elements are moved as raw bytes through registered memory, so every
///   bit pattern must be a valid value and there must be no padding.
/// - `Send + Sync`: required for parallel accumulation via `rayon`.
pub trait Element: Num + NumAssign + Pod + Debug + PartialOrd + Send + Sync {}

impl<T> Element for T where T: Num + NumAssign + Pod + Debug + PartialOrd + Send + Sync {}

/// Adds `src` into `dst` element-wise.
///
/// Both slices must have the same length.
pub(crate) fn accumulate<T: Element>(dst: &mut [T], src: &[T]) {
    debug_assert_eq!(dst.len(), src.len());
    if dst.len() >= PARALLEL_ACCUMULATE_THRESHOLD {
        dst.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(d, s)| *d += *s);
    } else {
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s;
        }
    }
}

/// A flat buffer of elements with the shape it carries in the framework.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob<T: Element> {
    data: Vec<T>,
    shape: Vec<usize>,
}

impl<T: Element> Blob<T> {
    /// Creates a blob from flat data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `CommError::ShapeMismatch` if the length of `data` does not match
    /// the product of `shape`.
    pub fn new(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(CommError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    /// Creates a one-dimensional blob.
    pub fn from_vec(data: Vec<T>) -> Self {
        let shape = vec![data.len()];
        Self { data, shape }
    }

    /// Creates a blob filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            data: vec![T::zero(); size],
            shape: shape.to_vec(),
        }
    }

    /// Creates a blob where every element is `value`.
    pub fn filled(shape: &[usize], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            data: vec![value; size],
            shape: shape.to_vec(),
        }
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_new() {
        let blob = Blob::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(blob.count(), 6);
        assert_eq!(blob.shape(), &[2, 3]);
    }

    #[test]
    fn test_blob_new_shape_mismatch() {
        let result = Blob::new(vec![1.0f32, 2.0, 3.0], &[2, 2]);
        assert!(matches!(result, Err(CommError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_blob_zeros_and_filled() {
        let zeros = Blob::<f64>::zeros(&[4]);
        assert!(zeros.data().iter().all(|&v| v == 0.0));
        let filled = Blob::filled(&[2, 2], 3i32);
        assert_eq!(filled.into_data(), vec![3, 3, 3, 3]);
    }

    #[test]
    fn test_accumulate_small() {
        let mut dst = vec![1.0f32, 2.0, 3.0];
        accumulate(&mut dst, &[0.5, 0.5, 0.5]);
        assert_eq!(dst, vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_accumulate_parallel_path() {
        let n = PARALLEL_ACCUMULATE_THRESHOLD + 17;
        let mut dst = vec![1i64; n];
        let src: Vec<i64> = (0..n as i64).collect();
        accumulate(&mut dst, &src);
        assert_eq!(dst[0], 1);
        assert_eq!(dst[n - 1], n as i64);
    }
}
