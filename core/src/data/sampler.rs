//! Strategies for ordering dataset indices.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// A trait for determining the order of data access.
pub trait Sampler: Send + Sync {
    /// Returns every index in `0..len` exactly once, in visiting order.
    fn sample(&self, len: usize) -> Vec<usize>;
}

/// Samples elements sequentially, always in the same order.
pub struct SequentialSampler;

impl Sampler for SequentialSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        (0..len).collect()
    }
}

/// Samples elements randomly (without replacement).
///
/// A seeded sampler produces the same permutation on every rank, so the
/// shard offsets still partition the data.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSampler {
    seed: Option<u64>,
}

impl RandomSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

impl Sampler for RandomSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();
        match self.seed {
            Some(seed) => indices.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => indices.shuffle(&mut rand::rng()),
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_sampler_is_permutation() {
        let mut indices = RandomSampler::new().sample(50);
        indices.sort_unstable();
        assert_eq!(indices, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_sampler_agrees_across_ranks() {
        let a = RandomSampler::seeded(7).sample(100);
        let b = RandomSampler::seeded(7).sample(100);
        assert_eq!(a, b);
    }
}
