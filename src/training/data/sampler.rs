//! Rank-aware index sampling

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::utils::seed;

/// Partitions dataset indices across replicas
///
/// The index list (shuffled per epoch when enabled) is padded by wrapping
/// around to a multiple of `num_replicas`; replica `r` takes every
/// `num_replicas`-th index starting at `r`. All replicas therefore see the
/// same number of items and no index is shared unless padding repeats it.
#[derive(Debug)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: AtomicUsize,
}

impl DistributedSampler {
    pub fn new(len: usize, num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        let num_replicas = num_replicas.max(1);
        Self {
            len,
            num_replicas,
            rank: rank.min(num_replicas - 1),
            shuffle,
            seed,
            epoch: AtomicUsize::new(0),
        }
    }

    /// Reseed the shuffle for `epoch`
    pub fn set_epoch(&self, epoch: usize) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Items this replica receives per epoch
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.num_replicas)
    }

    /// This replica's indices for the current epoch
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(seed::derive_indexed(self.seed, &[self.epoch() as u64]));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.num_replicas;
        let padded = order.iter().cycle().take(total).copied();
        padded.skip(self.rank).step_by(self.num_replicas).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_without_shuffle() {
        let sampler = DistributedSampler::new(5, 1, 0, false, 0);
        assert_eq!(sampler.indices(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_epoch_changes_order_deterministically() {
        let sampler = DistributedSampler::new(64, 1, 0, true, 9);
        sampler.set_epoch(1);
        let first = sampler.indices();
        assert_eq!(first, sampler.indices());
        sampler.set_epoch(2);
        assert_ne!(first, sampler.indices());
    }

    proptest! {
        #[test]
        fn prop_replicas_partition_the_dataset(
            len in 0usize..200,
            replicas in 1usize..8,
            seed in any::<u64>(),
            epoch in 0usize..10,
        ) {
            let samplers: Vec<_> = (0..replicas)
                .map(|rank| DistributedSampler::new(len, replicas, rank, true, seed))
                .collect();
            for sampler in &samplers {
                sampler.set_epoch(epoch);
            }

            let parts: Vec<Vec<usize>> = samplers.iter().map(|s| s.indices()).collect();
            let expected = if len == 0 { 0 } else { len.div_ceil(replicas) };
            for part in &parts {
                prop_assert_eq!(part.len(), expected);
            }

            let covered: HashSet<usize> = parts.iter().flatten().copied().collect();
            prop_assert_eq!(covered.len(), len);

            let total: usize = parts.iter().map(Vec::len).sum();
            prop_assert!(total - len < replicas.max(1));
        }
    }
}
