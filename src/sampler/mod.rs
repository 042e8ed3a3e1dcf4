use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{RecError, Result};
use crate::models::{LossBatch, TrainingPair};

/// Shuffles training pairs into mini-batches, one epoch at a time.
///
/// Every call to [`BatchSampler::epoch`] reshuffles with a fresh rng forked
/// from the sampler's seeded rng, so epochs differ from each other while two
/// samplers built with the same seed replay identically.
pub struct BatchSampler {
    pairs: Vec<TrainingPair>,
    batch_size: usize,
    negatives_per_positive: usize,
    num_items: usize,
    rng: StdRng,
}

impl std::fmt::Debug for BatchSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSampler").finish_non_exhaustive()
    }
}

impl BatchSampler {
    pub fn new(
        pairs: Vec<TrainingPair>,
        batch_size: usize,
        negatives_per_positive: usize,
        num_items: usize,
        seed: u64,
    ) -> Result<Self> {
        if pairs.is_empty() {
            return Err(RecError::EmptyInput {
                what: "training pairs",
            });
        }
        if batch_size == 0 {
            return Err(RecError::BatchShape {
                context: "batch size",
                left: 0,
                right: 1,
            });
        }
        Ok(Self {
            pairs,
            batch_size,
            negatives_per_positive,
            num_items,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Batches per epoch, counting the short final batch.
    pub fn batches_per_epoch(&self) -> usize {
        (self.pairs.len() + self.batch_size - 1) / self.batch_size
    }

    /// One full pass: a uniform permutation of every pair, chunked into
    /// batches. The final batch may be shorter than `batch_size`.
    ///
    /// Negatives are drawn uniformly from `[0, num_items)` and may
    /// occasionally coincide with the batch's positives; with a catalog much
    /// larger than a batch this false-negative noise is left in rather than
    /// resampled.
    pub fn epoch(&mut self) -> EpochBatches {
        let mut order = self.pairs.clone();
        order.shuffle(&mut self.rng);
        EpochBatches {
            order,
            cursor: 0,
            batch_size: self.batch_size,
            negatives_per_positive: self.negatives_per_positive,
            num_items: self.num_items,
            rng: StdRng::seed_from_u64(self.rng.gen()),
        }
    }
}

/// Lazy iterator over one epoch's batches.
pub struct EpochBatches {
    order: Vec<TrainingPair>,
    cursor: usize,
    batch_size: usize,
    negatives_per_positive: usize,
    num_items: usize,
    rng: StdRng,
}

impl Iterator for EpochBatches {
    type Item = LossBatch;

    fn next(&mut self) -> Option<LossBatch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let chunk = &self.order[self.cursor..end];
        self.cursor = end;

        let users = chunk.iter().map(|p| p.user).collect();
        let positives = chunk.iter().map(|p| p.item).collect();
        let negatives = (0..chunk.len() * self.negatives_per_positive)
            .map(|_| self.rng.gen_range(0..self.num_items))
            .collect();

        Some(LossBatch {
            users,
            positives,
            negatives,
            negatives_per_positive: self.negatives_per_positive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pairs(n: usize) -> Vec<TrainingPair> {
        (0..n)
            .map(|i| TrainingPair {
                user: i % 3,
                item: i,
            })
            .collect()
    }

    #[test]
    fn test_epoch_covers_every_pair_exactly_once() {
        let input = pairs(23);
        let mut sampler = BatchSampler::new(input.clone(), 5, 0, 23, 11).unwrap();

        let mut seen: HashMap<TrainingPair, usize> = HashMap::new();
        for batch in sampler.epoch() {
            batch.check_shape().unwrap();
            for (&u, &i) in batch.users.iter().zip(&batch.positives) {
                *seen.entry(TrainingPair { user: u, item: i }).or_default() += 1;
            }
        }
        assert_eq!(seen.len(), input.len());
        assert!(seen.values().all(|&count| count == 1));
    }

    #[test]
    fn test_final_batch_is_short() {
        let mut sampler = BatchSampler::new(pairs(7), 3, 0, 7, 1).unwrap();
        let sizes: Vec<usize> = sampler.epoch().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(sampler.batches_per_epoch(), 3);
    }

    #[test]
    fn test_epochs_reshuffle_but_runs_reproduce() {
        let input = pairs(16);
        let mut a = BatchSampler::new(input.clone(), 16, 0, 16, 5).unwrap();
        let mut b = BatchSampler::new(input, 16, 0, 16, 5).unwrap();

        let a1: Vec<usize> = a.epoch().flat_map(|batch| batch.positives).collect();
        let a2: Vec<usize> = a.epoch().flat_map(|batch| batch.positives).collect();
        let b1: Vec<usize> = b.epoch().flat_map(|batch| batch.positives).collect();

        assert_ne!(a1, a2, "consecutive epochs should reshuffle");
        assert_eq!(a1, b1, "same seed should replay the same permutation");
    }

    #[test]
    fn test_negatives_are_in_catalog_range() {
        let mut sampler = BatchSampler::new(pairs(10), 4, 3, 10, 2).unwrap();
        for batch in sampler.epoch() {
            assert_eq!(batch.negatives.len(), batch.len() * 3);
            assert!(batch.negatives.iter().all(|&n| n < 10));
        }
    }

    #[test]
    fn test_empty_pairs_rejected() {
        let err = BatchSampler::new(Vec::new(), 4, 0, 10, 2).unwrap_err();
        assert!(matches!(err, RecError::EmptyInput { .. }));
    }
}
