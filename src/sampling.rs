//! Prevalence-controlled sample generation.
//!
//! Each sample draws `round(target * sample_size)` positives and the rest
//! negatives, without replacement inside a sample but independently across
//! samples. The RNG of sample `i` is a ChaCha stream keyed by the run seed and
//! `i`, so a sample's composition depends only on `(seed, i)`.

use crate::data::PredictionSet;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use thiserror::Error;

/// Spacing between consecutive target prevalences
pub const PREVALENCE_STEP: f64 = 0.05;

/// Samples drawn per target prevalence in the historical configuration
pub const DEFAULT_SAMPLES_PER_PREVALENCE: usize = 100;

/// Errors raised while drawing samples
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("Insufficient {pool} pool size: need {required} items, have {available}")]
    InsufficientPool {
        pool: &'static str,
        required: usize,
        available: usize,
    },

    #[error("Target prevalence must lie in [0, 1], got {0}")]
    InvalidPrevalence(f64),

    #[error("Sample size must be positive")]
    ZeroSampleSize,

    #[error("Item {0} appears in both the positive and the negative pool")]
    OverlappingPools(usize),
}

/// Evenly spaced target prevalences.
///
/// With bounds: 0.00, 0.05, ..., 1.00 (21 points). Without: 0.05..=0.95 (19).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn prevalence_range(include_bounds: bool) -> Vec<f64> {
    let steps = (1.0 / PREVALENCE_STEP).round() as usize;
    let (first, last) = if include_bounds { (0, steps) } else { (1, steps - 1) };
    (first..=last).map(|k| k as f64 / steps as f64).collect()
}

/// Disjoint positive and negative item pools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPools {
    positives: Vec<usize>,
    negatives: Vec<usize>,
}

impl ItemPools {
    /// Build pools from explicit id lists.
    ///
    /// # Errors
    ///
    /// Returns `OverlappingPools` if an id is in both lists.
    pub fn new(positives: Vec<usize>, negatives: Vec<usize>) -> Result<Self, SamplingError> {
        let seen: HashSet<usize> = positives.iter().copied().collect();
        if let Some(&dup) = negatives.iter().find(|id| seen.contains(id)) {
            return Err(SamplingError::OverlappingPools(dup));
        }
        Ok(Self { positives, negatives })
    }

    /// Split a prediction set by gold label
    #[must_use]
    pub fn from_predictions(predictions: &PredictionSet) -> Self {
        let (positives, negatives) = predictions.split_pos_neg();
        Self { positives, negatives }
    }

    /// Split item ids by 0/1 label
    #[must_use]
    pub fn from_labels(labels: &[u8]) -> Self {
        let (positives, negatives): (Vec<usize>, Vec<usize>) =
            (0..labels.len()).partition(|&i| labels[i] == 1);
        Self { positives, negatives }
    }

    /// Positive item ids
    #[must_use]
    pub fn positives(&self) -> &[usize] {
        &self.positives
    }

    /// Negative item ids
    #[must_use]
    pub fn negatives(&self) -> &[usize] {
        &self.negatives
    }
}

/// A prevalence-controlled subset of items
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    index: usize,
    target_prevalence: f64,
    ids: Vec<usize>,
    positives: usize,
}

impl Sample {
    /// Position of this sample in the run
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Prevalence the sample was drawn for
    #[must_use]
    pub const fn target_prevalence(&self) -> f64 {
        self.target_prevalence
    }

    /// Chosen item ids (indices into the source set)
    #[must_use]
    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    /// Number of positive items drawn
    #[must_use]
    pub const fn positives(&self) -> usize {
        self.positives
    }

    /// Number of items
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the sample has no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Actual fraction of positives in the sample
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn realized_prevalence(&self) -> f64 {
        if self.ids.is_empty() {
            return 0.0;
        }
        self.positives as f64 / self.ids.len() as f64
    }
}

/// Sampling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    /// Items per sample
    pub sample_size: usize,
    /// Samples per target prevalence
    pub samples_per_prevalence: usize,
    /// Run seed
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_size: 500,
            samples_per_prevalence: DEFAULT_SAMPLES_PER_PREVALENCE,
            seed: 0,
        }
    }
}

/// Deterministic sample generator over a pair of pools
#[derive(Debug, Clone)]
pub struct SamplingEngine {
    pools: ItemPools,
    config: SamplingConfig,
}

impl SamplingEngine {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// Returns `ZeroSampleSize` if the configured sample size is zero.
    pub fn new(pools: ItemPools, config: SamplingConfig) -> Result<Self, SamplingError> {
        if config.sample_size == 0 {
            return Err(SamplingError::ZeroSampleSize);
        }
        Ok(Self { pools, config })
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Number of positives a sample of the given target receives
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn positive_count(&self, target: f64) -> usize {
        (target * self.config.sample_size as f64).round() as usize
    }

    /// Draw sample `index` for a target prevalence.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPrevalence` for targets outside [0, 1] and
    /// `InsufficientPool` when a pool cannot supply its share.
    pub fn draw(&self, index: usize, target: f64) -> Result<Sample, SamplingError> {
        if !(0.0..=1.0).contains(&target) {
            return Err(SamplingError::InvalidPrevalence(target));
        }
        let n_pos = self.positive_count(target);
        let n_neg = self.config.sample_size - n_pos;

        check_pool("positive", &self.pools.positives, n_pos)?;
        check_pool("negative", &self.pools.negatives, n_neg)?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(index as u64);

        let mut ids: Vec<usize> = self
            .pools
            .positives
            .choose_multiple(&mut rng, n_pos)
            .chain(self.pools.negatives.choose_multiple(&mut rng, n_neg))
            .copied()
            .collect();
        ids.shuffle(&mut rng);

        Ok(Sample {
            index,
            target_prevalence: target,
            ids,
            positives: n_pos,
        })
    }

    /// Draw `samples_per_prevalence` samples for every target, in order.
    ///
    /// # Errors
    ///
    /// Propagates the first [`SamplingEngine::draw`] failure.
    pub fn generate(&self, targets: &[f64]) -> Result<Vec<Sample>, SamplingError> {
        let per = self.config.samples_per_prevalence;
        let mut samples = Vec::with_capacity(targets.len() * per);
        for &target in targets {
            for _ in 0..per {
                samples.push(self.draw(samples.len(), target)?);
            }
        }
        Ok(samples)
    }
}

fn check_pool(pool: &'static str, ids: &[usize], required: usize) -> Result<(), SamplingError> {
    if ids.len() < required {
        return Err(SamplingError::InsufficientPool {
            pool,
            required,
            available: ids.len(),
        });
    }
    Ok(())
}

/// True prevalence of every sample, in order
#[must_use]
pub fn true_prevalences(samples: &[Sample]) -> Vec<f64> {
    samples.iter().map(Sample::realized_prevalence).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use super::*;

    fn engine(n_pos: usize, n_neg: usize, sample_size: usize, seed: u64) -> SamplingEngine {
        let pools = ItemPools::new((0..n_pos).collect(), (n_pos..n_pos + n_neg).collect()).unwrap();
        SamplingEngine::new(
            pools,
            SamplingConfig {
                sample_size,
                samples_per_prevalence: 3,
                seed,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_prevalence_range_with_bounds() {
        let range = prevalence_range(true);
        assert_eq!(range.len(), 21);
        assert!(range[0].abs() < f64::EPSILON);
        assert!((range[20] - 1.0).abs() < f64::EPSILON);
        assert!((range[1] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_prevalence_range_without_bounds() {
        let range = prevalence_range(false);
        assert_eq!(range.len(), 19);
        assert!((range[0] - 0.05).abs() < 1e-12);
        assert!((range[18] - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_draw_is_deterministic() {
        let a = engine(300, 300, 100, 7).generate(&prevalence_range(true)).unwrap();
        let b = engine(300, 300, 100, 7).generate(&prevalence_range(true)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = engine(300, 300, 100, 1).draw(0, 0.5).unwrap();
        let b = engine(300, 300, 100, 2).draw(0, 0.5).unwrap();
        assert_ne!(a.ids(), b.ids());
    }

    #[test]
    fn test_sample_depends_only_on_seed_and_index() {
        let e = engine(300, 300, 100, 11);
        let direct = e.draw(5, 0.3).unwrap();
        let again = e.draw(5, 0.3).unwrap();
        assert_eq!(direct, again);
        assert_ne!(e.draw(6, 0.3).unwrap().ids(), direct.ids());
    }

    #[test]
    fn test_realized_positive_count_is_rounded_target() {
        let e = engine(500, 500, 37, 3);
        for target in prevalence_range(true) {
            let sample = e.draw(0, target).unwrap();
            let expected = (target * 37.0).round() as usize;
            assert_eq!(sample.positives(), expected);
            let drawn_pos = sample.ids().iter().filter(|&&id| id < 500).count();
            assert_eq!(drawn_pos, expected);
            assert_eq!(sample.len(), 37);
            assert!((sample.realized_prevalence() - expected as f64 / 37.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_no_replacement_within_sample() {
        let sample = engine(60, 60, 100, 9).draw(0, 0.5).unwrap();
        let unique: HashSet<_> = sample.ids().iter().collect();
        assert_eq!(unique.len(), sample.len());
    }

    #[test]
    fn test_bounds_need_full_pool() {
        let e = engine(50, 200, 100, 1);
        let err = e.draw(0, 1.0).unwrap_err();
        assert_eq!(
            err,
            SamplingError::InsufficientPool {
                pool: "positive",
                required: 100,
                available: 50
            }
        );
        let sample = e.draw(0, 0.0).unwrap();
        assert_eq!(sample.positives(), 0);
        assert!(sample.ids().iter().all(|&id| id >= 50));
    }

    #[test]
    fn test_invalid_prevalence() {
        let e = engine(10, 10, 5, 1);
        assert!(matches!(e.draw(0, 1.5), Err(SamplingError::InvalidPrevalence(_))));
        assert!(matches!(e.draw(0, f64::NAN), Err(SamplingError::InvalidPrevalence(_))));
    }

    #[test]
    fn test_zero_sample_size() {
        let pools = ItemPools::new(vec![0], vec![1]).unwrap();
        let config = SamplingConfig {
            sample_size: 0,
            ..SamplingConfig::default()
        };
        assert_eq!(
            SamplingEngine::new(pools, config).unwrap_err(),
            SamplingError::ZeroSampleSize
        );
    }

    #[test]
    fn test_overlapping_pools() {
        assert_eq!(
            ItemPools::new(vec![0, 1, 2], vec![2, 3]).unwrap_err(),
            SamplingError::OverlappingPools(2)
        );
    }

    #[test]
    fn test_generate_counts_and_indices() {
        let e = engine(300, 300, 50, 4);
        let samples = e.generate(&prevalence_range(false)).unwrap();
        assert_eq!(samples.len(), 19 * 3);
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
        assert_eq!(true_prevalences(&samples).len(), samples.len());
    }

    #[test]
    fn test_items_may_repeat_across_samples() {
        // pools barely larger than the sample force overlap between samples
        let e = engine(12, 12, 20, 5);
        let a = e.draw(0, 0.5).unwrap();
        let b = e.draw(1, 0.5).unwrap();
        let a_ids: HashSet<_> = a.ids().iter().collect();
        assert!(b.ids().iter().any(|id| a_ids.contains(id)));
    }
}
