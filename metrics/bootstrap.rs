//! Bootstrap confidence intervals for AUROC.
//!
//! Each resample draws `(label, score)` pairs with replacement and computes AUROC;
//! resamples containing a single class have no AUROC and are skipped. Resamples run in
//! parallel, each with its own RNG seeded from the master seed and the resample index,
//! so a seeded run gives the same interval regardless of thread scheduling.

use super::roc::Roc;
use super::{MetricsError, scored_pairs};
use ndarray::ArrayView1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapConfig {
    pub n_bootstraps: usize,
    /// `None` draws a fresh master seed, so repeated calls reflect sampling variance.
    pub seed: Option<u64>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_bootstraps: 1000,
            seed: None,
        }
    }
}

/// A 95% interval; both bounds are NaN when no resample had both classes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    /// Resamples that contributed an AUROC.
    pub n_valid: usize,
}

pub fn auroc_ci(
    y: ArrayView1<f32>,
    scores: ArrayView1<f32>,
    config: BootstrapConfig,
) -> Result<ConfidenceInterval, MetricsError> {
    let pairs = scored_pairs(y, scores)?;
    let n = pairs.len();
    let master = config.seed.unwrap_or_else(rand::random);

    let mut aurocs: Vec<f64> = (0..config.n_bootstraps)
        .into_par_iter()
        .filter_map(|b| {
            if n == 0 {
                return None;
            }
            let mut rng = StdRng::seed_from_u64(master.wrapping_add(b as u64));
            let sample: Vec<(bool, f64)> = (0..n).map(|_| pairs[rng.gen_range(0..n)]).collect();
            let auroc = Roc::from_pairs(&sample).auroc;
            (!auroc.is_nan()).then_some(auroc)
        })
        .collect();

    if aurocs.is_empty() {
        log::warn!("No bootstrap resample contained both classes; AUROC interval is undefined");
        return Ok(ConfidenceInterval {
            lower: f64::NAN,
            upper: f64::NAN,
            n_valid: 0,
        });
    }

    aurocs.sort_by(f64::total_cmp);
    let at = |q: f64| aurocs[((q * aurocs.len() as f64) as usize).min(aurocs.len() - 1)];
    Ok(ConfidenceInterval {
        lower: at(0.025),
        upper: at(0.975),
        n_valid: aurocs.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn noisy_data(n: usize) -> (Array1<f32>, Array1<f32>) {
        let mut rng = StdRng::seed_from_u64(11);
        let y: Array1<f32> = (0..n).map(|i| (i % 2) as f32).collect();
        let s: Array1<f32> = y
            .iter()
            .map(|&l| l * 0.3 + rng.gen_range(0.0..1.0f32))
            .collect();
        (y, s)
    }

    #[test]
    fn seeded_interval_is_reproducible_and_brackets_the_point_estimate() {
        let (y, s) = noisy_data(200);
        let config = BootstrapConfig {
            n_bootstraps: 300,
            seed: Some(42),
        };
        let first = auroc_ci(y.view(), s.view(), config).unwrap();
        let second = auroc_ci(y.view(), s.view(), config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.n_valid, 300);

        let point = Roc::new(y.view(), s.view()).unwrap().auroc;
        assert!(first.lower < point && point < first.upper);
        assert!(first.lower >= 0.0 && first.upper <= 1.0);
    }

    #[test]
    fn different_seeds_give_different_intervals() {
        let (y, s) = noisy_data(100);
        let a = auroc_ci(y.view(), s.view(), BootstrapConfig { n_bootstraps: 200, seed: Some(1) });
        let b = auroc_ci(y.view(), s.view(), BootstrapConfig { n_bootstraps: 200, seed: Some(2) });
        assert_ne!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn single_class_input_has_no_interval() {
        let y = Array1::from(vec![1.0f32; 10]);
        let s = Array1::from((0..10).map(|i| i as f32 / 10.0).collect::<Vec<_>>());
        let ci = auroc_ci(y.view(), s.view(), BootstrapConfig::default()).unwrap();
        assert_eq!(ci.n_valid, 0);
        assert!(ci.lower.is_nan() && ci.upper.is_nan());
    }

    #[test]
    fn nan_scores_are_an_error_not_a_hang() {
        let y = Array1::from(vec![1.0f32, 0.0, 1.0, 0.0]);
        let s = Array1::from(vec![0.9f32, f32::NAN, 0.2, 0.4]);
        let result = auroc_ci(y.view(), s.view(), BootstrapConfig { n_bootstraps: 10, seed: Some(3) });
        assert!(matches!(result, Err(MetricsError::NonFiniteScore { index: 1, .. })));
    }
}
