//! Telescoping-sum assembly of per-level statistic estimates.

use tracing::{info, warn};

use crate::error::CampaignError;
use crate::stats;

/// A named statistic computed over indicator values, with an optional
/// post-assembly clip into the quantity's valid range.
pub trait Statistic {
    fn name(&self) -> &str;
    fn compute(&self, values: &[f64]) -> Option<f64>;
    fn clip(&self, estimate: f64) -> f64 {
        estimate
    }
}

/// Sample mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanStatistic;

impl Statistic for MeanStatistic {
    fn name(&self) -> &str {
        "mean"
    }

    fn compute(&self, values: &[f64]) -> Option<f64> {
        stats::mean(values)
    }
}

/// Sample standard deviation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDevStatistic;

impl Statistic for StdDevStatistic {
    fn name(&self) -> &str {
        "stddev"
    }

    fn compute(&self, values: &[f64]) -> Option<f64> {
        stats::variance(values).map(f64::sqrt)
    }
}

/// Restricts another statistic's assembled estimate to `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct ClippedStatistic<S> {
    inner: S,
    min: f64,
    max: f64,
}

impl<S: Statistic> ClippedStatistic<S> {
    pub fn new(inner: S, min: f64, max: f64) -> Self {
        ClippedStatistic { inner, min, max }
    }
}

impl<S: Statistic> Statistic for ClippedStatistic<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn compute(&self, values: &[f64]) -> Option<f64> {
        self.inner.compute(values)
    }

    fn clip(&self, estimate: f64) -> f64 {
        estimate.clamp(self.min, self.max)
    }
}

/// Final multilevel estimate of one statistic.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledStatistic {
    pub name: String,
    pub estimate: f64,
    /// Levels skipped for missing components; non-empty means the
    /// estimator is biased but usable.
    pub skipped_levels: Vec<usize>,
}

/// Combines per-level FINE/COARSE estimates into the telescoping sum.
#[derive(Debug, Clone)]
pub struct Assembler {
    /// Per-level weights on the estimates, 1.0 unless a control-variate
    /// extension supplies others.
    coefficients: Vec<f64>,
}

impl Assembler {
    pub fn new(levels: usize) -> Self {
        Assembler { coefficients: vec![1.0; levels] }
    }

    pub fn with_coefficients(coefficients: Vec<f64>) -> Self {
        Assembler { coefficients }
    }

    /// Sums the coarsest-level estimate and the weighted level differences
    /// `coeff[l] * fine[l] - coeff[l-1] * coarse[l]`.
    ///
    /// A level missing either component contributes nothing and is
    /// reported as a bias warning; a missing coarsest level invalidates
    /// the whole estimate.
    pub fn assemble(
        &self,
        statistic: &dyn Statistic,
        fine: &[Option<f64>],
        coarse: &[Option<f64>],
    ) -> Result<AssembledStatistic, CampaignError> {
        let base = match fine.first().copied().flatten() {
            Some(estimate) => estimate,
            None => return Err(CampaignError::CoarsestUnavailable { level: 0 }),
        };

        let mut estimate = self.coefficients[0] * base;
        let mut skipped_levels = Vec::new();
        for level in 1..fine.len() {
            match (fine[level], coarse[level]) {
                (Some(f), Some(c)) => {
                    estimate += self.coefficients[level] * f - self.coefficients[level - 1] * c;
                }
                _ => {
                    warn!(
                        level,
                        statistic = statistic.name(),
                        "level difference unavailable, estimate is biased"
                    );
                    skipped_levels.push(level);
                }
            }
        }

        let estimate = statistic.clip(estimate);
        info!(
            statistic = statistic.name(),
            estimate = format_args!("{estimate:.6e}"),
            skipped = skipped_levels.len(),
            "assembled multilevel estimate"
        );
        Ok(AssembledStatistic { name: statistic.name().to_string(), estimate, skipped_levels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_levels_telescope_to_the_constant() {
        let assembler = Assembler::new(3);
        let fine = vec![Some(7.0), Some(7.0), Some(7.0)];
        let coarse = vec![None, Some(7.0), Some(7.0)];
        let out = assembler.assemble(&MeanStatistic, &fine, &coarse).unwrap();
        assert_eq!(out.estimate, 7.0);
        assert!(out.skipped_levels.is_empty());
    }

    #[test]
    fn differences_accumulate_over_the_base() {
        let assembler = Assembler::new(2);
        let fine = vec![Some(3.0), Some(5.0)];
        let coarse = vec![None, Some(3.5)];
        let out = assembler.assemble(&MeanStatistic, &fine, &coarse).unwrap();
        assert!((out.estimate - (3.0 + 5.0 - 3.5)).abs() < 1e-12);
    }

    #[test]
    fn missing_level_biases_but_does_not_fail() {
        let assembler = Assembler::new(3);
        let fine = vec![Some(3.0), None, Some(5.0)];
        let coarse = vec![None, Some(2.0), Some(4.5)];
        let out = assembler.assemble(&MeanStatistic, &fine, &coarse).unwrap();
        assert_eq!(out.skipped_levels, vec![1]);
        assert!((out.estimate - (3.0 + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn missing_coarsest_fails_the_assembly() {
        let assembler = Assembler::new(2);
        let fine = vec![None, Some(5.0)];
        let coarse = vec![None, Some(4.0)];
        match assembler.assemble(&MeanStatistic, &fine, &coarse) {
            Err(CampaignError::CoarsestUnavailable { level: 0 }) => {}
            other => panic!("expected CoarsestUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn coefficients_weight_each_side_of_the_difference() {
        let assembler = Assembler::with_coefficients(vec![0.5, 2.0]);
        let fine = vec![Some(4.0), Some(3.0)];
        let coarse = vec![None, Some(4.0)];
        let out = assembler.assemble(&MeanStatistic, &fine, &coarse).unwrap();
        // 0.5*4 + 2*3 - 0.5*4 = 6
        assert!((out.estimate - 6.0).abs() < 1e-12);
    }

    #[test]
    fn clipping_bounds_the_final_estimate() {
        let assembler = Assembler::new(1);
        let clipped = ClippedStatistic::new(MeanStatistic, 0.0, 1.0);
        let out = assembler.assemble(&clipped, &[Some(3.0)], &[None]).unwrap();
        assert_eq!(out.estimate, 1.0);
    }

    #[test]
    fn stddev_statistic_reduces_values() {
        let values = [1.0, 3.0];
        assert!((StdDevStatistic.compute(&values).unwrap() - 2.0f64.sqrt()).abs() < 1e-12);
    }
}
