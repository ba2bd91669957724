//! Statistical indicators across level pairs.
//!
//! Consumes indicator values evaluated over the samples that are present
//! and valid on both sides of each pair, and produces the per-level
//! mean/variance/covariance/correlation snapshot that drives error
//! estimation and sample allocation. Missing variances are repaired by
//! extrapolation from the coarser neighbour; only a gap at the base level
//! is unrecoverable.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::stats;

/// Indicator values for one level, restricted to the common valid index
/// set and paired by position.
#[derive(Debug, Clone, Default)]
pub struct LevelValues {
    /// `indicator()` of each FINE result.
    pub fine: Vec<f64>,
    /// `indicator()` of each COARSE result; `None` at the coarsest
    /// effective level, which has no coarser partner.
    pub coarse: Option<Vec<f64>>,
    /// `distance(fine, coarse)` diagnostics, empty where undefined.
    pub distances: Vec<f64>,
}

/// Per-level indicator estimates. COARSE entries at the coarsest level are
/// structurally absent, never sampled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelIndicators {
    pub mean_fine: Option<f64>,
    pub mean_coarse: Option<f64>,
    pub variance_fine: Option<f64>,
    pub variance_coarse: Option<f64>,
    /// Mean of the level difference (the raw FINE value at the base level).
    pub mean_diff: Option<f64>,
    /// Variance of the level difference; the allocator's main input.
    pub variance_diff: Option<f64>,
    pub covariance: Option<f64>,
    pub correlation: Option<f64>,
    /// Mean pairwise distance diagnostic.
    pub mean_distance: Option<f64>,
}

/// One iteration's indicator estimates across all levels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub levels: Vec<LevelIndicators>,
    /// Scale for relative errors: |mean at the base level, FINE|, or 1.0
    /// when that is unavailable.
    pub normalization: f64,
    /// False once extrapolation fails at the base level; gates allocation.
    pub available: bool,
    /// True when any computation saw non-finite input, independent of
    /// whether extrapolation later repaired the estimate.
    pub nans: bool,
}

impl IndicatorSnapshot {
    /// Computes plain, difference and pair indicators for every level.
    pub fn compute(values: &[LevelValues]) -> IndicatorSnapshot {
        let mut nans = false;
        let mut levels = Vec::with_capacity(values.len());

        for v in values {
            nans |= v.fine.iter().any(|x| !x.is_finite());
            nans |= v.distances.iter().any(|x| !x.is_finite());
            if let Some(coarse) = &v.coarse {
                nans |= coarse.iter().any(|x| !x.is_finite());
            }

            let (mean_coarse, variance_coarse, covariance, correlation, mean_diff, variance_diff) =
                match &v.coarse {
                    Some(coarse) => {
                        let diffs: Vec<f64> =
                            v.fine.iter().zip(coarse.iter()).map(|(f, c)| f - c).collect();
                        (
                            stats::mean(coarse).map(f64::abs),
                            stats::variance(coarse),
                            stats::covariance(&v.fine, coarse),
                            stats::correlation(&v.fine, coarse),
                            stats::mean(&diffs).map(f64::abs),
                            stats::variance(&diffs),
                        )
                    }
                    // The base level's "difference" is the raw value itself.
                    None => (
                        None,
                        None,
                        None,
                        None,
                        stats::mean(&v.fine).map(f64::abs),
                        stats::variance(&v.fine),
                    ),
                };

            levels.push(LevelIndicators {
                mean_fine: stats::mean(&v.fine).map(f64::abs),
                mean_coarse,
                variance_fine: stats::variance(&v.fine),
                variance_coarse,
                mean_diff,
                variance_diff,
                covariance,
                correlation,
                mean_distance: stats::mean(&v.distances),
            });
        }

        let normalization = match levels.first().and_then(|l| l.mean_fine) {
            Some(m) if m.is_finite() => m,
            _ => {
                warn!("normalization unavailable at the base level, defaulting to 1.0");
                1.0
            }
        };

        let available = levels.first().map(|l| l.variance_diff.is_some()).unwrap_or(false);
        IndicatorSnapshot { levels, normalization, available, nans }
    }

    /// Extrapolates missing variance estimates from available ones.
    ///
    /// A missing `variance_diff` takes half the coarser neighbour's value
    /// (the empirical MLMC decay heuristic); missing plain variances carry
    /// the neighbour's value forward unchanged. Cascades coarsest to
    /// finest, so one available base estimate repairs the whole column.
    /// Running it on a complete snapshot changes nothing.
    pub fn extrapolate(&mut self) {
        for level in 1..self.levels.len() {
            if self.levels[level].variance_diff.is_none() {
                self.levels[level].variance_diff =
                    self.levels[level - 1].variance_diff.map(|v| v / 2.0);
            }
            if self.levels[level].variance_fine.is_none() {
                self.levels[level].variance_fine = self.levels[level - 1].variance_fine;
            }
            if self.levels[level].variance_coarse.is_none() {
                self.levels[level].variance_coarse = self.levels[level - 1].variance_coarse;
            }
        }

        // No invented data at the base case: a gap there is unrecoverable.
        if self.levels.first().map(|l| l.variance_diff.is_none()).unwrap_or(true) {
            warn!("variance of the base level is unavailable, extrapolation failed");
            self.available = false;
        }
    }

    /// Difference variances for all levels, once available.
    pub fn variance_diffs(&self) -> Option<Vec<f64>> {
        self.levels.iter().map(|l| l.variance_diff).collect()
    }

    /// Largest plain FINE variance across levels, the worst-case
    /// single-level variance used by the speedup estimate.
    pub fn max_variance_fine(&self) -> Option<f64> {
        self.levels
            .iter()
            .filter_map(|l| l.variance_fine)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    pub fn report(&self) {
        info!(normalization = format_args!("{:.3e}", self.normalization), "indicators");
        for (level, l) in self.levels.iter().enumerate() {
            info!(
                level,
                mean_diff = field(l.mean_diff, self.normalization),
                variance_diff = field(l.variance_diff, self.normalization * self.normalization),
                correlation = field(l.correlation, 1.0),
                distance = field(l.mean_distance, self.normalization),
                "level indicators"
            );
        }
        if self.nans {
            warn!("indicator computation encountered non-finite inputs");
        }
    }
}

fn field(value: Option<f64>, scale: f64) -> String {
    match value {
        Some(v) => format!("{:.3e}", v / scale),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_level_values() -> Vec<LevelValues> {
        vec![
            LevelValues { fine: vec![4.0, 5.0, 6.0, 5.0], coarse: None, distances: vec![] },
            LevelValues {
                fine: vec![5.0, 5.5, 6.5],
                coarse: Some(vec![4.5, 5.5, 6.0]),
                distances: vec![0.5, 0.0, 0.5],
            },
            LevelValues {
                fine: vec![5.2, 5.6],
                coarse: Some(vec![5.0, 5.5]),
                distances: vec![0.2, 0.1],
            },
        ]
    }

    #[test]
    fn base_level_difference_is_the_raw_value() {
        let snapshot = IndicatorSnapshot::compute(&three_level_values());
        let base = &snapshot.levels[0];
        assert_eq!(base.mean_diff, base.mean_fine);
        assert_eq!(base.variance_diff, base.variance_fine);
        assert_eq!(base.mean_coarse, None);
        assert_eq!(base.covariance, None);
    }

    #[test]
    fn normalization_is_the_base_level_mean() {
        let snapshot = IndicatorSnapshot::compute(&three_level_values());
        assert!((snapshot.normalization - 5.0).abs() < 1e-12);
    }

    #[test]
    fn normalization_defaults_to_one_when_missing() {
        let values =
            vec![LevelValues { fine: vec![], coarse: None, distances: vec![] }];
        let snapshot = IndicatorSnapshot::compute(&values);
        assert_eq!(snapshot.normalization, 1.0);
        assert!(!snapshot.available);
    }

    #[test]
    fn extrapolation_halves_from_the_coarser_neighbour() {
        let mut snapshot = IndicatorSnapshot::compute(&three_level_values());
        snapshot.levels[2].variance_diff = None;
        let coarser = snapshot.levels[1].variance_diff.unwrap();
        snapshot.extrapolate();
        assert!((snapshot.levels[2].variance_diff.unwrap() - coarser / 2.0).abs() < 1e-12);
        assert!(snapshot.available);
    }

    #[test]
    fn extrapolation_cascades_over_consecutive_gaps() {
        let mut snapshot = IndicatorSnapshot::compute(&three_level_values());
        let base = snapshot.levels[0].variance_diff.unwrap();
        snapshot.levels[1].variance_diff = None;
        snapshot.levels[2].variance_diff = None;
        snapshot.extrapolate();
        assert!((snapshot.levels[1].variance_diff.unwrap() - base / 2.0).abs() < 1e-12);
        assert!((snapshot.levels[2].variance_diff.unwrap() - base / 4.0).abs() < 1e-12);
    }

    #[test]
    fn extrapolation_is_idempotent() {
        let mut snapshot = IndicatorSnapshot::compute(&three_level_values());
        snapshot.levels[1].variance_diff = None;
        snapshot.extrapolate();
        let once = snapshot.clone();
        snapshot.extrapolate();
        assert_eq!(snapshot, once);
    }

    #[test]
    fn missing_base_variance_fails_extrapolation() {
        // variance_diff = [None, 4, 1]: the gap at the base level stays.
        let mut snapshot = IndicatorSnapshot::compute(&three_level_values());
        snapshot.levels[0].variance_diff = None;
        snapshot.extrapolate();
        assert_eq!(snapshot.levels[0].variance_diff, None);
        assert!(!snapshot.available);
        // The finer levels keep their own estimates untouched.
        assert!(snapshot.levels[1].variance_diff.is_some());
    }

    #[test]
    fn nan_inputs_set_the_flag_even_if_repaired() {
        let mut values = three_level_values();
        values[2].fine[0] = f64::NAN;
        let mut snapshot = IndicatorSnapshot::compute(&values);
        assert!(snapshot.nans);
        snapshot.extrapolate();
        assert!(snapshot.nans);
        assert!(snapshot.available);
    }

    #[test]
    fn correlation_of_tracking_pairs_is_high() {
        let snapshot = IndicatorSnapshot::compute(&three_level_values());
        assert!(snapshot.levels[1].correlation.unwrap() > 0.9);
    }
}
