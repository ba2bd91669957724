//! Sampling error estimation and MLMC-vs-MC speedup.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::hierarchy::LevelHierarchy;
use crate::indicators::IndicatorSnapshot;
use crate::samples::SampleCounts;

/// One iteration's error estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    /// Relative sampling error contributed by each level.
    pub relative_error: Vec<Option<f64>>,
    /// `sqrt` of the sum of squared per-level relative errors.
    pub total_relative_error: Option<f64>,
    /// Total error in the quantity's own units.
    pub total_error: Option<f64>,
    pub normalization: f64,
    pub available: bool,
}

/// Estimated speedup of the MLMC plan over plain MC at equal accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Speedup {
    pub factor: f64,
    /// Cumulative work of the MLMC plan, in pairwork units.
    pub work_mlmc: f64,
    /// Plain-MC work for the same total error at worst-case variance.
    pub work_mc: f64,
}

impl ErrorSnapshot {
    /// Turns indicators and loaded counts into per-level and total errors.
    ///
    /// `relative_error[l] = sqrt(variance_diff[l] / max(loaded[l], 1))`,
    /// scaled by the normalization. Unavailable indicators produce an
    /// unavailable snapshot rather than zeros.
    pub fn compute(indicators: &IndicatorSnapshot, counts: &SampleCounts) -> ErrorSnapshot {
        let normalization = indicators.normalization;

        if !indicators.available {
            warn!("errors not available: indicators are unavailable");
            return ErrorSnapshot {
                relative_error: vec![None; indicators.levels.len()],
                total_relative_error: None,
                total_error: None,
                normalization,
                available: false,
            };
        }

        let relative_error: Vec<Option<f64>> = indicators
            .levels
            .iter()
            .enumerate()
            .map(|(level, l)| {
                l.variance_diff
                    .map(|v| (v / counts.loaded[level].max(1) as f64).sqrt() / normalization)
            })
            .collect();

        let total_relative_error = relative_error
            .iter()
            .copied()
            .collect::<Option<Vec<f64>>>()
            .map(|errors| errors.iter().map(|e| e * e).sum::<f64>().sqrt())
            .filter(|t| t.is_finite());

        let total_error = total_relative_error.map(|t| t * normalization);
        let available = total_relative_error.is_some();
        if !available {
            warn!("total sampling error is not finite, errors unavailable");
        }

        ErrorSnapshot {
            relative_error,
            total_relative_error,
            total_error,
            normalization,
            available,
        }
    }

    /// Work ratio of plain MC over the MLMC plan for the same accuracy.
    ///
    /// Plain MC is costed at the finest level with the worst-case
    /// single-level variance. A single-level hierarchy reports exactly 1.0
    /// (pure MC; the ratio would otherwise be a round-off artifact).
    /// Returns `None`, reported rather than zero, when errors or variances
    /// are unavailable or the total error vanishes.
    pub fn speedup(
        &self,
        indicators: &IndicatorSnapshot,
        hierarchy: &LevelHierarchy,
        counts: &SampleCounts,
    ) -> Option<Speedup> {
        let total_error = match self.total_error {
            Some(t) if self.available && t > 0.0 => t,
            _ => {
                warn!("speedup cannot be estimated: total sampling error unavailable or zero");
                return None;
            }
        };

        let work_mlmc: f64 = hierarchy
            .levels()
            .map(|level| hierarchy.pairwork(level) * counts.computed[level] as f64)
            .sum();
        if work_mlmc <= 0.0 {
            return None;
        }

        let variance_mc = indicators.max_variance_fine()?;
        let samples_mc = (variance_mc / (total_error * total_error)).ceil();
        let work_mc = hierarchy.pairwork(hierarchy.finest()) * samples_mc;

        let factor = if hierarchy.len() == 1 { 1.0 } else { work_mc / work_mlmc };
        Some(Speedup { factor, work_mlmc, work_mc })
    }

    pub fn report(&self) {
        if !self.available {
            warn!("errors not available");
            return;
        }
        for (level, e) in self.relative_error.iter().enumerate() {
            let text = e.map(|v| format!("{v:.3e}")).unwrap_or_else(|| "n/a".to_string());
            info!(level, relative_error = %text, "sampling error");
        }
        if let (Some(rel), Some(abs)) = (self.total_relative_error, self.total_error) {
            info!(
                total_relative_error = format_args!("{rel:.3e}"),
                total_error = format_args!("{abs:.3e}"),
                "total sampling error"
            );
        }
    }
}
