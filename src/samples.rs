//! Sample bookkeeping and the adaptive allocation engine.
//!
//! Budget and tolerance targets share one optimization core: the classical
//! Lagrangian-optimal allocation `N[l] ∝ sqrt(variance_diff[l] /
//! pairwork[l])`, with the proportionality constant fixed by the active
//! constraint. Already-computed counts act as floors — sample counts never
//! decrease — which makes the optimization iterative: clamped levels leave
//! the pool and the remaining levels are re-optimized.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Target;
use crate::error::CampaignError;
use crate::errors::ErrorSnapshot;
use crate::hierarchy::LevelHierarchy;
use crate::indicators::IndicatorSnapshot;

/// Fraction of the budget that must be consumed before a budget-mode
/// campaign counts as finished.
const BUDGET_CONSUMED_FRACTION: f64 = 0.9;

/// Per-level sample counts across the campaign.
///
/// After a load pass, `loaded + failed == computed + additional` and the
/// invalid samples are a subset of the loaded ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleCounts {
    /// Samples dispatched in past iterations.
    pub computed: Vec<usize>,
    /// Samples requested in the current iteration.
    pub additional: Vec<usize>,
    /// Samples loaded with a valid pair at the level.
    pub loaded: Vec<usize>,
    /// Samples dispatched but never returned or unpaired.
    pub failed: Vec<usize>,
    /// Loaded samples rejected by the validity checks.
    pub invalid: Vec<usize>,
}

impl SampleCounts {
    pub fn new(levels: usize) -> Self {
        SampleCounts {
            computed: vec![0; levels],
            additional: vec![0; levels],
            loaded: vec![0; levels],
            failed: vec![0; levels],
            invalid: vec![0; levels],
        }
    }

    /// Computed plus currently requested samples at `level`.
    pub fn combined(&self, level: usize) -> usize {
        self.computed[level] + self.additional[level]
    }

    /// Folds the current request into the computed tally once dispatched
    /// work has been collected.
    pub fn append(&mut self) {
        for level in 0..self.computed.len() {
            self.computed[level] += self.additional[level];
            self.additional[level] = 0;
        }
    }

    /// Work of all computed samples, in pairwork units.
    pub fn computed_work(&self, hierarchy: &LevelHierarchy) -> f64 {
        hierarchy
            .levels()
            .map(|level| hierarchy.pairwork(level) * self.computed[level] as f64)
            .sum()
    }
}

/// Per-level sample index sets derived from the counts.
#[derive(Debug, Clone, Default)]
pub struct SampleIndices {
    /// Indices to dispatch this iteration.
    pub additional: Vec<Vec<usize>>,
    /// All indices dispatched so far, including this iteration.
    pub combined: Vec<Vec<usize>>,
    /// Indices with a valid loaded pair.
    pub loaded: Vec<Vec<usize>>,
    /// Loaded indices rejected as invalid.
    pub invalid: Vec<Vec<usize>>,
}

impl SampleIndices {
    pub fn new(levels: usize) -> Self {
        SampleIndices {
            additional: vec![Vec::new(); levels],
            combined: vec![Vec::new(); levels],
            loaded: vec![Vec::new(); levels],
            invalid: vec![Vec::new(); levels],
        }
    }

    /// Materializes index ranges for the current counts: additional samples
    /// continue the numbering after the computed ones.
    pub fn make(&mut self, counts: &SampleCounts) {
        for level in 0..counts.computed.len() {
            self.additional[level] =
                (counts.computed[level]..counts.combined(level)).collect();
            self.combined[level] = (0..counts.combined(level)).collect();
        }
    }
}

/// Adaptive sample allocation under a budget or tolerance target.
#[derive(Debug, Clone)]
pub struct SampleAllocator {
    target: Target,
    warmup: usize,
    pub counts: SampleCounts,
    pub indices: SampleIndices,
    /// Continuous-optimum counts assuming a fresh start, for diagnostics.
    pub optimal_counts: Vec<usize>,
    /// Realized work over the theoretical optimum, minus one.
    pub overhead: Option<f64>,
    /// Whether the last update produced a usable allocation.
    pub available: bool,
}

impl SampleAllocator {
    pub fn new(hierarchy: &LevelHierarchy, target: Target, warmup: usize) -> Self {
        SampleAllocator {
            target,
            warmup,
            counts: SampleCounts::new(hierarchy.len()),
            indices: SampleIndices::new(hierarchy.len()),
            optimal_counts: vec![0; hierarchy.len()],
            overhead: None,
            available: false,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Seeds the warmup allocation: counts proportional to
    /// `pairwork[L] / pairwork[level]`, damped by `2^(L - level)` so the
    /// total warmup work stays within twice the finest pairwork per warmup
    /// unit, scaled by the warmup factor.
    pub fn init_warmup(&mut self, hierarchy: &LevelHierarchy) {
        let finest = hierarchy.finest();
        for level in hierarchy.levels() {
            let ratio = hierarchy.pairwork(finest) / hierarchy.pairwork(level);
            let damped = ratio / 2f64.powi((finest - level) as i32);
            self.counts.additional[level] = self.warmup * damped.ceil() as usize;
        }
        self.available = true;
    }

    /// Computes the optimal counts for all levels given per-level floors.
    ///
    /// Each pass solves the unconstrained Lagrangian optimum for the
    /// still-unfixed levels with the remaining pool; any level whose
    /// optimum falls below its floor is clamped there, leaves the pool, and
    /// the optimization restarts. Terminates when a pass clamps nothing,
    /// yielding a monotone-nondecreasing allocation consistent with all
    /// floors.
    pub fn optimal(
        &self,
        hierarchy: &LevelHierarchy,
        floors: &[usize],
        indicators: &IndicatorSnapshot,
    ) -> Result<Vec<usize>, CampaignError> {
        let variances = indicators.variance_diffs().ok_or_else(|| {
            CampaignError::AllocationInfeasible("variance estimates unavailable".into())
        })?;
        let pairworks = hierarchy.pairworks();
        let fractions: Vec<f64> =
            variances.iter().zip(pairworks).map(|(v, w)| (v / w).sqrt()).collect();

        let mut updated: Vec<usize> = floors.to_vec();
        let mut unfixed = vec![true; floors.len()];
        let mut pool = match self.target {
            Target::Budget(budget) => budget,
            // Tolerance binds the absolute mean-square error budget.
            Target::Tolerance(tol) => {
                let e = tol * indicators.normalization;
                e * e
            }
        };

        'optimize: loop {
            let weight: f64 = match self.target {
                Target::Budget(_) => fractions
                    .iter()
                    .zip(pairworks)
                    .zip(&unfixed)
                    .filter(|(_, &u)| u)
                    .map(|((f, w), _)| f * w)
                    .sum(),
                Target::Tolerance(_) => variances
                    .iter()
                    .zip(pairworks)
                    .zip(&unfixed)
                    .filter(|(_, &u)| u)
                    .map(|((v, w), _)| (v * w).sqrt())
                    .sum(),
            };

            for level in 0..floors.len() {
                if !unfixed[level] {
                    continue;
                }

                let n = match self.target {
                    Target::Budget(_) if weight > 0.0 && pool > 0.0 => {
                        (fractions[level] * pool / weight).floor() as usize
                    }
                    Target::Tolerance(_) if pool > 0.0 => {
                        (fractions[level] * weight / pool).ceil() as usize
                    }
                    // An exhausted pool grants nothing beyond the floors.
                    _ => floors[level],
                };

                if n < floors[level] {
                    updated[level] = floors[level];
                    unfixed[level] = false;
                    match self.target {
                        Target::Budget(_) => {
                            pool -= floors[level] as f64 * pairworks[level];
                        }
                        Target::Tolerance(_) => {
                            pool -= variances[level] / floors[level].max(1) as f64;
                        }
                    }
                    continue 'optimize;
                }
                updated[level] = n;
            }
            break;
        }

        Ok(updated)
    }

    /// Recomputes the additional sample request from fresh indicators.
    ///
    /// Skipped entirely when the indicators are unreliable: allocating on
    /// non-finite or extrapolation-orphaned variances would steer the
    /// campaign with noise.
    pub fn update(
        &mut self,
        hierarchy: &LevelHierarchy,
        indicators: &IndicatorSnapshot,
    ) -> Result<(), CampaignError> {
        if indicators.nans || !indicators.available {
            self.available = false;
            return Err(CampaignError::AllocationInfeasible(
                "indicator estimates are unreliable; more base-level samples or a manual override are required"
                    .into(),
            ));
        }

        // Continuous-optimum baseline for the overhead diagnostic.
        self.optimal_counts = self.optimal(hierarchy, &vec![1; hierarchy.len()], indicators)?;

        let floors = self.counts.computed.clone();
        let updated = self.optimal(hierarchy, &floors, indicators)?;
        for level in hierarchy.levels() {
            self.counts.additional[level] = updated[level].saturating_sub(floors[level]);
        }

        let realized: f64 = hierarchy
            .levels()
            .map(|level| hierarchy.pairwork(level) * updated[level] as f64)
            .sum();
        let ideal: f64 = hierarchy
            .levels()
            .map(|level| hierarchy.pairwork(level) * self.optimal_counts[level] as f64)
            .sum();
        self.overhead = (ideal > 0.0).then(|| realized / ideal - 1.0);

        self.available = true;
        Ok(())
    }

    /// Whether the campaign target is met with the current counts.
    pub fn finished(&self, hierarchy: &LevelHierarchy, errors: &ErrorSnapshot) -> bool {
        match self.target {
            Target::Budget(budget) => {
                self.counts.computed_work(hierarchy) >= BUDGET_CONSUMED_FRACTION * budget
            }
            Target::Tolerance(tol) => {
                errors.total_relative_error.map(|e| e <= tol).unwrap_or(false)
            }
        }
    }

    pub fn report(&self, hierarchy: &LevelHierarchy) {
        for level in hierarchy.levels() {
            info!(
                level,
                computed = self.counts.computed[level],
                additional = self.counts.additional[level],
                loaded = self.counts.loaded[level],
                failed = self.counts.failed[level],
                invalid = self.counts.invalid[level],
                "samples"
            );
        }
        if let Some(overhead) = self.overhead {
            info!(overhead = format_args!("{:.1}%", 100.0 * overhead), "allocation overhead");
        }
        if let Target::Budget(budget) = self.target {
            let used = self.counts.computed_work(hierarchy);
            let requested: f64 = hierarchy
                .levels()
                .map(|l| hierarchy.pairwork(l) * self.counts.additional[l] as f64)
                .sum();
            info!(
                specified = format_args!("{budget:.1}"),
                consumed = format_args!("{used:.1}"),
                remaining = format_args!("{:.1}", budget - used),
                requested = format_args!("{requested:.1}"),
                "budget [CPU hours]"
            );
        }
        if !self.available {
            warn!("samples not available");
        }
    }
}
