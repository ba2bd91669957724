//! External collaborator contracts: the `Solver` that executes simulations
//! and the `Strategy` that reduces a solver `Output` to scalars.
//!
//! The crate never inspects solver output directly; everything statistical
//! flows through `Strategy::indicator` and `Strategy::distance`.

use std::collections::HashMap;

use ndarray::Array1;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Distribution, Uniform};
use tracing::debug;

use crate::config::CampaignConfig;
use crate::error::SolverError;
use crate::hierarchy::{Discretization, Kind};
use crate::scheduler::Parallelization;

/// One sample submission, fully identified and seeded.
#[derive(Debug, Clone, Copy)]
pub struct SampleJob {
    pub level: usize,
    pub kind: Kind,
    /// Sample index within the campaign.
    pub sample: usize,
    /// Deterministic seed; re-issuing the job reproduces the same
    /// stochastic input.
    pub seed: u64,
    /// Dry run: validate and log, do not submit.
    pub simulate: bool,
}

/// Named reduction of solver output to the scalars the estimator needs.
///
/// One implementation per simulation family, replacing per-solver ad-hoc
/// closures.
pub trait Strategy<R> {
    /// Scalar summary statistic of interest.
    fn indicator(&self, result: &R) -> f64;
    /// Distance between a FINE and COARSE result of the same sample, used
    /// for level-pair diagnostics.
    fn distance(&self, fine: &R, coarse: &R) -> f64;
}

/// Contract of the external simulation executable and its queue front end.
///
/// `dispatch` is fire-and-forget; completion is observed by polling
/// `finished` and results are collected with `load`.
pub trait Solver {
    /// Opaque per-sample result, owned by the solver.
    type Output;

    fn setup(&mut self, config: &CampaignConfig) -> Result<(), SolverError>;

    /// Rejects infeasible discretization/resource combinations. Failures
    /// here are fatal and precede any dispatch.
    fn validate(
        &self,
        discretization: &Discretization,
        parallelization: &Parallelization,
    ) -> Result<(), SolverError>;

    /// Submits one sample. Must not block on completion.
    fn dispatch(
        &mut self,
        job: &SampleJob,
        discretization: &Discretization,
        parallelization: &Parallelization,
    ) -> Result<(), SolverError>;

    /// Non-blocking completion check.
    fn finished(&self, level: usize, kind: Kind, sample: usize) -> bool;

    /// Retrieves a result; a distinct error kind reports absent or corrupt
    /// output.
    fn load(&self, level: usize, kind: Kind, sample: usize) -> Result<Self::Output, SolverError>;

    /// Solver-specific validity predicate (physical-range checks and the
    /// like); composed with a universal finite-indicator check upstream.
    fn invalid(&self, result: &Self::Output) -> bool;

    /// Fraction of the simulation completed, when the solver can tell.
    fn progress(&self, result: &Self::Output) -> Option<f64>;

    /// Measured runtime of a finished sample in seconds, when available.
    fn timer(&self, level: usize, kind: Kind, sample: usize) -> Option<f64>;

    /// Estimated cost of one sample at the given discretization, in
    /// arbitrary consistent units.
    fn work(&self, discretization: &Discretization) -> f64;

    /// Display string for a discretization.
    fn resolution_string(&self, discretization: &Discretization) -> String;

    /// Whether the solver parallelizes over shared memory (one rank per
    /// node) rather than over MPI ranks.
    fn sharedmem(&self) -> bool {
        false
    }
}

/// In-process demo solver: rectangle-rule integration of the random field
/// `f(x, y) = 1 + u^2 x^2 cos(y)` over `[0, 2]^2`, with a seeded random
/// amplitude `u`. Runs synchronously at dispatch, so `finished` is
/// immediate; useful for tests and as a reference implementation of the
/// contract.
#[derive(Debug, Default)]
pub struct RandomIntegral {
    results: HashMap<(usize, Kind, usize), f64>,
}

impl RandomIntegral {
    pub fn new() -> Self {
        Self::default()
    }

    fn integrate(resolution: usize, seed: u64) -> f64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let u = 1.0 + 0.1 * Uniform::new(0.0, 1.0).sample(&mut rng);
        let grid = Array1::<f64>::linspace(0.0, 2.0, resolution);
        let n = resolution as f64;
        let mut sum = 0.0;
        for &x in grid.iter() {
            for &y in grid.iter() {
                sum += 1.0 + u * u * x * x * y.cos();
            }
        }
        sum / (n * n)
    }
}

impl Solver for RandomIntegral {
    type Output = f64;

    fn setup(&mut self, _config: &CampaignConfig) -> Result<(), SolverError> {
        Ok(())
    }

    fn validate(
        &self,
        discretization: &Discretization,
        parallelization: &Parallelization,
    ) -> Result<(), SolverError> {
        // The grid must decompose into at least one cell per rank.
        let cells = discretization.resolution * discretization.resolution;
        if cells < parallelization.ranks {
            return Err(SolverError::Infeasible(format!(
                "{} cells cannot be split across {} ranks",
                cells, parallelization.ranks
            )));
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        job: &SampleJob,
        discretization: &Discretization,
        _parallelization: &Parallelization,
    ) -> Result<(), SolverError> {
        if job.simulate {
            debug!(level = job.level, kind = %job.kind, sample = job.sample, "simulated dispatch");
            return Ok(());
        }
        let value = Self::integrate(discretization.resolution, job.seed);
        self.results.insert((job.level, job.kind, job.sample), value);
        Ok(())
    }

    fn finished(&self, level: usize, kind: Kind, sample: usize) -> bool {
        self.results.contains_key(&(level, kind, sample))
    }

    fn load(&self, level: usize, kind: Kind, sample: usize) -> Result<f64, SolverError> {
        self.results
            .get(&(level, kind, sample))
            .copied()
            .ok_or(SolverError::MissingOutput { level, kind, sample })
    }

    fn invalid(&self, result: &f64) -> bool {
        // Values outside the field's attainable range indicate a corrupted run.
        !result.is_finite() || *result < -10.0 || *result > 10.0
    }

    fn progress(&self, _result: &f64) -> Option<f64> {
        Some(1.0)
    }

    fn timer(&self, _level: usize, _kind: Kind, _sample: usize) -> Option<f64> {
        None
    }

    fn work(&self, discretization: &Discretization) -> f64 {
        (discretization.resolution * discretization.resolution) as f64
    }

    fn resolution_string(&self, discretization: &Discretization) -> String {
        format!("{0}x{0}", discretization.resolution)
    }
}

/// Strategy for solvers whose output already is the scalar of interest.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarStrategy;

impl Strategy<f64> for ScalarStrategy {
    fn indicator(&self, result: &f64) -> f64 {
        *result
    }

    fn distance(&self, fine: &f64, coarse: &f64) -> f64 {
        (fine - coarse).abs()
    }
}
