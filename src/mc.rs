//! Per-(level, kind) Monte Carlo batch driver.
//!
//! Owns the sample-level state machine and the two-phase
//! dispatch-then-collect protocol: every sample of the batch is submitted
//! before any is polled or loaded. Polling is purely observational and
//! loading tolerates partial failures unless strict mode is on.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::assembler::Statistic;
use crate::config::ExecutionMode;
use crate::error::CampaignError;
use crate::hierarchy::{Kind, LevelHierarchy};
use crate::scheduler::Parallelization;
use crate::solver::{SampleJob, Solver, Strategy};
use crate::stats;

/// Lifecycle of one sample within its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleState {
    Created,
    Dispatched,
    /// Dispatched and last observed unfinished.
    Pending,
    Finished,
    /// Finished but its output could not be loaded.
    Failed,
}

/// Drives one batch of samples at a single (level, kind).
#[derive(Debug)]
pub struct MonteCarloRunner<R> {
    pub level: usize,
    pub kind: Kind,
    /// Campaign-global sample indices of this batch.
    pub samples: Vec<usize>,
    run_id: u64,
    mode: ExecutionMode,
    states: Vec<SampleState>,
    results: Vec<Option<R>>,
    positions: HashMap<usize, usize>,
}

impl<R> MonteCarloRunner<R> {
    pub fn new(
        level: usize,
        kind: Kind,
        samples: Vec<usize>,
        run_id: u64,
        mode: ExecutionMode,
    ) -> Self {
        let positions = samples.iter().enumerate().map(|(pos, s)| (*s, pos)).collect();
        let states = vec![SampleState::Created; samples.len()];
        let results = samples.iter().map(|_| None).collect();
        MonteCarloRunner { level, kind, samples, run_id, mode, states, results, positions }
    }

    /// Deterministic seed for one sample: the pairing function over
    /// (level, index) paired again with the run id.
    pub fn seed(&self, sample: usize) -> u64 {
        stats::pair(stats::pair(self.level as u64, sample as u64), self.run_id)
    }

    /// Checks the batch's discretization/resource combination before any
    /// dispatch; failures are fatal.
    pub fn validate<S: Solver<Output = R>>(
        &self,
        solver: &S,
        hierarchy: &LevelHierarchy,
        grant: &Parallelization,
    ) -> Result<(), CampaignError> {
        let discretization = hierarchy.discretization(self.level, self.kind);
        solver.validate(discretization, grant).map_err(CampaignError::from)
    }

    /// Submits every sample of the batch. Never blocks on completion.
    pub fn dispatch<S: Solver<Output = R>>(
        &mut self,
        solver: &mut S,
        hierarchy: &LevelHierarchy,
        grant: &Parallelization,
    ) -> Result<(), CampaignError> {
        let discretization = hierarchy.discretization(self.level, self.kind);

        // Refuse to overwrite an existing run unless told otherwise.
        if !self.mode.force && !self.mode.proceed {
            for &sample in &self.samples {
                if solver.finished(self.level, self.kind, sample) {
                    return Err(CampaignError::ConfigurationFatal(format!(
                        "output for sample {sample} at level {} ({}) already exists; \
                         proceed with the existing campaign or force overwriting",
                        self.level, self.kind
                    )));
                }
            }
        }

        info!(
            level = self.level,
            kind = %self.kind,
            samples = self.samples.len(),
            cores = grant.cores,
            walltime = format_args!("{:2}h {:02}m", grant.hours, grant.minutes),
            resolution = %solver.resolution_string(discretization),
            "dispatching batch"
        );

        for pos in 0..self.samples.len() {
            let sample = self.samples[pos];
            let job = SampleJob {
                level: self.level,
                kind: self.kind,
                sample,
                seed: self.seed(sample),
                simulate: self.mode.simulate,
            };
            solver.dispatch(&job, discretization, grant)?;
            self.states[pos] = SampleState::Dispatched;
        }
        Ok(())
    }

    /// Refreshes per-sample states from the solver's completion predicate.
    /// Observational only; no side effects on the solver.
    pub fn poll<S: Solver<Output = R>>(&mut self, solver: &S) {
        for (pos, &sample) in self.samples.iter().enumerate() {
            if matches!(self.states[pos], SampleState::Dispatched | SampleState::Pending) {
                self.states[pos] = if solver.finished(self.level, self.kind, sample) {
                    SampleState::Finished
                } else {
                    SampleState::Pending
                };
            }
        }
    }

    /// Samples not yet finished or failed.
    pub fn pending(&self) -> usize {
        self.states
            .iter()
            .filter(|s| {
                matches!(s, SampleState::Created | SampleState::Dispatched | SampleState::Pending)
            })
            .count()
    }

    pub fn finished(&self) -> usize {
        self.states.iter().filter(|s| matches!(s, SampleState::Finished)).count()
    }

    /// Retrieves results of all finished samples.
    ///
    /// A retrieval failure is recorded and tolerated so the rest of the
    /// batch still loads; in strict mode it propagates immediately for
    /// debugging. Returns the loaded sample indices.
    pub fn load<S: Solver<Output = R>>(
        &mut self,
        solver: &S,
    ) -> Result<Vec<usize>, CampaignError> {
        let mut loaded = Vec::new();
        for (pos, &sample) in self.samples.iter().enumerate() {
            if self.states[pos] != SampleState::Finished {
                continue;
            }
            match solver.load(self.level, self.kind, sample) {
                Ok(result) => {
                    self.results[pos] = Some(result);
                    loaded.push(sample);
                }
                Err(err) if self.mode.strict => return Err(err.into()),
                Err(err) => {
                    warn!(
                        level = self.level,
                        kind = %self.kind,
                        sample,
                        error = %err,
                        "sample not loaded"
                    );
                    self.states[pos] = SampleState::Failed;
                }
            }
        }
        Ok(loaded)
    }

    /// Loaded samples rejected by validity checks: the solver's own
    /// predicate composed with a universal finite-indicator check.
    /// Reported separately from failed (never-returned) samples.
    pub fn invalid<S, T>(&self, solver: &S, strategy: &T) -> Vec<usize>
    where
        S: Solver<Output = R>,
        T: Strategy<R>,
    {
        self.samples
            .iter()
            .enumerate()
            .filter_map(|(pos, &sample)| {
                let result = self.results[pos].as_ref()?;
                let bad = solver.invalid(result) || !strategy.indicator(result).is_finite();
                bad.then_some(sample)
            })
            .collect()
    }

    /// Whether at least one sample loaded.
    pub fn available(&self) -> bool {
        self.results.iter().any(|r| r.is_some())
    }

    pub fn result(&self, sample: usize) -> Option<&R> {
        self.positions.get(&sample).and_then(|&pos| self.results[pos].as_ref())
    }

    /// Indicator values over the given sample indices, in order. Samples
    /// without a loaded result are skipped.
    pub fn values<T: Strategy<R>>(&self, strategy: &T, indices: &[usize]) -> Vec<f64> {
        indices
            .iter()
            .filter_map(|sample| self.result(*sample).map(|r| strategy.indicator(r)))
            .collect()
    }

    /// Computes each requested named statistic over exactly the given
    /// valid-and-loaded index subset. Invalid data never enters silently:
    /// callers pass the post-validity index sets.
    pub fn assemble<T: Strategy<R>>(
        &self,
        statistics: &[&dyn Statistic],
        strategy: &T,
        indices: &[usize],
    ) -> Vec<Option<f64>> {
        let values = self.values(strategy, indices);
        statistics.iter().map(|stat| stat.compute(&values)).collect()
    }

    /// Reports per-sample progress where the solver can estimate it.
    pub fn progress<S: Solver<Output = R>>(&self, solver: &S) {
        for (pos, &sample) in self.samples.iter().enumerate() {
            if let Some(result) = self.results[pos].as_ref() {
                if let Some(fraction) = solver.progress(result) {
                    debug!(
                        level = self.level,
                        kind = %self.kind,
                        sample,
                        progress = format_args!("{:3.0}%", 100.0 * fraction),
                        "sample progress"
                    );
                }
            }
        }
    }

    /// Consumes the runner, yielding the loaded (sample, result) pairs.
    pub fn into_results(self) -> Vec<(usize, R)> {
        self.samples
            .into_iter()
            .zip(self.results)
            .filter_map(|(sample, result)| result.map(|r| (sample, r)))
            .collect()
    }

    /// Extreme measured runtimes across the batch, in seconds.
    pub fn timers<S: Solver<Output = R>>(&self, solver: &S) -> Option<(f64, f64)> {
        let runtimes: Vec<f64> = self
            .samples
            .iter()
            .filter_map(|&sample| solver.timer(self.level, self.kind, sample))
            .collect();
        let min = runtimes.iter().copied().fold(f64::INFINITY, f64::min);
        let max = runtimes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (!runtimes.is_empty()).then_some((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::MeanStatistic;
    use crate::error::SolverError;
    use crate::hierarchy::Discretization;
    use crate::solver::{RandomIntegral, ScalarStrategy};

    fn hierarchy() -> LevelHierarchy {
        LevelHierarchy::new(
            vec![Discretization::new(8), Discretization::new(16)],
            vec![1.0, 4.0],
        )
        .unwrap()
    }

    fn grant() -> Parallelization {
        Parallelization::new(1, 1.0, false, &crate::config::Machine::workstation("test"))
    }

    fn runner(kind: Kind, samples: Vec<usize>) -> MonteCarloRunner<f64> {
        MonteCarloRunner::new(1, kind, samples, 0, ExecutionMode::default())
    }

    #[test]
    fn dispatch_then_collect_is_two_phase() {
        let h = hierarchy();
        let mut solver = RandomIntegral::new();
        let mut mc = runner(Kind::Fine, vec![0, 1, 2]);

        assert_eq!(mc.pending(), 3);
        mc.dispatch(&mut solver, &h, &grant()).unwrap();
        mc.poll(&solver);
        assert_eq!(mc.pending(), 0);
        assert_eq!(mc.finished(), 3);

        let loaded = mc.load(&solver).unwrap();
        assert_eq!(loaded, vec![0, 1, 2]);
        assert!(mc.available());
    }

    #[test]
    fn seeds_differ_across_levels_and_samples() {
        let a = runner(Kind::Fine, vec![0]);
        let b = MonteCarloRunner::<f64>::new(2, Kind::Fine, vec![0], 0, ExecutionMode::default());
        assert_ne!(a.seed(0), b.seed(0));
        assert_ne!(a.seed(0), a.seed(1));
    }

    #[test]
    fn fine_and_coarse_share_the_sample_seed() {
        // The pair members must consume the same stochastic input.
        let fine = runner(Kind::Fine, vec![5]);
        let coarse = runner(Kind::Coarse, vec![5]);
        assert_eq!(fine.seed(5), coarse.seed(5));
    }

    #[test]
    fn redispatch_without_force_is_refused() {
        let h = hierarchy();
        let mut solver = RandomIntegral::new();
        let mut mc = runner(Kind::Fine, vec![0]);
        mc.dispatch(&mut solver, &h, &grant()).unwrap();

        let mut again = runner(Kind::Fine, vec![0]);
        match again.dispatch(&mut solver, &h, &grant()) {
            Err(CampaignError::ConfigurationFatal(_)) => {}
            other => panic!("expected ConfigurationFatal, got {other:?}"),
        }
    }

    #[test]
    fn load_tolerates_missing_outputs() {
        let h = hierarchy();
        let mut solver = RandomIntegral::new();
        let mut one = runner(Kind::Fine, vec![0]);
        one.dispatch(&mut solver, &h, &grant()).unwrap();

        // Sample 1 claims to be finished but the solver has no output.
        let mut mc = runner(Kind::Fine, vec![0, 1]);
        mc.states = vec![SampleState::Finished; 2];
        let loaded = mc.load(&solver).unwrap();
        assert_eq!(loaded, vec![0]);
        assert_eq!(mc.states[1], SampleState::Failed);
        assert_eq!(mc.pending(), 0);
    }

    #[test]
    fn strict_mode_propagates_load_failures() {
        let h = hierarchy();
        let mut solver = RandomIntegral::new();
        let mode = ExecutionMode { strict: true, ..Default::default() };
        let mut mc = MonteCarloRunner::<f64>::new(1, Kind::Fine, vec![0], 0, mode);
        mc.dispatch(&mut solver, &h, &grant()).unwrap();
        // Forge a finished state for a sample the solver never saw.
        let other = RandomIntegral::new();
        mc.poll(&solver);
        mc.states[0] = SampleState::Finished;
        match mc.load(&other) {
            Err(CampaignError::Solver(SolverError::MissingOutput { .. })) => {}
            other => panic!("expected MissingOutput, got {other:?}"),
        }
    }

    #[test]
    fn invalid_composes_solver_and_finite_checks() {
        let solver = RandomIntegral::new();
        let strategy = ScalarStrategy;
        let mut mc = runner(Kind::Fine, vec![0, 1, 2]);
        mc.results = vec![Some(2.5), Some(f64::NAN), Some(99.0)];
        mc.states = vec![SampleState::Finished; 3];
        assert_eq!(mc.invalid(&solver, &strategy), vec![1, 2]);
    }

    #[test]
    fn assemble_uses_only_the_given_indices() {
        let strategy = ScalarStrategy;
        let mut mc = runner(Kind::Fine, vec![0, 1, 2]);
        mc.results = vec![Some(1.0), Some(100.0), Some(3.0)];
        let mean = MeanStatistic;
        let stats: Vec<&dyn Statistic> = vec![&mean];
        let estimates = mc.assemble(&stats, &strategy, &[0, 2]);
        assert!((estimates[0].unwrap() - 2.0).abs() < 1e-12);
    }
}
