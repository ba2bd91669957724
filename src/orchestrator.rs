//! Campaign orchestration.
//!
//! An explicit iteration state machine: dispatch the requested batches,
//! wait by polling, load and credit results, estimate indicators and
//! errors, persist the iteration, then either allocate more samples or
//! conclude. Interactive decisions go through the [`Console`] collaborator
//! so the machine itself runs unattended.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::thread;

use tracing::{debug, info, warn};

use crate::assembler::{AssembledStatistic, Assembler, Statistic};
use crate::config::CampaignConfig;
use crate::error::CampaignError;
use crate::errors::{ErrorSnapshot, Speedup};
use crate::hierarchy::LevelHierarchy;
use crate::history::{History, IterationRecord, ProgressLog, Status, StatusGrant};
use crate::indicators::{IndicatorSnapshot, LevelValues};
use crate::mc::MonteCarloRunner;
use crate::samples::SampleAllocator;
use crate::scheduler::Scheduler;
use crate::solver::{Solver, Strategy};

/// External decision point for the waiting loop.
pub trait Console {
    /// Called once the polling limit is exhausted; returning true extends
    /// the wait by another polling round.
    fn extend_wait(&mut self, rounds: usize, pending: usize) -> bool;
}

/// Non-interactive console: never extends a wait past the polling limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConsole;

impl Console for AutoConsole {
    fn extend_wait(&mut self, _rounds: usize, _pending: usize) -> bool {
        false
    }
}

/// Final result of a campaign run.
#[derive(Debug)]
pub struct CampaignOutcome {
    /// Iterations completed across the campaign's whole life.
    pub iterations: usize,
    /// Assembled multilevel estimates, one per requested statistic.
    pub estimates: Vec<AssembledStatistic>,
    pub errors: ErrorSnapshot,
    pub speedup: Option<Speedup>,
    /// False when the campaign aborted on unreliable indicators.
    pub converged: bool,
}

enum Phase {
    Init,
    Run,
    Wait,
    Load,
    Indicators,
    Errors(IndicatorSnapshot),
    Allocate(IndicatorSnapshot, ErrorSnapshot),
    Converged(IndicatorSnapshot, ErrorSnapshot),
    Aborted(IndicatorSnapshot, ErrorSnapshot),
}

/// Accumulated per-(level, kind) results and validity verdicts.
struct ResultStore<R> {
    fine: Vec<BTreeMap<usize, R>>,
    coarse: Vec<BTreeMap<usize, R>>,
    fine_invalid: Vec<HashSet<usize>>,
    coarse_invalid: Vec<HashSet<usize>>,
}

impl<R> ResultStore<R> {
    fn new(levels: usize) -> Self {
        ResultStore {
            fine: (0..levels).map(|_| BTreeMap::new()).collect(),
            coarse: (0..levels).map(|_| BTreeMap::new()).collect(),
            fine_invalid: vec![HashSet::new(); levels],
            coarse_invalid: vec![HashSet::new(); levels],
        }
    }
}

/// Drives a whole campaign over an injected solver, strategy and console.
pub struct Orchestrator<S: Solver, T, C> {
    config: CampaignConfig,
    hierarchy: LevelHierarchy,
    scheduler: Scheduler,
    solver: S,
    strategy: T,
    console: C,
    statistics: Vec<Box<dyn Statistic>>,
    allocator: SampleAllocator,
    assembler: Assembler,
    history: History,
    progress: ProgressLog,
    store: ResultStore<S::Output>,
    runners: Vec<MonteCarloRunner<S::Output>>,
    dispatch_machine: Option<String>,
    iteration: usize,
}

impl<S, T, C> Orchestrator<S, T, C>
where
    S: Solver,
    T: Strategy<S::Output>,
    C: Console,
{
    pub fn new(
        config: CampaignConfig,
        mut solver: S,
        strategy: T,
        console: C,
        statistics: Vec<Box<dyn Statistic>>,
    ) -> Result<Self, CampaignError> {
        config.validate()?;
        solver.setup(&config)?;
        fs::create_dir_all(&config.root)?;

        let works = config.discretizations.iter().map(|d| solver.work(d)).collect();
        let hierarchy = LevelHierarchy::new(config.discretizations.clone(), works)?;
        let scheduler = Scheduler::new(&config, &hierarchy, solver.sharedmem())?;
        let allocator = SampleAllocator::new(&hierarchy, config.target, config.warmup);
        let assembler = Assembler::new(hierarchy.len());
        let progress = ProgressLog::new(&config.root);
        let store = ResultStore::new(hierarchy.len());

        Ok(Orchestrator {
            config,
            hierarchy,
            scheduler,
            solver,
            strategy,
            console,
            statistics,
            allocator,
            assembler,
            history: History::new(),
            progress,
            store,
            runners: Vec::new(),
            dispatch_machine: None,
            iteration: 0,
        })
    }

    /// Runs the campaign to convergence or abort.
    pub fn run(&mut self) -> Result<CampaignOutcome, CampaignError> {
        let mut phase = Phase::Init;
        loop {
            phase = match phase {
                Phase::Init => {
                    if let Some(done) = self.init()? {
                        Phase::Converged(done.0, done.1)
                    } else {
                        Phase::Run
                    }
                }
                Phase::Run => {
                    if self.total_additional() == 0 {
                        info!("no further samples required");
                        let (indicators, errors) = self.latest_snapshots();
                        Phase::Converged(indicators, errors)
                    } else {
                        self.dispatch()?;
                        Phase::Wait
                    }
                }
                Phase::Wait => {
                    self.wait()?;
                    Phase::Load
                }
                Phase::Load => {
                    self.load()?;
                    Phase::Indicators
                }
                Phase::Indicators => {
                    let mut indicators = IndicatorSnapshot::compute(&self.level_values());
                    indicators.extrapolate();
                    indicators.report();
                    Phase::Errors(indicators)
                }
                Phase::Errors(indicators) => {
                    let errors = ErrorSnapshot::compute(&indicators, &self.allocator.counts);
                    errors.report();
                    if let Some(speedup) =
                        errors.speedup(&indicators, &self.hierarchy, &self.allocator.counts)
                    {
                        info!(
                            factor = format_args!("{:.2}", speedup.factor),
                            "estimated multilevel speedup"
                        );
                    }
                    self.persist(&indicators, &errors)?;
                    if self.allocator.finished(&self.hierarchy, &errors) {
                        Phase::Converged(indicators, errors)
                    } else {
                        Phase::Allocate(indicators, errors)
                    }
                }
                Phase::Allocate(indicators, errors) => {
                    self.iteration += 1;
                    match self.allocator.update(&self.hierarchy, &indicators) {
                        Ok(()) => {
                            self.allocator.indices.make(&self.allocator.counts);
                            self.allocator.report(&self.hierarchy);
                            Phase::Run
                        }
                        Err(CampaignError::AllocationInfeasible(reason)) => {
                            warn!(reason = %reason, "allocation infeasible, campaign aborted");
                            Phase::Aborted(indicators, errors)
                        }
                        Err(err) => return Err(err),
                    }
                }
                Phase::Converged(indicators, errors) => {
                    info!(iteration = self.iteration, "campaign converged");
                    self.progress.record(self.iteration, "converged")?;
                    return Ok(self.conclude(&indicators, errors, true));
                }
                Phase::Aborted(indicators, errors) => {
                    warn!(iteration = self.iteration, "campaign aborted");
                    self.progress.record(self.iteration, "aborted")?;
                    return Ok(self.conclude(&indicators, errors, false));
                }
            };
        }
    }

    /// Establishes the initial request: warmup counts for a fresh campaign,
    /// or the persisted state of an interrupted one. Returns the final
    /// snapshots when the resumed campaign already met its target.
    fn init(&mut self) -> Result<Option<(IndicatorSnapshot, ErrorSnapshot)>, CampaignError> {
        let root = self.config.root.clone();
        if !self.config.mode.restart && History::exists(&root) {
            self.history = History::load(&root)?;
            if Status::exists(&root) {
                self.dispatch_machine = Some(Status::load(&root)?.machine);
            }
            let last = self.history.last_iteration().map(|i| i + 1).unwrap_or(0);
            self.iteration = last;
            info!(iteration = last, "resuming campaign");

            if let Some(record) = self.history.latest() {
                let record = record.clone();
                self.allocator.counts = record.counts.clone();
                if self.allocator.finished(&self.hierarchy, &record.errors) {
                    return Ok(Some((record.indicators, record.errors)));
                }
                self.allocator.update(&self.hierarchy, &record.indicators)?;
            }
        } else {
            self.allocator.init_warmup(&self.hierarchy);
            info!(warmup = self.config.warmup, "campaign initialized");
        }
        self.allocator.indices.make(&self.allocator.counts);
        self.allocator.report(&self.hierarchy);
        Ok(None)
    }

    fn total_additional(&self) -> usize {
        self.allocator.counts.additional.iter().sum()
    }

    /// Submits one batch per (level, kind) with a pending request. All
    /// batches are fully submitted before any polling begins.
    fn dispatch(&mut self) -> Result<(), CampaignError> {
        self.scheduler.report();
        let mut grants = Vec::new();
        for (level, kind) in self.hierarchy.level_kinds() {
            let samples = self.allocator.indices.additional[level].clone();
            if samples.is_empty() {
                continue;
            }
            let mut runner = MonteCarloRunner::new(
                level,
                kind,
                samples,
                self.config.run_id,
                self.config.mode,
            );
            let grant = *self.scheduler.grant(level, kind);
            runner.validate(&self.solver, &self.hierarchy, &grant)?;
            runner.dispatch(&mut self.solver, &self.hierarchy, &grant)?;
            grants.push(StatusGrant { level, kind, parallelization: grant });
            self.runners.push(runner);
        }

        Status::new(self.config.machine.name.clone(), self.iteration, grants)
            .save(&self.config.root)?;
        self.progress.record(
            self.iteration,
            &format!("dispatched {} additional samples", self.total_additional()),
        )?;
        Ok(())
    }

    /// Polls all outstanding batches until none is pending, sleeping
    /// between rounds. Exceeding the polling limit defers to the console;
    /// giving up leaves the pending samples for a later resume.
    fn wait(&mut self) -> Result<(), CampaignError> {
        let mut rounds = 0;
        loop {
            for runner in &mut self.runners {
                runner.poll(&self.solver);
            }
            let pending: usize = self.runners.iter().map(|r| r.pending()).sum();
            if pending == 0 {
                return Ok(());
            }
            rounds += 1;
            if let Some(limit) = self.config.poll_limit {
                if rounds >= limit && !self.console.extend_wait(rounds, pending) {
                    return Err(CampaignError::Pending { count: pending, rounds });
                }
            }
            debug!(pending, rounds, "waiting for dispatched samples");
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Collects finished batches into the result store and recomputes the
    /// sample bookkeeping: a sample at level > 0 is credited only when both
    /// pair members loaded.
    fn load(&mut self) -> Result<(), CampaignError> {
        if let Some(machine) = &self.dispatch_machine {
            if *machine != self.config.machine.name {
                warn!(
                    dispatched_on = %machine,
                    running_on = %self.config.machine.name,
                    "loading samples dispatched on a different machine"
                );
            }
        }

        for mut runner in std::mem::take(&mut self.runners) {
            runner.load(&self.solver)?;
            runner.progress(&self.solver);
            if let Some((min, max)) = runner.timers(&self.solver) {
                info!(
                    level = runner.level,
                    kind = %runner.kind,
                    min = format_args!("{min:.1}s"),
                    max = format_args!("{max:.1}s"),
                    "batch runtimes"
                );
            }
            let invalid = runner.invalid(&self.solver, &self.strategy);
            let (level, kind) = (runner.level, runner.kind);
            match kind.offset() {
                0 => {
                    self.store.fine_invalid[level].extend(invalid);
                    self.store.fine[level].extend(runner.into_results());
                }
                _ => {
                    self.store.coarse_invalid[level].extend(invalid);
                    self.store.coarse[level].extend(runner.into_results());
                }
            }
        }
        self.recover()?;

        // A level without a single valid sample degrades (its estimates go
        // missing and extrapolation or a bias warning takes over); only a
        // campaign where every level is empty is unrecoverable.
        let mut any_valid = false;
        for level in self.hierarchy.levels() {
            let credited: Vec<usize> = self.store.fine[level]
                .keys()
                .filter(|s| level == 0 || self.store.coarse[level].contains_key(s))
                .copied()
                .collect();
            let invalid: Vec<usize> = credited
                .iter()
                .filter(|s| {
                    self.store.fine_invalid[level].contains(s)
                        || self.store.coarse_invalid[level].contains(s)
                })
                .copied()
                .collect();

            let counts = &mut self.allocator.counts;
            counts.loaded[level] = credited.len();
            counts.invalid[level] = invalid.len();
            counts.failed[level] = counts.combined(level).saturating_sub(credited.len());
            self.allocator.indices.loaded[level] = credited;
            self.allocator.indices.invalid[level] = invalid;

            if self.valid_indices(level).is_empty() {
                warn!(level, "no valid samples at this level");
            } else {
                any_valid = true;
            }
        }
        if !any_valid {
            return Err(CampaignError::NoValidSamples);
        }

        self.allocator.counts.append();
        self.allocator.report(&self.hierarchy);
        Ok(())
    }

    /// Sweeps previously dispatched samples back into the store, covering a
    /// resume against a solver with persistent output storage.
    fn recover(&mut self) -> Result<(), CampaignError> {
        for (level, kind) in self.hierarchy.level_kinds() {
            for &sample in &self.allocator.indices.combined[level] {
                let present = match kind.offset() {
                    0 => self.store.fine[level].contains_key(&sample),
                    _ => self.store.coarse[level].contains_key(&sample),
                };
                if present || !self.solver.finished(level, kind, sample) {
                    continue;
                }
                match self.solver.load(level, kind, sample) {
                    Ok(result) => {
                        let invalid = self.solver.invalid(&result)
                            || !self.strategy.indicator(&result).is_finite();
                        let (results, rejects) = match kind.offset() {
                            0 => (&mut self.store.fine[level], &mut self.store.fine_invalid[level]),
                            _ => {
                                (&mut self.store.coarse[level], &mut self.store.coarse_invalid[level])
                            }
                        };
                        results.insert(sample, result);
                        if invalid {
                            rejects.insert(sample);
                        }
                    }
                    Err(err) if self.config.mode.strict => return Err(err.into()),
                    Err(err) => {
                        debug!(level, kind = %kind, sample, error = %err, "sample not recovered");
                    }
                }
            }
        }
        Ok(())
    }

    fn valid_indices(&self, level: usize) -> Vec<usize> {
        self.store.fine[level]
            .keys()
            .filter(|s| level == 0 || self.store.coarse[level].contains_key(s))
            .filter(|s| {
                !self.store.fine_invalid[level].contains(s)
                    && !self.store.coarse_invalid[level].contains(s)
            })
            .copied()
            .collect()
    }

    /// Indicator inputs over the valid pairs of every level.
    fn level_values(&self) -> Vec<LevelValues> {
        self.hierarchy
            .levels()
            .map(|level| {
                let valid = self.valid_indices(level);
                let fine: Vec<f64> = valid
                    .iter()
                    .filter_map(|s| self.store.fine[level].get(s))
                    .map(|r| self.strategy.indicator(r))
                    .collect();
                if level == 0 {
                    return LevelValues { fine, coarse: None, distances: Vec::new() };
                }
                let coarse: Vec<f64> = valid
                    .iter()
                    .filter_map(|s| self.store.coarse[level].get(s))
                    .map(|r| self.strategy.indicator(r))
                    .collect();
                let distances: Vec<f64> = valid
                    .iter()
                    .filter_map(|s| {
                        let f = self.store.fine[level].get(s)?;
                        let c = self.store.coarse[level].get(s)?;
                        Some(self.strategy.distance(f, c))
                    })
                    .collect();
                LevelValues { fine, coarse: Some(coarse), distances }
            })
            .collect()
    }

    /// Appends this iteration's snapshots to the durable record before any
    /// further work is requested.
    fn persist(
        &mut self,
        indicators: &IndicatorSnapshot,
        errors: &ErrorSnapshot,
    ) -> Result<(), CampaignError> {
        let record = IterationRecord {
            indicators: indicators.clone(),
            errors: errors.clone(),
            counts: self.allocator.counts.clone(),
        };
        self.history.append(self.iteration, record)?;
        self.history.save(&self.config.root)?;
        self.progress.record(self.iteration, "iteration recorded")?;
        Ok(())
    }

    fn latest_snapshots(&self) -> (IndicatorSnapshot, ErrorSnapshot) {
        self.history
            .latest()
            .map(|r| (r.indicators.clone(), r.errors.clone()))
            .unwrap_or_default()
    }

    /// Assembles the final multilevel estimates from everything loaded.
    fn conclude(
        &mut self,
        indicators: &IndicatorSnapshot,
        errors: ErrorSnapshot,
        converged: bool,
    ) -> CampaignOutcome {
        let speedup = errors.speedup(indicators, &self.hierarchy, &self.allocator.counts);

        let mut estimates = Vec::new();
        for statistic in &self.statistics {
            let mut fine = Vec::new();
            let mut coarse = Vec::new();
            for level in self.hierarchy.levels() {
                let valid = self.valid_indices(level);
                let fine_values: Vec<f64> = valid
                    .iter()
                    .filter_map(|s| self.store.fine[level].get(s))
                    .map(|r| self.strategy.indicator(r))
                    .collect();
                fine.push(statistic.compute(&fine_values));
                let coarse_values: Vec<f64> = valid
                    .iter()
                    .filter_map(|s| self.store.coarse[level].get(s))
                    .map(|r| self.strategy.indicator(r))
                    .collect();
                coarse.push((level > 0).then(|| statistic.compute(&coarse_values)).flatten());
            }
            match self.assembler.assemble(statistic.as_ref(), &fine, &coarse) {
                Ok(assembled) => estimates.push(assembled),
                Err(err) => {
                    warn!(statistic = statistic.name(), error = %err, "statistic not assembled");
                }
            }
        }

        CampaignOutcome {
            iterations: self.history.iterations.len(),
            estimates,
            errors,
            speedup,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::assembler::MeanStatistic;
    use crate::config::{ExecutionMode, Machine, Target};
    use crate::hierarchy::Discretization;
    use crate::solver::{RandomIntegral, ScalarStrategy};

    fn config(root: &Path, target: Target) -> CampaignConfig {
        CampaignConfig {
            machine: Machine::workstation("test"),
            discretizations: vec![Discretization::new(8), Discretization::new(16)],
            target,
            warmup: 1,
            cores: None,
            nodes: None,
            walltime: None,
            mode: ExecutionMode::default(),
            poll_interval: Duration::from_millis(1),
            poll_limit: Some(16),
            run_id: 0,
            root: root.to_path_buf(),
        }
    }

    fn orchestrator(
        root: &Path,
        target: Target,
    ) -> Orchestrator<RandomIntegral, ScalarStrategy, AutoConsole> {
        Orchestrator::new(
            config(root, target),
            RandomIntegral::new(),
            ScalarStrategy,
            AutoConsole,
            vec![Box::new(MeanStatistic)],
        )
        .unwrap()
    }

    #[test]
    fn warmup_seeds_the_initial_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), Target::Budget(4.0));
        orch.init().unwrap();
        // pairworks [0.25, 1.25]: level 0 gets ceil(5 / 2) = 3, level 1 gets 1.
        assert_eq!(orch.allocator.counts.additional, vec![3, 1]);
    }

    #[test]
    fn budget_campaign_converges_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), Target::Budget(4.0));
        let outcome = orch.run().unwrap();

        assert!(outcome.converged);
        assert!(outcome.iterations >= 1);
        assert_eq!(outcome.estimates.len(), 1);
        // The integrand 1 + u^2 x^2 cos(y) averages to a moderate positive value.
        let mean = outcome.estimates[0].estimate;
        assert!(mean > 0.5 && mean < 3.0, "estimate {mean} out of range");
        assert!(History::exists(dir.path()));
        assert!(Status::exists(dir.path()));
    }

    #[test]
    fn tolerance_campaign_stops_once_accurate_enough() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), Target::Tolerance(0.5));
        let outcome = orch.run().unwrap();
        assert!(outcome.converged);
        assert!(outcome.errors.total_relative_error.unwrap() <= 0.5);
    }

    #[test]
    fn resumed_campaign_does_not_rerun_finished_work() {
        let dir = tempfile::tempdir().unwrap();
        let first = orchestrator(dir.path(), Target::Budget(4.0)).run().unwrap();
        assert!(first.converged);

        let history = History::load(dir.path()).unwrap();
        let recorded = history.iterations.len();

        let mut resumed = orchestrator(dir.path(), Target::Budget(4.0));
        let outcome = resumed.run().unwrap();
        assert!(outcome.converged);
        assert_eq!(History::load(dir.path()).unwrap().iterations.len(), recorded);
    }

    #[test]
    fn restart_ignores_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        orchestrator(dir.path(), Target::Budget(4.0)).run().unwrap();

        let mut cfg = config(dir.path(), Target::Budget(4.0));
        cfg.mode.restart = true;
        let mut orch = Orchestrator::new(
            cfg,
            RandomIntegral::new(),
            ScalarStrategy,
            AutoConsole,
            vec![Box::new(MeanStatistic)],
        )
        .unwrap();
        orch.init().unwrap();
        assert_eq!(orch.allocator.counts.computed, vec![0, 0]);
        assert_eq!(orch.allocator.counts.additional, vec![3, 1]);
    }
}
