//! Per-level resource scheduling.
//!
//! Maps a (cores, walltime) request and the hierarchy's core ratios into one
//! `Parallelization` grant per (level, kind). Load balancing itself is
//! offloaded to the site's job scheduling subsystem; this module only decides
//! the shape of each grant.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CampaignConfig, Machine};
use crate::error::CampaignError;
use crate::hierarchy::{Kind, LevelHierarchy};

/// Resource grant for one (level, kind) batch. Derived from a (cores,
/// walltime) request and a work ratio; never mutated independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parallelization {
    pub cores: usize,
    pub nodes: usize,
    /// MPI ranks.
    pub ranks: usize,
    /// Threads per rank.
    pub threads: usize,
    /// Ranks per node.
    pub tasks: usize,
    /// Walltime in hours.
    pub walltime: f64,
    pub hours: u64,
    pub minutes: u64,
    /// One rank per node with threads across its cores.
    pub sharedmem: bool,
    /// Whether samples of this batch are combined into one submission.
    pub batch: bool,
}

impl Parallelization {
    /// Lays out a grant of `cores` cores for `walltime` hours.
    ///
    /// Shared-memory solvers get one rank per node spanning its cores;
    /// otherwise one rank per core. Very short requests absorb the queue
    /// bootup margin.
    pub fn new(cores: usize, walltime: f64, sharedmem: bool, machine: &Machine) -> Self {
        let nodes = cores.div_ceil(machine.cores_per_node).max(1);
        let (ranks, threads, tasks) = if sharedmem {
            (nodes, (cores / nodes).max(1), 1)
        } else {
            (cores, machine.threads_per_core, machine.cores_per_node.min(cores))
        };

        let hours = walltime.floor() as u64;
        let mut minutes = ((walltime - hours as f64) * 60.0).ceil() as u64;
        if hours == 0 && minutes < 2 * machine.bootup_minutes {
            minutes += machine.bootup_minutes;
        }

        Parallelization {
            cores,
            nodes,
            ranks,
            threads,
            tasks,
            walltime,
            hours,
            minutes,
            sharedmem,
            batch: false,
        }
    }
}

/// Static scheduler: one grant per (level, kind), fixed for the campaign.
#[derive(Debug, Clone)]
pub struct Scheduler {
    cores: usize,
    walltime: f64,
    sharedmem: bool,
    grants: Vec<Vec<Parallelization>>,
}

impl Scheduler {
    /// Resolves the request and distributes grants across all levels.
    pub fn new(
        config: &CampaignConfig,
        hierarchy: &LevelHierarchy,
        sharedmem: bool,
    ) -> Result<Self, CampaignError> {
        let cores = config.total_cores();
        let walltime = config.requested_walltime();
        if walltime <= 0.0 || !walltime.is_finite() {
            return Err(CampaignError::ConfigurationFatal(format!("invalid walltime: {walltime}")));
        }

        let mut scheduler = Scheduler { cores, walltime, sharedmem, grants: Vec::new() };
        scheduler.distribute(config, hierarchy);
        scheduler.validate(&config.machine)?;
        Ok(scheduler)
    }

    /// Assigns a grant to every (level, kind).
    ///
    /// Coarser levels receive `cores / ratio` cores, rounded; when rounding
    /// grants more cores than the ratio-exact requirement, walltime shrinks
    /// proportionally so the expected wall-clock budget stays constant
    /// across levels. Walltime is never increased.
    fn distribute(&mut self, config: &CampaignConfig, hierarchy: &LevelHierarchy) {
        let threads = config.machine.threads_per_core;
        self.grants = (0..hierarchy.len()).map(|_| Vec::new()).collect();

        for level in hierarchy.levels() {
            let kinds: &[Kind] =
                if level == 0 { &[Kind::Fine] } else { &[Kind::Fine, Kind::Coarse] };
            for kind in kinds {
                let resolution_level = level - kind.offset();
                let required = self.cores as f64 / hierarchy.core_ratio(resolution_level);
                let cores = (required.round() as usize).max(threads).min(self.cores.max(threads));

                let walltime = if cores as f64 > required {
                    self.walltime * required / cores as f64
                } else {
                    self.walltime
                };

                let grant = Parallelization::new(cores, walltime, self.sharedmem, &config.machine);
                debug!(level, kind = %kind, cores, walltime, "scheduled grant");
                self.grants[level].push(grant);
            }
        }
    }

    /// Grant for one (level, kind) batch.
    pub fn grant(&self, level: usize, kind: Kind) -> &Parallelization {
        &self.grants[level][kind.offset()]
    }

    /// Snapshot of all grants, fine then coarse per level, for persistence.
    pub fn grants(&self) -> &[Vec<Parallelization>] {
        &self.grants
    }

    /// Checks every grant against the machine walltime ceiling.
    ///
    /// A violation is a fatal configuration error, reported before any job
    /// is dispatched.
    pub fn validate(&self, machine: &Machine) -> Result<(), CampaignError> {
        for level_grants in &self.grants {
            for grant in level_grants {
                let maximum = machine.max_walltime(grant.cores);
                if grant.walltime > maximum {
                    return Err(CampaignError::WalltimeExceeded {
                        requested: grant.walltime,
                        maximum,
                        cores: grant.cores,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn report(&self) {
        info!(cores = self.cores, walltime = self.walltime, sharedmem = self.sharedmem, "scheduler: static");
        for (level, level_grants) in self.grants.iter().enumerate() {
            for (offset, grant) in level_grants.iter().enumerate() {
                let kind = if offset == 0 { Kind::Fine } else { Kind::Coarse };
                info!(
                    level,
                    kind = %kind,
                    cores = grant.cores,
                    ranks = grant.ranks,
                    threads = grant.threads,
                    walltime = format_args!("{:2}h {:02}m", grant.hours, grant.minutes),
                    "grant"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, Target};
    use crate::hierarchy::Discretization;
    use std::path::PathBuf;
    use std::time::Duration;

    fn setup(cores: usize, walltime: f64) -> (CampaignConfig, LevelHierarchy) {
        let mut machine = Machine::workstation("test");
        machine.max_cores = 4096;
        machine.cores_per_node = 16;
        let config = CampaignConfig {
            machine,
            discretizations: vec![
                Discretization::new(16),
                Discretization::new(32),
                Discretization::new(64),
            ],
            target: Target::Budget(100.0),
            warmup: 1,
            cores: Some(cores),
            nodes: None,
            walltime: Some(walltime),
            mode: ExecutionMode::default(),
            poll_interval: Duration::from_millis(1),
            poll_limit: None,
            run_id: 0,
            root: PathBuf::from("."),
        };
        let hierarchy = LevelHierarchy::new(
            config.discretizations.clone(),
            vec![1.0, 8.0, 64.0],
        )
        .unwrap();
        (config, hierarchy)
    }

    #[test]
    fn finest_level_gets_all_cores() {
        let (config, hierarchy) = setup(128, 2.0);
        let scheduler = Scheduler::new(&config, &hierarchy, false).unwrap();
        assert_eq!(scheduler.grant(2, Kind::Fine).cores, 128);
        assert!((scheduler.grant(2, Kind::Fine).walltime - 2.0).abs() < 1e-12);
    }

    #[test]
    fn coarse_kind_uses_coarser_ratio() {
        let (config, hierarchy) = setup(128, 2.0);
        let scheduler = Scheduler::new(&config, &hierarchy, false).unwrap();
        // COARSE at level 2 runs the level-1 discretization: 128 / 8 cores.
        assert_eq!(scheduler.grant(2, Kind::Coarse).cores, 16);
    }

    #[test]
    fn walltime_shrinks_when_rounding_grants_extra_cores() {
        let (config, hierarchy) = setup(100, 2.0);
        let scheduler = Scheduler::new(&config, &hierarchy, false).unwrap();
        // Level 1 requires 100/8 = 12.5 cores, rounded to 13: walltime
        // shrinks by 12.5/13 and never grows.
        let grant = scheduler.grant(1, Kind::Fine);
        assert_eq!(grant.cores, 13);
        assert!((grant.walltime - 2.0 * 12.5 / 13.0).abs() < 1e-9);
        assert!(grant.walltime <= 2.0);
    }

    #[test]
    fn sharedmem_uses_one_rank_per_node() {
        let (config, hierarchy) = setup(128, 2.0);
        let scheduler = Scheduler::new(&config, &hierarchy, true).unwrap();
        let grant = scheduler.grant(2, Kind::Fine);
        assert_eq!(grant.nodes, 8);
        assert_eq!(grant.ranks, 8);
        assert_eq!(grant.threads, 16);
    }

    #[test]
    fn excessive_walltime_is_fatal_before_dispatch() {
        let (config, hierarchy) = setup(128, 48.0);
        match Scheduler::new(&config, &hierarchy, false) {
            Err(CampaignError::WalltimeExceeded { requested, .. }) => {
                assert!((requested - 48.0).abs() < 1e-12);
            }
            other => panic!("expected WalltimeExceeded, got {other:?}"),
        }
    }

    #[test]
    fn bootup_margin_pads_short_requests() {
        let mut machine = Machine::workstation("test");
        machine.bootup_minutes = 5;
        let p = Parallelization::new(8, 0.05, false, &machine);
        assert_eq!(p.hours, 0);
        assert_eq!(p.minutes, 8); // ceil(3) + 5
    }
}
