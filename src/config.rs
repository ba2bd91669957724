//! Campaign configuration.
//!
//! All site and run parameters live in one immutable struct injected into
//! every component at construction; nothing in the crate reads mutable
//! global state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CampaignError;
use crate::hierarchy::Discretization;

/// Description of the execution site (cluster or workstation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Site name, recorded in persisted status and compared on resume.
    pub name: String,
    /// Whether jobs go through a batch queue.
    pub cluster: bool,
    /// Cores per node.
    pub cores_per_node: usize,
    /// Hardware threads per core.
    pub threads_per_core: usize,
    /// Smallest grantable core count.
    pub min_cores: usize,
    /// Largest grantable core count.
    pub max_cores: usize,
    /// Default walltime in hours when the request leaves it unset.
    pub default_walltime: f64,
    /// Walltime ceiling in hours for regular jobs.
    pub walltime_limit: f64,
    /// Core count above which the reduced wide-job ceiling applies.
    pub wide_job_cores: Option<usize>,
    /// Walltime ceiling in hours for jobs wider than `wide_job_cores`.
    pub wide_job_walltime: f64,
    /// Queue bootup margin in minutes, added to very short requests.
    pub bootup_minutes: u64,
}

impl Machine {
    /// Maximum allowed walltime in hours for a job of `cores` cores. Sites
    /// commonly cap wide jobs at a shorter ceiling than narrow ones.
    pub fn max_walltime(&self, cores: usize) -> f64 {
        match self.wide_job_cores {
            Some(threshold) if cores > threshold => self.wide_job_walltime,
            _ => self.walltime_limit,
        }
    }

    /// A single-node workstation profile, useful for in-process solvers
    /// and tests.
    pub fn workstation(name: &str) -> Self {
        Machine {
            name: name.to_string(),
            cluster: false,
            cores_per_node: 8,
            threads_per_core: 1,
            min_cores: 1,
            max_cores: 8,
            default_walltime: 1.0,
            walltime_limit: 24.0,
            wide_job_cores: None,
            wide_job_walltime: 24.0,
            bootup_minutes: 0,
        }
    }
}

/// Stopping target of the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// Minimize error subject to a total work budget in CPU hours.
    Budget(f64),
    /// Minimize work subject to a total relative error tolerance.
    Tolerance(f64),
}

/// Execution-mode flags, mirroring the command-line surface this core does
/// not own.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionMode {
    /// Start a fresh campaign, ignoring persisted state.
    pub restart: bool,
    /// Resubmit the currently required samples without changing the setup.
    pub proceed: bool,
    /// Dry run: validate and log dispatches without submitting.
    pub simulate: bool,
    /// Skip the clean-working-state check before dispatch.
    pub force: bool,
    /// Propagate individual load failures instead of tolerating them.
    pub strict: bool,
}

/// Immutable configuration consumed by the whole campaign.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub machine: Machine,
    /// Per-level resolution table, coarsest first.
    pub discretizations: Vec<Discretization>,
    pub target: Target,
    /// Warmup factor scaling the initial per-level sample counts.
    pub warmup: usize,
    /// Requested total cores; defaults to one node.
    pub cores: Option<usize>,
    /// Requested nodes, used only when `cores` is unset.
    pub nodes: Option<usize>,
    /// Requested walltime in hours; defaults to the machine default.
    pub walltime: Option<f64>,
    pub mode: ExecutionMode,
    /// Sleep between completion polls.
    pub poll_interval: Duration,
    /// Give up waiting after this many polling rounds; `None` waits forever.
    pub poll_limit: Option<usize>,
    /// Campaign identifier mixed into every sample seed.
    pub run_id: u64,
    /// Directory for history, status and progress artifacts.
    pub root: PathBuf,
}

impl CampaignConfig {
    /// Checks constraints that must hold before anything is dispatched.
    pub fn validate(&self) -> Result<(), CampaignError> {
        match self.target {
            Target::Budget(b) if !(b.is_finite() && b > 0.0) => {
                return Err(CampaignError::ConfigurationFatal(format!("invalid budget: {b}")));
            }
            Target::Tolerance(t) if !(t.is_finite() && t > 0.0) => {
                return Err(CampaignError::ConfigurationFatal(format!("invalid tolerance: {t}")));
            }
            _ => {}
        }
        if self.warmup == 0 {
            return Err(CampaignError::ConfigurationFatal(
                "warmup must request at least one sample".into(),
            ));
        }
        if let Some(cores) = self.cores {
            if cores < self.machine.min_cores || cores > self.machine.max_cores {
                return Err(CampaignError::ConfigurationFatal(format!(
                    "requested {cores} cores outside machine range [{}, {}]",
                    self.machine.min_cores, self.machine.max_cores
                )));
            }
        }
        Ok(())
    }

    /// Total cores resolved from the request: explicit cores win, then
    /// nodes, then a single node.
    pub fn total_cores(&self) -> usize {
        match (self.cores, self.nodes) {
            (Some(cores), _) => cores,
            (None, Some(nodes)) => nodes * self.machine.cores_per_node,
            (None, None) => self.machine.cores_per_node,
        }
    }

    /// Walltime resolved from the request, in hours.
    pub fn requested_walltime(&self) -> f64 {
        self.walltime.unwrap_or(self.machine.default_walltime)
    }
}
