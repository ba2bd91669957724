//! Adaptive Multi-Level Monte Carlo campaign engine.
//!
//! Decides, iteration by iteration, how many stochastic samples to run at
//! each discretization level so that an estimate of a quantity of interest
//! meets a target accuracy or a fixed compute budget, while the actual
//! simulations execute asynchronously through an injected [`Solver`] and
//! are observed by polling.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mlmc_campaign::{
//!     AutoConsole, CampaignConfig, Discretization, ExecutionMode, Machine,
//!     MeanStatistic, Orchestrator, RandomIntegral, ScalarStrategy, Target,
//! };
//!
//! # fn main() -> Result<(), mlmc_campaign::CampaignError> {
//! let config = CampaignConfig {
//!     machine: Machine::workstation("local"),
//!     discretizations: vec![
//!         Discretization::new(16),
//!         Discretization::new(32),
//!         Discretization::new(64),
//!     ],
//!     target: Target::Tolerance(0.01),
//!     warmup: 4,
//!     cores: None,
//!     nodes: None,
//!     walltime: None,
//!     mode: ExecutionMode::default(),
//!     poll_interval: Duration::from_millis(100),
//!     poll_limit: Some(1000),
//!     run_id: 0,
//!     root: "campaign".into(),
//! };
//! let mut orchestrator = Orchestrator::new(
//!     config,
//!     RandomIntegral::new(),
//!     ScalarStrategy,
//!     AutoConsole,
//!     vec![Box::new(MeanStatistic)],
//! )?;
//! let outcome = orchestrator.run()?;
//! println!("estimate: {:?}", outcome.estimates);
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod config;
pub mod error;
pub mod errors;
pub mod hierarchy;
pub mod history;
pub mod indicators;
pub mod mc;
pub mod orchestrator;
pub mod samples;
pub mod scheduler;
pub mod solver;
pub mod stats;

pub use assembler::{AssembledStatistic, Assembler, ClippedStatistic, MeanStatistic, Statistic, StdDevStatistic};
pub use config::{CampaignConfig, ExecutionMode, Machine, Target};
pub use error::{CampaignError, SolverError};
pub use errors::{ErrorSnapshot, Speedup};
pub use hierarchy::{Discretization, Kind, LevelHierarchy};
pub use history::{History, IterationRecord, Status};
pub use indicators::{IndicatorSnapshot, LevelIndicators, LevelValues};
pub use mc::{MonteCarloRunner, SampleState};
pub use orchestrator::{AutoConsole, CampaignOutcome, Console, Orchestrator};
pub use samples::{SampleAllocator, SampleCounts, SampleIndices};
pub use scheduler::{Parallelization, Scheduler};
pub use solver::{RandomIntegral, SampleJob, ScalarStrategy, Solver, Strategy};
