//! Error taxonomy for the campaign driver.
//!
//! Statistical gaps (missing levels, invalid samples) degrade locally and are
//! surfaced as warnings by the components that encounter them; only resource
//! or configuration violations and a campaign with zero valid samples abort
//! the whole run.

use thiserror::Error;

use crate::hierarchy::Kind;

/// Fatal campaign failures.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// Invalid configuration, detected before any job is dispatched.
    #[error("configuration error: {0}")]
    ConfigurationFatal(String),

    /// Requested walltime exceeds the machine maximum for the granted cores.
    #[error("walltime {requested:.2} h exceeds machine maximum {maximum:.2} h for {cores} cores")]
    WalltimeExceeded {
        /// Requested walltime in hours.
        requested: f64,
        /// Machine maximum in hours.
        maximum: f64,
        /// Granted core count.
        cores: usize,
    },

    /// No level anywhere produced a single valid sample.
    #[error("no valid samples were loaded on any level")]
    NoValidSamples,

    /// Variance estimates are too unreliable to allocate samples.
    #[error("sample allocation infeasible: {0}")]
    AllocationInfeasible(String),

    /// The coarsest level has no usable estimate, so the telescoping sum
    /// cannot be seeded.
    #[error("statistics unavailable at the coarsest level {level}")]
    CoarsestUnavailable {
        /// The coarsest effective level of the campaign.
        level: usize,
    },

    /// Samples were still pending when the polling allowance ran out.
    #[error("{count} sample(s) still pending after {rounds} polling round(s)")]
    Pending {
        /// Number of pending samples across all levels.
        count: usize,
        /// Polling rounds performed before giving up.
        rounds: usize,
    },

    /// A solver call failed in strict mode.
    #[error(transparent)]
    Solver(#[from] SolverError),

    /// A persisted history iteration would be overwritten.
    #[error("iteration {iteration} is already recorded; past history is immutable")]
    HistoryRewrite {
        /// The offending iteration index.
        iteration: usize,
    },

    /// Persisted state carries an unknown schema version.
    #[error("unsupported history schema version {found} (expected {expected})")]
    SchemaVersion {
        /// Version found in the document.
        found: u32,
        /// Version this build reads.
        expected: u32,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by the external solver collaborator.
#[derive(Debug, Error)]
pub enum SolverError {
    /// Output of a finished sample is absent.
    #[error("output for sample {sample} at level {level} ({kind}) is missing")]
    MissingOutput {
        /// Level of the sample.
        level: usize,
        /// FINE or COARSE member of the pair.
        kind: Kind,
        /// Sample index.
        sample: usize,
    },

    /// Output exists but could not be parsed.
    #[error("output for sample {sample} at level {level} ({kind}) is corrupt: {reason}")]
    CorruptOutput {
        /// Level of the sample.
        level: usize,
        /// FINE or COARSE member of the pair.
        kind: Kind,
        /// Sample index.
        sample: usize,
        /// Solver-provided description.
        reason: String,
    },

    /// Submission of a sample to the execution environment failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The discretization/parallelization pair is infeasible.
    #[error("infeasible resources: {0}")]
    Infeasible(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = CampaignError::WalltimeExceeded { requested: 48.0, maximum: 36.0, cores: 512 };
        let text = err.to_string();
        assert!(text.contains("48.00"));
        assert!(text.contains("36.00"));
        assert!(text.contains("512"));
    }

    #[test]
    fn solver_error_converts() {
        let err = SolverError::MissingOutput { level: 2, kind: Kind::Coarse, sample: 7 };
        let campaign: CampaignError = err.into();
        assert!(campaign.to_string().contains("level 2"));
    }
}
