//! Versioned on-disk campaign records.
//!
//! Every completed iteration's snapshots are appended here before the next
//! batch is dispatched, so a crashed or stopped campaign resumes from the
//! last completed iteration. Records are structured JSON read by a
//! schema-aware parser; iteration keys are never rewritten.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CampaignError;
use crate::errors::ErrorSnapshot;
use crate::hierarchy::Kind;
use crate::indicators::IndicatorSnapshot;
use crate::samples::SampleCounts;
use crate::scheduler::Parallelization;

pub const SCHEMA_VERSION: u32 = 1;

pub const HISTORY_FILE: &str = "history.json";
pub const STATUS_FILE: &str = "status.json";
pub const PROGRESS_FILE: &str = "progress.log";

/// Everything one iteration learned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub indicators: IndicatorSnapshot,
    pub errors: ErrorSnapshot,
    pub counts: SampleCounts,
}

/// Append-only iteration log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub version: u32,
    pub iterations: BTreeMap<usize, IterationRecord>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        History { version: SCHEMA_VERSION, iterations: BTreeMap::new() }
    }

    /// Records one iteration. Re-recording an iteration is refused so a
    /// resumed campaign cannot silently rewrite its past.
    pub fn append(&mut self, iteration: usize, record: IterationRecord) -> Result<(), CampaignError> {
        if self.iterations.contains_key(&iteration) {
            return Err(CampaignError::HistoryRewrite { iteration });
        }
        self.iterations.insert(iteration, record);
        Ok(())
    }

    pub fn last_iteration(&self) -> Option<usize> {
        self.iterations.keys().next_back().copied()
    }

    pub fn latest(&self) -> Option<&IterationRecord> {
        self.iterations.values().next_back()
    }

    pub fn save(&self, root: &Path) -> Result<(), CampaignError> {
        let path = root.join(HISTORY_FILE);
        let file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!(path = %path.display(), iterations = self.iterations.len(), "history saved");
        Ok(())
    }

    pub fn load(root: &Path) -> Result<History, CampaignError> {
        let file = fs::File::open(root.join(HISTORY_FILE))?;
        let history: History = serde_json::from_reader(file)?;
        if history.version != SCHEMA_VERSION {
            return Err(CampaignError::SchemaVersion {
                found: history.version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(history)
    }

    pub fn exists(root: &Path) -> bool {
        root.join(HISTORY_FILE).is_file()
    }
}

/// Where and how far the campaign last ran, for resume checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub version: u32,
    /// Machine the outstanding batches were dispatched on.
    pub machine: String,
    /// Last iteration whose batches were dispatched.
    pub iteration: usize,
    pub grants: Vec<StatusGrant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusGrant {
    pub level: usize,
    pub kind: Kind,
    pub parallelization: Parallelization,
}

impl Status {
    pub fn new(machine: String, iteration: usize, grants: Vec<StatusGrant>) -> Self {
        Status { version: SCHEMA_VERSION, machine, iteration, grants }
    }

    pub fn save(&self, root: &Path) -> Result<(), CampaignError> {
        let file = fs::File::create(root.join(STATUS_FILE))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(root: &Path) -> Result<Status, CampaignError> {
        let file = fs::File::open(root.join(STATUS_FILE))?;
        let status: Status = serde_json::from_reader(file)?;
        if status.version != SCHEMA_VERSION {
            return Err(CampaignError::SchemaVersion {
                found: status.version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(status)
    }

    pub fn exists(root: &Path) -> bool {
        root.join(STATUS_FILE).is_file()
    }
}

/// Human-readable progress log, one line per event.
#[derive(Debug)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(root: &Path) -> Self {
        ProgressLog { path: root.join(PROGRESS_FILE) }
    }

    pub fn record(&self, iteration: usize, message: &str) -> Result<(), CampaignError> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "iteration {iteration}: {message}")?;
        Ok(())
    }
}
