//! Static description of the discretization level hierarchy and its work
//! model. Immutable after construction; every cost-aware computation in the
//! crate reads from here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CampaignError;

/// The two members of a level-difference pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// The run at the level's own resolution.
    Fine,
    /// The run at the next-coarser resolution, sharing the same random input.
    Coarse,
}

impl Kind {
    /// Discretization offset: a COARSE run at level `l` uses the
    /// discretization of level `l - 1`.
    pub fn offset(self) -> usize {
        match self {
            Kind::Fine => 0,
            Kind::Coarse => 1,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Fine => write!(f, "FINE"),
            Kind::Coarse => write!(f, "COARSE"),
        }
    }
}

/// Per-level resolution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discretization {
    /// Resolution parameter (cells per dimension).
    pub resolution: usize,
}

impl Discretization {
    pub fn new(resolution: usize) -> Self {
        Discretization { resolution }
    }
}

/// Ordered levels `0..=L` with work weights normalized so that the finest
/// level costs one reference unit.
#[derive(Debug, Clone)]
pub struct LevelHierarchy {
    discretizations: Vec<Discretization>,
    works: Vec<f64>,
    pairworks: Vec<f64>,
}

impl LevelHierarchy {
    /// Builds the hierarchy from per-level discretizations and raw work
    /// estimates (any cost unit; they are normalized to `work[L] = 1`).
    ///
    /// Work must be strictly increasing with level.
    pub fn new(
        discretizations: Vec<Discretization>,
        raw_works: Vec<f64>,
    ) -> Result<Self, CampaignError> {
        if discretizations.is_empty() {
            return Err(CampaignError::ConfigurationFatal("no levels specified".into()));
        }
        if discretizations.len() != raw_works.len() {
            return Err(CampaignError::ConfigurationFatal(format!(
                "{} discretizations but {} work estimates",
                discretizations.len(),
                raw_works.len()
            )));
        }
        if raw_works.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(CampaignError::ConfigurationFatal("work estimates must be positive".into()));
        }
        if raw_works.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CampaignError::ConfigurationFatal(
                "work must increase strictly with level".into(),
            ));
        }

        let reference = raw_works[raw_works.len() - 1];
        let works: Vec<f64> = raw_works.iter().map(|w| w / reference).collect();

        // The coarse member of a pair reuses the coarser level's
        // discretization, so its cost is amortized into the pair.
        let mut pairworks = Vec::with_capacity(works.len());
        pairworks.push(works[0]);
        for level in 1..works.len() {
            pairworks.push(works[level] + works[level - 1]);
        }

        Ok(LevelHierarchy { discretizations, works, pairworks })
    }

    /// Finest level index `L`.
    pub fn finest(&self) -> usize {
        self.works.len() - 1
    }

    /// Number of levels, `L + 1`.
    pub fn len(&self) -> usize {
        self.works.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates levels coarsest to finest.
    pub fn levels(&self) -> std::ops::RangeInclusive<usize> {
        0..=self.finest()
    }

    /// All (level, kind) combinations: level 0 has only FINE.
    pub fn level_kinds(&self) -> Vec<(usize, Kind)> {
        let mut out = vec![(0, Kind::Fine)];
        for level in 1..=self.finest() {
            out.push((level, Kind::Fine));
            out.push((level, Kind::Coarse));
        }
        out
    }

    /// Normalized work of one sample at `level`.
    pub fn work(&self, level: usize) -> f64 {
        self.works[level]
    }

    /// Combined FINE+COARSE cost of one sample at `level`.
    pub fn pairwork(&self, level: usize) -> f64 {
        self.pairworks[level]
    }

    pub fn pairworks(&self) -> &[f64] {
        &self.pairworks
    }

    /// Cost ratio of the finest level relative to `level`; used to scale
    /// core grants down on coarser levels.
    pub fn core_ratio(&self, level: usize) -> f64 {
        1.0 / self.works[level]
    }

    /// Discretization run by the given pair member at `level`.
    pub fn discretization(&self, level: usize, kind: Kind) -> &Discretization {
        &self.discretizations[level - kind.offset()]
    }
}
