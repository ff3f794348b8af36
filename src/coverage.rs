//! Coverage data model and per-file calculations.
//!
//! A coverage entry is the per-line measurement SimpleCov records for one
//! source file: one element per source line, each either a hit count or a
//! marker that the line holds no executable code (blank lines, comments,
//! `end` keywords). The length of the entry is the source line count at
//! measurement time, which is what staleness checking compares against.

use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

// ============================================================================
// Line Coverage
// ============================================================================

/// Measurement for a single source line.
///
/// Serialized as `u64 | null`: SimpleCov writes `null` for lines that hold no
/// executable code, and a hit count (possibly 0) for lines that do. The
/// distinction matters everywhere: a `Measured(0)` line is *uncovered*, a
/// `NotExecutable` line is simply not part of the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCoverage {
    /// Executable line with its execution count (0 = never executed).
    Measured(u64),
    /// Line that holds no executable code; excluded from all percentages.
    NotExecutable,
}

impl LineCoverage {
    /// Hit count for measured lines, `None` for non-executable ones.
    pub fn hits(self) -> Option<u64> {
        match self {
            LineCoverage::Measured(hits) => Some(hits),
            LineCoverage::NotExecutable => None,
        }
    }

    /// Whether this line participates in coverage percentages.
    pub fn is_measured(self) -> bool {
        matches!(self, LineCoverage::Measured(_))
    }
}

impl Serialize for LineCoverage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.hits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LineCoverage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<u64>::deserialize(deserializer)? {
            Some(hits) => LineCoverage::Measured(hits),
            None => LineCoverage::NotExecutable,
        })
    }
}

/// One file's recorded coverage: one element per source line.
pub type CoverageLines = Vec<LineCoverage>;

/// Coverage for a whole project, keyed by canonical absolute file path.
///
/// Built fresh on every resultset load and never mutated afterward; readers
/// holding a reference across a cache reload keep seeing consistent data.
pub type CoverageMap = BTreeMap<String, CoverageLines>;

// ============================================================================
// Calculations
// ============================================================================

/// Covered/total counts plus percentage for one coverage entry.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LineSummary {
    /// Measured lines executed at least once.
    pub covered: u64,
    /// Measured lines in total.
    pub total: u64,
    /// `covered / total * 100`, rounded to 2 decimals; 100.0 when nothing is
    /// measured (an empty or never-measured file is not "uncovered").
    pub percentage: f64,
}

/// One row of detailed per-line output. Non-executable lines produce no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DetailedLine {
    /// 1-indexed source line number.
    pub line: u32,
    /// Recorded execution count.
    pub hits: u64,
    /// `hits > 0`.
    pub covered: bool,
}

/// Round to two decimal places, the precision reported everywhere.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Summarize a coverage entry into covered/total/percentage.
pub fn summary(lines: &[LineCoverage]) -> LineSummary {
    let mut covered = 0u64;
    let mut total = 0u64;
    for hits in lines.iter().filter_map(|l| l.hits()) {
        total += 1;
        if hits > 0 {
            covered += 1;
        }
    }
    let percentage = if total == 0 {
        100.0
    } else {
        round2(covered as f64 / total as f64 * 100.0)
    };
    LineSummary {
        covered,
        total,
        percentage,
    }
}

/// 1-indexed line numbers that are executable but were never executed.
pub fn uncovered(lines: &[LineCoverage]) -> Vec<u32> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(i, l)| match l.hits() {
            Some(0) => Some(i as u32 + 1),
            _ => None,
        })
        .collect()
}

/// Per-line rows for every measured line, in source order.
pub fn detailed(lines: &[LineCoverage]) -> Vec<DetailedLine> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(i, l)| {
            l.hits().map(|hits| DetailedLine {
                line: i as u32 + 1,
                hits,
                covered: hits > 0,
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
