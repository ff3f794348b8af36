//! Resultset parsing and multi-suite merging.
//!
//! A resultset document maps suite names to `{ timestamp, coverage }`
//! objects. Two coverage shapes exist in the wild: the current form stores
//! `{ "lines": [...] }` per file, the legacy form stores the bare line
//! array. Both are accepted. Multiple suites merge position-wise (a line
//! executed in any run counts toward total executions) and the newest
//! suite timestamp wins, since later runs supersede earlier ones for
//! staleness purposes.
//!
//! Structural problems are fatal — a malformed document or one with no
//! usable suite is reported upward, never retried. Timestamp problems are
//! not: a missing or unparsable timestamp degrades to 0 with a logged
//! diagnostic, which disables time-based staleness but must never block
//! loading coverage.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::coverage::{CoverageLines, CoverageMap, LineCoverage};
use crate::error::CovError;
use crate::paths;

// ============================================================================
// Loaded Data
// ============================================================================

/// A parsed, merged, key-normalized resultset.
#[derive(Debug, Clone)]
pub struct LoadedResultset {
    /// Coverage keyed by canonical absolute path.
    pub coverage_map: CoverageMap,
    /// Newest suite timestamp, epoch seconds; 0 when unknown.
    pub timestamp: i64,
    /// Names of the suites that contributed, in document order.
    pub suite_names: Vec<String>,
    /// File entries whose shape was unusable; reported, not fatal.
    pub skipped: Vec<SkippedEntry>,
}

/// One coverage entry that could not be interpreted.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SkippedEntry {
    pub file: String,
    pub reason: String,
}

/// One suite's contribution during the merge.
#[derive(Debug)]
struct SuiteEntry {
    name: String,
    coverage: BTreeMap<String, CoverageLines>,
    timestamp: i64,
}

// ============================================================================
// Loading
// ============================================================================

/// Parse and merge one resultset document into a [`LoadedResultset`].
pub fn load(
    resultset_path: &Path,
    root: &Path,
    case_sensitive: bool,
) -> Result<LoadedResultset, CovError> {
    let text =
        fs::read_to_string(resultset_path).map_err(|e| CovError::from_io(e, resultset_path))?;
    let raw: Value = serde_json::from_str(&text).map_err(|e| {
        CovError::CoverageData(format!(
            "failed to parse resultset {}: {e}",
            resultset_path.display()
        ))
    })?;

    let Value::Object(document) = raw else {
        return Err(CovError::CoverageData(format!(
            "resultset {} is not a JSON object",
            resultset_path.display()
        )));
    };

    let mut skipped = Vec::new();
    let mut suites = Vec::new();
    for (name, data) in &document {
        let Value::Object(entry) = data else {
            continue;
        };
        let Some(coverage) = entry.get("coverage").filter(|c| !c.is_null()) else {
            continue;
        };
        let coverage = normalize_suite_coverage(coverage, name, resultset_path, &mut skipped)?;
        let timestamp = normalize_timestamp(entry.get("timestamp"), entry.get("created_at"));
        suites.push(SuiteEntry {
            name: name.clone(),
            coverage,
            timestamp,
        });
    }

    if suites.is_empty() {
        return Err(CovError::CoverageData(format!(
            "no test suite with coverage data found in resultset file: {}",
            resultset_path.display()
        )));
    }

    log_duplicate_suite_names(&suites);

    let timestamp = suites.iter().map(|s| s.timestamp).max().unwrap_or(0);
    let suite_names = suites.iter().map(|s| s.name.clone()).collect();

    let merged = merge_suites(suites);
    let coverage_map = normalize_keys(merged, root, case_sensitive)?;

    Ok(LoadedResultset {
        coverage_map,
        timestamp,
        suite_names,
        skipped,
    })
}

// ============================================================================
// Shape Normalization
// ============================================================================

/// Accept both coverage shapes and reject anything that is not a mapping.
fn normalize_suite_coverage(
    coverage: &Value,
    suite_name: &str,
    resultset_path: &Path,
    skipped: &mut Vec<SkippedEntry>,
) -> Result<BTreeMap<String, CoverageLines>, CovError> {
    let Value::Object(files) = coverage else {
        return Err(CovError::CoverageData(format!(
            "invalid coverage data structure for suite '{suite_name}' in resultset file: {}",
            resultset_path.display()
        )));
    };

    let mut out = BTreeMap::new();
    for (file, entry) in files {
        match lines_from_entry(entry) {
            Some(lines) => {
                out.insert(file.clone(), lines);
            }
            None => {
                warn!("skipping unusable coverage entry for {file}");
                skipped.push(SkippedEntry {
                    file: file.clone(),
                    reason: "coverage entry is neither a line array nor a lines object".into(),
                });
            }
        }
    }
    Ok(out)
}

/// Lines from either shape. An object without a `lines` array (e.g.
/// branch-only coverage) yields an empty entry: present but never measured.
fn lines_from_entry(entry: &Value) -> Option<CoverageLines> {
    match entry {
        Value::Array(items) => Some(parse_lines(items)),
        Value::Object(map) => match map.get("lines") {
            Some(Value::Array(items)) => Some(parse_lines(items)),
            Some(_) => None,
            None => Some(Vec::new()),
        },
        _ => None,
    }
}

fn parse_lines(items: &[Value]) -> CoverageLines {
    items
        .iter()
        .map(|item| match item {
            Value::Null => LineCoverage::NotExecutable,
            Value::Number(n) => match n.as_u64() {
                Some(hits) => LineCoverage::Measured(hits),
                None => LineCoverage::Measured(n.as_f64().map(|f| f.max(0.0) as u64).unwrap_or(0)),
            },
            // SimpleCov's "ignored" markers and other non-numeric values
            // count as not executable rather than poisoning the entry.
            other => {
                debug!("treating non-numeric line value {other} as not executable");
                LineCoverage::NotExecutable
            }
        })
        .collect()
}

// ============================================================================
// Timestamp Normalization
// ============================================================================

/// Normalize a suite timestamp to epoch seconds, degrading to 0 (never
/// raising) on anything unusable. `created_at` is the legacy fallback key.
fn normalize_timestamp(timestamp: Option<&Value>, created_at: Option<&Value>) -> i64 {
    let raw = match timestamp.filter(|v| !v.is_null()) {
        Some(v) => v,
        None => match created_at.filter(|v| !v.is_null()) {
            Some(v) => v,
            None => return log_missing_timestamp(None),
        },
    };

    let parsed = match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => parse_timestamp_string(s),
        _ => None,
    };

    match parsed {
        Some(ts) if ts > 0 => ts,
        Some(_) => log_missing_timestamp(Some(raw)),
        None => {
            warn!("coverage resultset timestamp could not be parsed: {raw}");
            0
        }
    }
}

fn parse_timestamp_string(s: &str) -> Option<i64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    // Bare numeric strings first: "1700000000", "-5", "169.75".
    if trimmed
        .strip_prefix('-')
        .unwrap_or(trimmed)
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.')
    {
        return trimmed.parse::<f64>().ok().map(|f| f as i64);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = chrono::DateTime::parse_from_str(trimmed, format) {
            return Some(dt.timestamp());
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc().timestamp());
        }
    }
    None
}

fn log_missing_timestamp(raw: Option<&Value>) -> i64 {
    match raw {
        Some(value) => warn!(
            "coverage timestamp missing, defaulting to 0; time-based staleness disabled (value: {value})"
        ),
        None => warn!("coverage timestamp missing, defaulting to 0; time-based staleness disabled"),
    }
    0
}

// ============================================================================
// Merging
// ============================================================================

fn log_duplicate_suite_names(suites: &[SuiteEntry]) {
    let mut seen = BTreeMap::new();
    for suite in suites {
        *seen.entry(suite.name.as_str()).or_insert(0u32) += 1;
    }
    let duplicates: Vec<&str> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name)
        .collect();
    if !duplicates.is_empty() {
        warn!("merging duplicate coverage suites for {}", duplicates.join(", "));
    }
}

/// Position-wise sum across suites. The single-suite path pays no merge
/// cost — the common case is one suite per resultset.
fn merge_suites(suites: Vec<SuiteEntry>) -> BTreeMap<String, CoverageLines> {
    let mut iter = suites.into_iter();
    let mut merged = match iter.next() {
        Some(first) => first.coverage,
        None => return BTreeMap::new(),
    };
    for suite in iter {
        for (file, lines) in suite.coverage {
            match merged.remove(&file) {
                Some(existing) => {
                    merged.insert(file, merge_lines(existing, lines));
                }
                None => {
                    merged.insert(file, lines);
                }
            }
        }
    }
    merged
}

/// Merged value is non-null wherever *either* run measured the line; null
/// survives only where both runs agree the line is not executable.
fn merge_lines(a: CoverageLines, b: CoverageLines) -> CoverageLines {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let left = a.get(i).copied().unwrap_or(LineCoverage::NotExecutable);
            let right = b.get(i).copied().unwrap_or(LineCoverage::NotExecutable);
            match (left.hits(), right.hits()) {
                (None, None) => LineCoverage::NotExecutable,
                (l, r) => LineCoverage::Measured(l.unwrap_or(0) + r.unwrap_or(0)),
            }
        })
        .collect()
}

// ============================================================================
// Key Normalization
// ============================================================================

/// Normalize all keys to canonical absolute paths, detecting collisions.
///
/// If multiple original keys collapse to the same canonical path (a relative
/// and an absolute spelling, or case variants on a case-insensitive volume),
/// the data is corrupt: silently letting one entry overwrite another would
/// misreport coverage. Original casing is preserved in stored keys.
fn normalize_keys(
    map: BTreeMap<String, CoverageLines>,
    root: &Path,
    case_sensitive: bool,
) -> Result<CoverageMap, CovError> {
    let mut result = CoverageMap::new();
    let mut originals_by_normalized: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut expanded_by_normalized: BTreeMap<String, String> = BTreeMap::new();

    for (original, lines) in map {
        let expanded = paths::canonicalize(Path::new(&original), root)
            .to_string_lossy()
            .into_owned();
        let normalized = paths::normalize_for_compare(&expanded, case_sensitive);

        originals_by_normalized
            .entry(normalized.clone())
            .or_default()
            .push(original);
        let stored = expanded_by_normalized
            .entry(normalized)
            .or_insert(expanded)
            .clone();
        result.insert(stored, lines);
    }

    let collisions: Vec<String> = originals_by_normalized
        .iter()
        .filter(|(_, originals)| originals.len() > 1)
        .map(|(normalized, originals)| {
            let stored = expanded_by_normalized
                .get(normalized)
                .cloned()
                .unwrap_or_default();
            format!("  {stored}: {originals:?}")
        })
        .collect();

    if !collisions.is_empty() {
        return Err(CovError::CoverageData(format!(
            "duplicate paths detected after normalization; the following keys normalize to the same path:\n{}",
            collisions.join("\n")
        )));
    }

    Ok(result)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::LineCoverage::{Measured, NotExecutable};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write_resultset(dir: &Path, content: &Value) -> std::path::PathBuf {
        let path = dir.join(".resultset.json");
        fs::write(&path, serde_json::to_string(content).unwrap()).unwrap();
        path
    }

    #[test]
    fn loads_a_single_suite_with_current_shape() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({
                "RSpec": {
                    "timestamp": 1700000000,
                    "coverage": { "lib/foo.rb": { "lines": [1, 0, null] } }
                }
            }),
        );
        let loaded = load(&rs, dir.path(), true).unwrap();
        assert_eq!(loaded.timestamp, 1700000000);
        assert_eq!(loaded.suite_names, vec!["RSpec"]);
        let key = format!("{}/lib/foo.rb", dir.path().display());
        assert_eq!(
            loaded.coverage_map[&key],
            vec![Measured(1), Measured(0), NotExecutable]
        );
    }

    #[test]
    fn wraps_legacy_bare_array_shape() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({
                "MiniTest": {
                    "timestamp": 100,
                    "coverage": { "lib/foo.rb": [1, null, 0] }
                }
            }),
        );
        let loaded = load(&rs, dir.path(), true).unwrap();
        let key = format!("{}/lib/foo.rb", dir.path().display());
        assert_eq!(
            loaded.coverage_map[&key],
            vec![Measured(1), NotExecutable, Measured(0)]
        );
    }

    #[test]
    fn merges_two_suites_position_wise() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({
                "A": { "timestamp": 100, "coverage": { "foo.rb": { "lines": [1, 0, null, 0] } } },
                "B": { "timestamp": 200, "coverage": { "foo.rb": { "lines": [0, 3, null, 1] } } }
            }),
        );
        let loaded = load(&rs, dir.path(), true).unwrap();
        assert_eq!(loaded.timestamp, 200, "newest suite timestamp wins");
        let key = format!("{}/foo.rb", dir.path().display());
        assert_eq!(
            loaded.coverage_map[&key],
            vec![Measured(1), Measured(3), NotExecutable, Measured(1)]
        );
    }

    #[test]
    fn merge_keeps_null_only_where_both_suites_are_null() {
        let a = vec![Measured(1), NotExecutable, NotExecutable];
        let b = vec![NotExecutable, NotExecutable, Measured(2)];
        assert_eq!(
            merge_lines(a, b),
            vec![Measured(1), NotExecutable, Measured(2)]
        );
    }

    #[test]
    fn merge_extends_to_the_longest_suite() {
        let a = vec![Measured(1)];
        let b = vec![Measured(1), Measured(2), NotExecutable];
        assert_eq!(
            merge_lines(a, b),
            vec![Measured(2), Measured(2), NotExecutable]
        );
    }

    #[test]
    fn merges_files_unique_to_one_suite() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({
                "A": { "timestamp": 1, "coverage": { "only_a.rb": { "lines": [1] } } },
                "B": { "timestamp": 2, "coverage": { "only_b.rb": { "lines": [0] } } }
            }),
        );
        let loaded = load(&rs, dir.path(), true).unwrap();
        assert_eq!(loaded.coverage_map.len(), 2);
    }

    #[test]
    fn non_suite_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({
                "meta": "not a suite",
                "empty": { "coverage": null },
                "RSpec": { "timestamp": 5, "coverage": { "a.rb": { "lines": [1] } } }
            }),
        );
        let loaded = load(&rs, dir.path(), true).unwrap();
        assert_eq!(loaded.suite_names, vec!["RSpec"]);
    }

    #[test]
    fn zero_qualifying_suites_is_fatal() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(dir.path(), &json!({ "meta": "nope" }));
        let err = load(&rs, dir.path(), true).unwrap_err();
        assert!(matches!(err, CovError::CoverageData(_)));
    }

    #[test]
    fn non_object_document_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".resultset.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        let err = load(&path, dir.path(), true).unwrap_err();
        assert!(matches!(err, CovError::CoverageData(_)));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".resultset.json");
        fs::write(&path, "{ not json").unwrap();
        let err = load(&path, dir.path(), true).unwrap_err();
        assert!(matches!(err, CovError::CoverageData(_)));
    }

    #[test]
    fn missing_resultset_maps_to_not_found() {
        let dir = TempDir::new().unwrap();
        let err = load(&dir.path().join("absent.json"), dir.path(), true).unwrap_err();
        assert!(matches!(err, CovError::FileNotFound { .. }));
    }

    #[test]
    fn non_mapping_coverage_is_fatal() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({ "RSpec": { "timestamp": 1, "coverage": [1, 2, 3] } }),
        );
        let err = load(&rs, dir.path(), true).unwrap_err();
        assert!(matches!(err, CovError::CoverageData(_)));
    }

    #[test]
    fn timestamp_normalization_table() {
        assert_eq!(normalize_timestamp(Some(&json!(1700000000)), None), 1700000000);
        assert_eq!(normalize_timestamp(Some(&json!(169.75)), None), 169);
        assert_eq!(normalize_timestamp(Some(&json!("1700000000")), None), 1700000000);
        assert_eq!(normalize_timestamp(Some(&json!("169.75")), None), 169);
        // Negative values clamp to 0.
        assert_eq!(normalize_timestamp(Some(&json!("-5")), None), 0);
        assert_eq!(normalize_timestamp(Some(&json!(-5)), None), 0);
        // Calendar strings parse.
        assert_eq!(
            normalize_timestamp(Some(&json!("1970-01-01T00:01:00+00:00")), None),
            60
        );
        assert_eq!(
            normalize_timestamp(Some(&json!("1970-01-01 00:01:00")), None),
            60
        );
        // Garbage, empty, and missing all degrade to 0.
        assert_eq!(normalize_timestamp(Some(&json!("not a time")), None), 0);
        assert_eq!(normalize_timestamp(Some(&json!("")), None), 0);
        assert_eq!(normalize_timestamp(None, None), 0);
        assert_eq!(normalize_timestamp(Some(&json!({"nested": true})), None), 0);
    }

    #[test]
    fn created_at_is_the_fallback_timestamp_key() {
        assert_eq!(normalize_timestamp(None, Some(&json!(42))), 42);
        assert_eq!(normalize_timestamp(Some(&json!(7)), Some(&json!(42))), 7);
    }

    #[test]
    fn relative_keys_normalize_to_absolute() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({
                "RSpec": { "timestamp": 1, "coverage": { "lib/./x/../foo.rb": { "lines": [1] } } }
            }),
        );
        let loaded = load(&rs, dir.path(), true).unwrap();
        let key = format!("{}/lib/foo.rb", dir.path().display());
        assert!(loaded.coverage_map.contains_key(&key));
    }

    #[test]
    fn colliding_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let abs = format!("{}/lib/foo.rb", dir.path().display());
        let rs = write_resultset(
            dir.path(),
            &json!({
                "RSpec": {
                    "timestamp": 1,
                    "coverage": {
                        "lib/foo.rb": { "lines": [1] },
                        abs: { "lines": [0] }
                    }
                }
            }),
        );
        let err = load(&rs, dir.path(), true).unwrap_err();
        match err {
            CovError::CoverageData(msg) => assert!(msg.contains("duplicate paths")),
            other => panic!("expected CoverageData, got {other:?}"),
        }
    }

    #[test]
    fn unusable_entries_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let rs = write_resultset(
            dir.path(),
            &json!({
                "RSpec": {
                    "timestamp": 1,
                    "coverage": {
                        "good.rb": { "lines": [1] },
                        "bad.rb": "what",
                        "branches_only.rb": { "branches": {} }
                    }
                }
            }),
        );
        let loaded = load(&rs, dir.path(), true).unwrap();
        assert_eq!(loaded.skipped.len(), 1);
        assert_eq!(loaded.skipped[0].file, "bad.rb");
        // branches-only entries load as empty (present, never measured).
        let key = format!("{}/branches_only.rb", dir.path().display());
        assert!(loaded.coverage_map[&key].is_empty());
    }
}
