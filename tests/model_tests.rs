//! End-to-end tests: resultset on disk -> model queries.
//!
//! Each test builds a throwaway project directory with source files and a
//! matching resultset, then drives the public API the way the CLI and MCP
//! layers do.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use covscope::cache::CoverageDataCache;
use covscope::model::{CoverageModel, ModelOptions, SortOrder};
use covscope::staleness::{StaleStatus, StalenessMode};

/// Timestamp comfortably past any test-run mtime.
const FAR_FUTURE: u64 = 4_102_444_800;

struct Project {
    dir: TempDir,
    cache: CoverageDataCache,
}

impl Project {
    fn new() -> Self {
        Project {
            dir: TempDir::new().unwrap(),
            cache: CoverageDataCache::new(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write_source(&self, rel: &str, line_count: usize) -> PathBuf {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body: String = (0..line_count).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, body).unwrap();
        path
    }

    fn write_resultset(&self, body: &serde_json::Value) {
        fs::write(
            self.root().join(".resultset.json"),
            serde_json::to_string_pretty(body).unwrap(),
        )
        .unwrap();
    }

    fn model(&self) -> CoverageModel {
        self.model_with(|_| {})
    }

    fn model_with(&self, configure: impl FnOnce(&mut ModelOptions)) -> CoverageModel {
        let mut options = ModelOptions {
            root: Some(self.root().to_path_buf()),
            ..Default::default()
        };
        configure(&mut options);
        CoverageModel::new(&self.cache, &options).unwrap()
    }
}

fn two_file_project() -> Project {
    let project = Project::new();
    project.write_source("lib/payments.rb", 4);
    project.write_source("lib/orders.rb", 3);
    project.write_resultset(&json!({
        "RSpec": {
            "timestamp": FAR_FUTURE,
            "coverage": {
                "lib/payments.rb": { "lines": [2, 0, null, 1] },
                "lib/orders.rb": { "lines": [0, null, 0] }
            }
        }
    }));
    project
}

// ============================================================================
// Per-file Queries
// ============================================================================

#[test]
fn summary_uncovered_and_detailed_agree() {
    let project = two_file_project();
    let model = project.model();

    let summary = model.summary_for("lib/payments.rb").unwrap();
    assert_eq!(summary.summary.covered, 2);
    assert_eq!(summary.summary.total, 3);
    assert_eq!(summary.summary.percentage, 66.67);

    let uncovered = model.uncovered_for("lib/payments.rb").unwrap();
    assert_eq!(uncovered.uncovered, vec![2]);

    let detailed = model.detailed_for("lib/payments.rb").unwrap();
    assert_eq!(detailed.lines.len(), 3);
    assert!(detailed.lines[0].covered);
    assert!(!detailed.lines[1].covered);
    assert_eq!(detailed.lines[2].line, 4);
}

#[test]
fn raw_preserves_null_markers() {
    let project = two_file_project();
    let model = project.model();
    let raw = model.raw_for("lib/orders.rb").unwrap();
    let value = serde_json::to_value(&raw.lines).unwrap();
    assert_eq!(value, json!([0, null, 0]));
}

#[test]
fn relativized_payloads_use_root_relative_paths() {
    let project = two_file_project();
    let model = project.model();
    let payload = model.summary_for("lib/payments.rb").unwrap();
    let value = model.relativize(&payload).unwrap();
    assert_eq!(value["file"], "lib/payments.rb");
}

// ============================================================================
// Multi-suite Merge
// ============================================================================

#[test]
fn multi_suite_resultsets_merge_position_wise() {
    let project = Project::new();
    project.write_source("foo.rb", 4);
    project.write_resultset(&json!({
        "A": { "timestamp": 100, "coverage": { "foo.rb": { "lines": [1, 0, null, 0] } } },
        "B": { "timestamp": 200, "coverage": { "foo.rb": { "lines": [0, 3, null, 1] } } }
    }));

    let model = project.model();
    assert_eq!(model.coverage_timestamp(), 200);
    let raw = model.raw_for("foo.rb").unwrap();
    let value = serde_json::to_value(&raw.lines).unwrap();
    assert_eq!(value, json!([1, 3, null, 1]));
}

// ============================================================================
// Cache Behavior
// ============================================================================

#[test]
fn cache_serves_identical_data_across_models() {
    let project = two_file_project();
    let a = project.model();
    let b = project.model();
    // Same underlying Arc<ModelData>: no re-parse happened.
    let raw_a = a.raw_for("lib/orders.rb").unwrap();
    let raw_b = b.raw_for("lib/orders.rb").unwrap();
    assert_eq!(
        serde_json::to_value(&raw_a.lines).unwrap(),
        serde_json::to_value(&raw_b.lines).unwrap()
    );
    let cache = &project.cache;
    let rs = project.root().join(".resultset.json");
    let first = cache.get(&rs, project.root(), true).unwrap();
    let second = cache.get(&rs, project.root(), true).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn rewritten_resultset_is_picked_up() {
    let project = two_file_project();
    {
        let model = project.model();
        assert_eq!(
            model.summary_for("lib/payments.rb").unwrap().summary.covered,
            2
        );
    }
    project.write_resultset(&json!({
        "RSpec": {
            "timestamp": FAR_FUTURE,
            "coverage": { "lib/payments.rb": { "lines": [1, 1, 1, 1] } }
        }
    }));
    let model = project.model();
    assert_eq!(
        model.summary_for("lib/payments.rb").unwrap().summary.covered,
        4
    );
}

// ============================================================================
// Staleness
// ============================================================================

#[test]
fn length_mismatch_wins_over_newer() {
    let project = Project::new();
    // 3 lines on disk, 2 recorded, coverage timestamp far in the past: the
    // file is both newer and mismatched, and must classify as the latter.
    project.write_source("bar.rb", 3);
    project.write_resultset(&json!({
        "RSpec": { "timestamp": 1, "coverage": { "bar.rb": { "lines": [1, 0] } } }
    }));

    let model = project.model();
    let staleness = model.staleness_for("bar.rb");
    assert_eq!(staleness.stale, StaleStatus::LengthMismatch);
}

#[test]
fn strict_mode_blocks_stale_per_file_queries() {
    let project = Project::new();
    project.write_source("bar.rb", 3);
    project.write_resultset(&json!({
        "RSpec": { "timestamp": FAR_FUTURE, "coverage": { "bar.rb": { "lines": [1, 0] } } }
    }));

    let strict = project.model_with(|o| o.staleness_mode = StalenessMode::Error);
    assert!(strict.summary_for("bar.rb").is_err());

    // Permissive mode serves the same query.
    let permissive = project.model();
    assert!(permissive.summary_for("bar.rb").is_ok());
}

#[test]
fn new_tracked_file_appears_in_missing_tracked_files() {
    let project = two_file_project();
    project.write_source("lib/new_file.rb", 2);

    let model = project.model_with(|o| o.tracked_globs = vec!["lib/**/*.rb".to_string()]);
    let listing = model.list(SortOrder::Ascending).unwrap();
    assert_eq!(listing.missing_tracked_files, vec!["lib/new_file.rb"]);

    // In strict mode the same finding is fatal.
    let strict = project.model_with(|o| {
        o.tracked_globs = vec!["lib/**/*.rb".to_string()];
        o.staleness_mode = StalenessMode::Error;
    });
    assert!(strict.list(SortOrder::Ascending).is_err());
}

#[test]
fn deleted_files_are_reported_and_validate_fails() {
    let project = two_file_project();
    fs::remove_file(project.root().join("lib/orders.rb")).unwrap();

    let model = project.model();
    let listing = model.list(SortOrder::Ascending).unwrap();
    assert_eq!(listing.deleted_files, vec!["lib/orders.rb"]);
    assert!(model.validate().is_err());
}

// ============================================================================
// Listing and Totals
// ============================================================================

#[test]
fn listing_orders_and_tags_rows() {
    let project = two_file_project();
    let model = project.model();

    let listing = model.list(SortOrder::Ascending).unwrap();
    assert_eq!(listing.files.len(), 2);
    // orders.rb is 0%, payments.rb is 66.67%.
    assert!(listing.files[0].file.ends_with("lib/orders.rb"));
    assert_eq!(listing.files[0].percentage, 0.0);
    assert_eq!(listing.files[0].stale, StaleStatus::Ok);
}

#[test]
fn totals_sum_only_trustworthy_files() {
    let project = two_file_project();
    // Make orders.rb stale by changing its length.
    project.write_source("lib/orders.rb", 9);

    let model = project.model();
    let totals = model.project_totals().unwrap();
    assert_eq!(totals.lines.covered, 2);
    assert_eq!(totals.lines.total, 3);
    assert_eq!(totals.files.ok, 1);
    assert_eq!(totals.files.stale, 1);
    assert_eq!(totals.percentage, 66.67);
}

#[test]
fn empty_total_is_one_hundred_percent() {
    let project = Project::new();
    project.write_source("empty.rb", 0);
    project.write_resultset(&json!({
        "RSpec": { "timestamp": FAR_FUTURE, "coverage": { "empty.rb": { "lines": [] } } }
    }));
    let model = project.model();
    let totals = model.project_totals().unwrap();
    assert_eq!(totals.lines.total, 0);
    assert_eq!(totals.percentage, 100.0);
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn resultset_is_found_under_coverage_dir() {
    let project = Project::new();
    project.write_source("a.rb", 1);
    fs::create_dir_all(project.root().join("coverage")).unwrap();
    fs::write(
        project.root().join("coverage/.resultset.json"),
        serde_json::to_string(&json!({
            "RSpec": { "timestamp": FAR_FUTURE, "coverage": { "a.rb": { "lines": [1] } } }
        }))
        .unwrap(),
    )
    .unwrap();

    let model = project.model();
    assert!(model
        .resultset_path()
        .ends_with("coverage/.resultset.json"));
    assert_eq!(model.summary_for("a.rb").unwrap().summary.covered, 1);
}

#[test]
fn missing_resultset_is_a_resolution_error() {
    let project = Project::new();
    let result = CoverageModel::new(
        &project.cache,
        &ModelOptions {
            root: Some(project.root().to_path_buf()),
            ..Default::default()
        },
    );
    let err = result.err().expect("model construction must fail");
    assert_eq!(err.exit_code(), 3);
}
