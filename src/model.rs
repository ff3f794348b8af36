//! Query-facing coverage model.
//!
//! `CoverageModel` is the consumer of the cache and the staleness
//! classifier: it resolves a project root and resultset once, pulls the
//! merged coverage map through the cache, and answers per-file and
//! per-project questions. Staleness is re-derived on every query — source
//! files change between queries even while the cached resultset holds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::{CoverageDataCache, ModelData};
use crate::coverage::{self, CoverageLines};
use crate::error::CovError;
use crate::globs;
use crate::output::{
    ExcludedFiles, FileCounts, FileDetailedPayload, FileListReport, FileRawPayload, FileRow,
    FileStalenessPayload, FileSummaryPayload, FileUncoveredPayload, LineTotals, ProjectTotals,
};
use crate::paths::{self, PathRelativizer};
use crate::resultset;
use crate::staleness::{StaleStatus, StalenessChecker, StalenessMode};

// ============================================================================
// Options
// ============================================================================

/// Row ordering for project listings: by percentage, tie-broken by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl std::str::FromStr for SortOrder {
    type Err = CovError;

    fn from_str(s: &str) -> Result<Self, CovError> {
        match s {
            "ascending" => Ok(SortOrder::Ascending),
            "descending" => Ok(SortOrder::Descending),
            other => Err(CovError::Usage(format!(
                "invalid sort order '{other}' (expected 'ascending' or 'descending')"
            ))),
        }
    }
}

/// Construction options for a [`CoverageModel`].
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Project root; defaults to the current directory.
    pub root: Option<PathBuf>,
    /// Explicit resultset file or directory; default candidates otherwise.
    pub resultset: Option<PathBuf>,
    /// Strict staleness enforcement.
    pub staleness_mode: StalenessMode,
    /// Glob patterns scoping which files are expected to carry coverage.
    pub tracked_globs: Vec<String>,
}

// ============================================================================
// Model
// ============================================================================

/// One project's coverage, resolved and ready to query.
pub struct CoverageModel {
    root: PathBuf,
    resultset_path: PathBuf,
    data: Arc<ModelData>,
    case_sensitive: bool,
    staleness_mode: StalenessMode,
    tracked_globs: Vec<String>,
}

impl CoverageModel {
    /// Resolve the project and pull coverage through `cache`. The cache is
    /// injected so whoever owns process lifetime decides how long loaded
    /// data survives.
    pub fn new(cache: &CoverageDataCache, options: &ModelOptions) -> Result<Self, CovError> {
        let cwd = std::env::current_dir().map_err(CovError::Io)?;
        let root = match &options.root {
            Some(root) => paths::canonicalize(root, &cwd),
            None => cwd,
        };
        let resultset_path = resultset::find_resultset(&root, options.resultset.as_deref())?;
        let case_sensitive = paths::volume_case_sensitive(&root);
        let data = cache.get(&resultset_path, &root, case_sensitive)?;

        Ok(CoverageModel {
            root,
            resultset_path,
            data,
            case_sensitive,
            staleness_mode: options.staleness_mode,
            tracked_globs: globs::normalize_patterns(&options.tracked_globs),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resultset_path(&self) -> &Path {
        &self.resultset_path
    }

    /// Newest suite timestamp of the loaded coverage, epoch seconds.
    pub fn coverage_timestamp(&self) -> i64 {
        self.data.timestamp
    }

    /// Relativizer configured for this project's root and volume.
    pub fn relativizer(&self) -> PathRelativizer {
        PathRelativizer::new(&self.root, self.case_sensitive)
    }

    /// Serialize a payload and rewrite its path-bearing keys root-relative.
    pub fn relativize<T: Serialize>(&self, payload: &T) -> Result<Value, CovError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| CovError::Internal(format!("failed to serialize payload: {e}")))?;
        Ok(self.relativizer().relativize(&value))
    }

    // ========================================================================
    // Per-file Queries
    // ========================================================================

    pub fn raw_for(&self, path: &str) -> Result<FileRawPayload, CovError> {
        let (file, lines) = self.resolve(path)?;
        Ok(FileRawPayload {
            file,
            lines: lines.to_vec(),
        })
    }

    pub fn summary_for(&self, path: &str) -> Result<FileSummaryPayload, CovError> {
        let (file, lines) = self.resolve(path)?;
        Ok(FileSummaryPayload {
            file,
            summary: coverage::summary(lines),
        })
    }

    pub fn uncovered_for(&self, path: &str) -> Result<FileUncoveredPayload, CovError> {
        let (file, lines) = self.resolve(path)?;
        Ok(FileUncoveredPayload {
            file,
            uncovered: coverage::uncovered(lines),
            summary: coverage::summary(lines),
        })
    }

    pub fn detailed_for(&self, path: &str) -> Result<FileDetailedPayload, CovError> {
        let (file, lines) = self.resolve(path)?;
        Ok(FileDetailedPayload {
            file,
            lines: coverage::detailed(lines),
            summary: coverage::summary(lines),
        })
    }

    /// Per-file staleness verdict; never raises — failures classify as
    /// `error`.
    pub fn staleness_for(&self, path: &str) -> FileStalenessPayload {
        let file_abs = self.absolute(path);
        let stale = match self.lookup_lines(&file_abs) {
            Ok(lines) => self
                .checker(StalenessMode::Off)
                .status_for_file(&file_abs, lines),
            Err(e) => {
                debug!("staleness lookup failed for {path}: {e}");
                StaleStatus::Error
            }
        };
        FileStalenessPayload {
            file: file_abs,
            stale,
        }
    }

    // ========================================================================
    // Project Queries
    // ========================================================================

    /// Sorted project listing with per-file staleness tags and the
    /// project-level staleness findings. Strict mode raises instead.
    pub fn list(&self, sort_order: SortOrder) -> Result<FileListReport, CovError> {
        let matcher = if self.tracked_globs.is_empty() {
            None
        } else {
            Some(globs::build_matcher(&self.tracked_globs, &self.root)?)
        };

        let mut rows = Vec::new();
        let mut lines_by_path: BTreeMap<String, &CoverageLines> = BTreeMap::new();
        for (abs, lines) in &self.data.coverage_map {
            if let Some(set) = &matcher {
                if !globs::matches(set, abs) {
                    continue;
                }
            }
            lines_by_path.insert(abs.clone(), lines);
            let summary = coverage::summary(lines);
            rows.push(FileRow {
                file: abs.clone(),
                covered: summary.covered,
                total: summary.total,
                percentage: summary.percentage,
                stale: StaleStatus::Ok,
            });
        }

        let coverage_files: Vec<String> = lines_by_path.keys().cloned().collect();
        let report = self
            .checker(self.staleness_mode)
            .check_project(&lines_by_path, &coverage_files)?;

        for row in &mut rows {
            if let Some(status) = report.file_statuses.get(&row.file) {
                row.stale = *status;
            }
        }
        sort_rows(&mut rows, sort_order);

        Ok(FileListReport {
            files: rows,
            skipped_files: self.data.skipped.clone(),
            missing_tracked_files: report.missing_files,
            newer_files: report.newer_files,
            deleted_files: report.deleted_files,
        })
    }

    /// Aggregate covered/total across files whose coverage is still
    /// trustworthy; stale files are excluded from the sums and reported in
    /// the breakdown.
    pub fn project_totals(&self) -> Result<ProjectTotals, CovError> {
        let listing = self.list(SortOrder::Ascending)?;

        let mut covered = 0u64;
        let mut total = 0u64;
        let mut ok_count = 0usize;
        for row in &listing.files {
            if row.stale == StaleStatus::Ok {
                covered += row.covered;
                total += row.total;
                ok_count += 1;
            }
        }
        let percentage = if total == 0 {
            100.0
        } else {
            coverage::round2(covered as f64 / total as f64 * 100.0)
        };

        Ok(ProjectTotals {
            lines: LineTotals {
                covered,
                uncovered: total - covered,
                total,
            },
            percentage,
            files: FileCounts {
                total: listing.files.len(),
                ok: ok_count,
                stale: listing.files.len() - ok_count,
            },
            excluded_files: ExcludedFiles {
                skipped: listing.skipped_files.len(),
                missing_tracked: listing.missing_tracked_files.len(),
                newer: listing.newer_files.len(),
                deleted: listing.deleted_files.len(),
            },
        })
    }

    /// Project staleness check in strict mode regardless of the configured
    /// mode; `Ok` means the coverage still describes the tree.
    pub fn validate(&self) -> Result<(), CovError> {
        let mut lines_by_path: BTreeMap<String, &CoverageLines> = BTreeMap::new();
        for (abs, lines) in &self.data.coverage_map {
            lines_by_path.insert(abs.clone(), lines);
        }
        let coverage_files: Vec<String> = lines_by_path.keys().cloned().collect();
        self.checker(StalenessMode::Error)
            .check_project(&lines_by_path, &coverage_files)
            .map(|_| ())
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    fn absolute(&self, path: &str) -> String {
        paths::canonicalize(Path::new(path), &self.root)
            .to_string_lossy()
            .into_owned()
    }

    /// Resolve a request path to its canonical form and coverage entry,
    /// enforcing existence and (in strict mode) freshness.
    fn resolve(&self, path: &str) -> Result<(String, &CoverageLines), CovError> {
        let file_abs = self.absolute(path);
        let lines = self.lookup_lines(&file_abs).map_err(|e| match e {
            CovError::NoCoverageData { .. } => CovError::NoCoverageData {
                path: path.to_string(),
            },
            other => other,
        })?;

        // Missing files are fundamentally different from stale files and are
        // reported as such regardless of the staleness mode.
        if !Path::new(&file_abs).is_file() {
            return Err(CovError::FileNotFound {
                path: path.to_string(),
            });
        }

        self.checker(self.staleness_mode)
            .check_file(&file_abs, lines)?;
        Ok((file_abs, lines))
    }

    /// String-only lookup against the coverage map: exact key, then
    /// normalized comparison (separators, case folding per volume), then a
    /// unique basename match. Ambiguity is an error, absence is
    /// `NoCoverageData`.
    fn lookup_lines(&self, file_abs: &str) -> Result<&CoverageLines, CovError> {
        let map = &self.data.coverage_map;
        if let Some(lines) = map.get(file_abs) {
            return Ok(lines);
        }

        let target = paths::normalize_for_compare(file_abs, self.case_sensitive);
        let normalized: Vec<&String> = map
            .keys()
            .filter(|k| paths::normalize_for_compare(k, self.case_sensitive) == target)
            .collect();
        match normalized.len() {
            1 => return Ok(&map[normalized[0]]),
            0 => {}
            _ => {
                return Err(CovError::CoverageData(format!(
                    "multiple coverage entries match path {file_abs}"
                )))
            }
        }

        let basename = target.rsplit('/').next().unwrap_or(&target).to_string();
        let by_basename: Vec<&String> = map
            .keys()
            .filter(|k| {
                let key = paths::normalize_for_compare(k, self.case_sensitive);
                key == basename || key.ends_with(&format!("/{basename}"))
            })
            .collect();
        match by_basename.len() {
            1 => Ok(&map[by_basename[0]]),
            0 => Err(CovError::NoCoverageData {
                path: file_abs.to_string(),
            }),
            _ => Err(CovError::CoverageData(format!(
                "multiple coverage entries match basename {basename}"
            ))),
        }
    }

    fn checker(&self, mode: StalenessMode) -> StalenessChecker {
        StalenessChecker::new(
            &self.root,
            Some(&self.resultset_path),
            mode,
            &self.tracked_globs,
            self.data.timestamp,
            self.case_sensitive,
        )
    }
}

fn sort_rows(rows: &mut [FileRow], sort_order: SortOrder) {
    rows.sort_by(|a, b| {
        let pct = match sort_order {
            SortOrder::Ascending => a
                .percentage
                .partial_cmp(&b.percentage)
                .unwrap_or(std::cmp::Ordering::Equal),
            SortOrder::Descending => b
                .percentage
                .partial_cmp(&a.percentage)
                .unwrap_or(std::cmp::Ordering::Equal),
        };
        pct.then_with(|| a.file.cmp(&b.file))
    });
}

// ============================================================================
// Tests
// ============================================================================
