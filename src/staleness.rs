//! Staleness classification: is recorded coverage still trustworthy?
//!
//! Coverage data describes a source tree as it looked when the tests ran.
//! Every query re-derives, from the current filesystem, whether that
//! description still holds — per file (existence, mtime, line count against
//! the recorded entry length) and per project (files newer than the
//! coverage timestamp, tracked files never measured, measured files since
//! deleted).
//!
//! Two classification rules carry most of the weight:
//!
//! - A recorded length of exactly 0 is never a mismatch. It means "never
//!   measured" or "legitimately empty," not staleness.
//! - Length mismatch subsumes mtime-newness. A changed line count is
//!   strictly stronger evidence than a timestamp comparison, so a file is
//!   flagged as one or the other, never both. Unreadable files subsume the
//!   same way.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::debug;

use crate::coverage::CoverageLines;
use crate::error::CovError;
use crate::globs;
use crate::paths;

// ============================================================================
// Status
// ============================================================================

/// Per-file staleness verdict, in ascending priority order of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleStatus {
    /// Coverage still describes the file.
    Ok,
    /// File mtime is newer than the coverage timestamp.
    Newer,
    /// Current line count disagrees with the recorded entry length.
    LengthMismatch,
    /// File no longer exists on disk.
    Missing,
    /// File state could not be determined (permission or I/O error).
    Error,
}

impl StaleStatus {
    /// Anything other than `Ok` means the coverage cannot be trusted.
    pub fn is_stale(self) -> bool {
        self != StaleStatus::Ok
    }

    /// Single-letter tag used in table output ('T'ime, 'L'ength, 'M'issing,
    /// 'E'rror; empty when ok).
    pub fn code(self) -> &'static str {
        match self {
            StaleStatus::Ok => "",
            StaleStatus::Newer => "T",
            StaleStatus::LengthMismatch => "L",
            StaleStatus::Missing => "M",
            StaleStatus::Error => "E",
        }
    }
}

/// Whether strict checking raises on stale data or reports it as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalenessMode {
    /// Report staleness as data, never raise.
    #[default]
    Off,
    /// Raise a staleness error whenever anything diverged.
    Error,
}

impl std::str::FromStr for StalenessMode {
    type Err = CovError;

    fn from_str(s: &str) -> Result<Self, CovError> {
        match s {
            "off" => Ok(StalenessMode::Off),
            "error" => Ok(StalenessMode::Error),
            other => Err(CovError::Usage(format!(
                "invalid staleness mode '{other}' (expected 'off' or 'error')"
            ))),
        }
    }
}

// ============================================================================
// Per-file Detail
// ============================================================================

/// Everything the classifier derived about one file, recomputed per query
/// since sources can change between queries even while the cache holds.
#[derive(Debug, Clone, Serialize)]
pub struct StalenessDetail {
    pub exists: bool,
    /// Epoch seconds, absent when the file is missing or unreadable.
    pub file_mtime: Option<i64>,
    pub coverage_timestamp: i64,
    pub recorded_line_count: usize,
    pub current_line_count: usize,
    pub is_newer: bool,
    pub is_length_mismatch: bool,
    pub read_error: bool,
}

impl StalenessDetail {
    /// Resolve the detail into a single status, in priority order:
    /// error > missing > length_mismatch > newer > ok.
    pub fn status(&self) -> StaleStatus {
        if self.read_error {
            StaleStatus::Error
        } else if !self.exists {
            StaleStatus::Missing
        } else if self.is_length_mismatch {
            StaleStatus::LengthMismatch
        } else if self.is_newer {
            StaleStatus::Newer
        } else {
            StaleStatus::Ok
        }
    }
}

// ============================================================================
// Project Report
// ============================================================================

/// How usable the coverage timestamp was for time-based checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampStatus {
    Ok,
    /// Timestamp normalized to 0; time-based staleness was skipped.
    Missing,
}

/// Project-level staleness findings. All path lists are root-relative.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStalenessReport {
    /// Measured files whose mtime exceeds the coverage timestamp.
    pub newer_files: Vec<String>,
    /// Tracked files on disk with no coverage entry at all.
    pub missing_files: Vec<String>,
    /// Files the coverage map references that no longer exist.
    pub deleted_files: Vec<String>,
    /// Measured files whose current line count diverged.
    pub length_mismatch_files: Vec<String>,
    /// Files whose state could not be determined.
    pub unreadable_files: Vec<String>,
    /// Per-file status keyed by absolute path (for row tagging; not
    /// serialized — the relative lists above are the caller contract).
    #[serde(skip)]
    pub file_statuses: BTreeMap<String, StaleStatus>,
    pub timestamp_status: TimestampStatus,
}

impl ProjectStalenessReport {
    pub fn has_findings(&self) -> bool {
        !self.newer_files.is_empty()
            || !self.missing_files.is_empty()
            || !self.deleted_files.is_empty()
            || !self.length_mismatch_files.is_empty()
            || !self.unreadable_files.is_empty()
    }
}

// ============================================================================
// Checker
// ============================================================================

/// Stateless-per-call staleness classifier for one project root.
#[derive(Debug, Clone)]
pub struct StalenessChecker {
    root: PathBuf,
    resultset_path: Option<PathBuf>,
    mode: StalenessMode,
    tracked_globs: Vec<String>,
    coverage_timestamp: i64,
    case_sensitive: bool,
}

impl StalenessChecker {
    pub fn new(
        root: &Path,
        resultset_path: Option<&Path>,
        mode: StalenessMode,
        tracked_globs: &[String],
        coverage_timestamp: i64,
        case_sensitive: bool,
    ) -> Self {
        StalenessChecker {
            root: root.to_path_buf(),
            resultset_path: resultset_path.map(Path::to_path_buf),
            mode,
            tracked_globs: globs::normalize_patterns(tracked_globs),
            coverage_timestamp,
            case_sensitive,
        }
    }

    pub fn mode(&self) -> StalenessMode {
        self.mode
    }

    /// Derive the full staleness detail for one file against its recorded
    /// coverage entry. Never raises; failures fold into `read_error`.
    pub fn file_detail(&self, file_abs: &str, lines: &[crate::coverage::LineCoverage]) -> StalenessDetail {
        let path = Path::new(file_abs);
        let recorded_line_count = lines.len();

        let (exists, file_mtime, mut read_error) = file_state(path);

        let current_line_count = if exists && !read_error {
            match count_lines(path) {
                Ok(count) => count,
                Err(_) => {
                    read_error = true;
                    0
                }
            }
        } else {
            0
        };

        // A recorded length of 0 means "never measured", not staleness; and
        // a count we failed to read proves nothing.
        let is_length_mismatch = if exists && !read_error {
            recorded_line_count > 0 && current_line_count != recorded_line_count
        } else {
            // A missing file is maximally stale: both signals read true.
            !read_error && !exists
        };

        let is_newer = self.newer_than_coverage(file_mtime, exists, is_length_mismatch, read_error);

        StalenessDetail {
            exists,
            file_mtime,
            coverage_timestamp: self.coverage_timestamp,
            recorded_line_count,
            current_line_count,
            is_newer,
            is_length_mismatch,
            read_error,
        }
    }

    /// Length mismatch (and read errors) subsume mtime-newness so a file is
    /// never double-flagged; timestamp 0 disables time checks entirely.
    fn newer_than_coverage(
        &self,
        file_mtime: Option<i64>,
        exists: bool,
        is_length_mismatch: bool,
        read_error: bool,
    ) -> bool {
        if !exists {
            // Missing files report newer=true in the detail (maximally stale).
            return !read_error;
        }
        if self.coverage_timestamp <= 0 {
            return false;
        }
        let newer = file_mtime.is_some_and(|mtime| mtime > self.coverage_timestamp);
        newer && !is_length_mismatch && !read_error
    }

    /// Status for one file; never raises.
    pub fn status_for_file(
        &self,
        file_abs: &str,
        lines: &[crate::coverage::LineCoverage],
    ) -> StaleStatus {
        self.file_detail(file_abs, lines).status()
    }

    /// Strict-mode gate for a single file: raises when the file is stale or
    /// unreadable, no-op when the mode is `Off`.
    pub fn check_file(
        &self,
        file_abs: &str,
        lines: &[crate::coverage::LineCoverage],
    ) -> Result<(), CovError> {
        if self.mode == StalenessMode::Off {
            return Ok(());
        }
        let detail = self.file_detail(file_abs, lines);
        if detail.read_error {
            return Err(CovError::FilePermission {
                path: self.rel(file_abs),
            });
        }
        if detail.is_newer || detail.is_length_mismatch {
            return Err(CovError::Stale {
                file: self.rel(file_abs),
                detail,
                resultset_path: self.resultset_display(),
            });
        }
        Ok(())
    }

    /// Project-wide aggregation. `lines_by_path` scopes the length-mismatch
    /// check (tracked subset); `coverage_files` is the same subset of map
    /// keys. Always computes the full report; raises only in strict mode.
    pub fn check_project(
        &self,
        lines_by_path: &BTreeMap<String, &CoverageLines>,
        coverage_files: &[String],
    ) -> Result<ProjectStalenessReport, CovError> {
        let check_newer = self.coverage_timestamp > 0;
        let mut newer = Vec::new();
        let mut deleted = Vec::new();
        let mut unreadable = Vec::new();

        for abs in coverage_files {
            let path = Path::new(abs);
            match path_exists(path) {
                Ok(true) => {
                    if check_newer {
                        match mtime_epoch(path) {
                            Ok(Some(mtime)) if mtime > self.coverage_timestamp => {
                                newer.push(self.rel(abs));
                            }
                            Ok(_) => {}
                            Err(_) => unreadable.push(self.rel(abs)),
                        }
                    }
                }
                Ok(false) => deleted.push(self.rel(abs)),
                Err(_) => unreadable.push(self.rel(abs)),
            }
        }

        let missing = self.missing_tracked_files(coverage_files);

        let mut file_statuses = BTreeMap::new();
        let mut length_mismatch = Vec::new();
        for (abs, lines) in lines_by_path {
            let detail = self.file_detail(abs, lines);
            let status = detail.status();
            file_statuses.insert(abs.clone(), status);
            if detail.read_error {
                let rel = self.rel(abs);
                if !unreadable.contains(&rel) {
                    unreadable.push(rel);
                }
            }
            if detail.is_length_mismatch && detail.exists {
                length_mismatch.push(self.rel(abs));
            }
        }

        // Length mismatch and unreadability are the stronger signals; a file
        // carrying either never also appears in newer_files.
        newer.retain(|f| !length_mismatch.contains(f) && !unreadable.contains(f));

        let report = ProjectStalenessReport {
            newer_files: newer,
            missing_files: missing,
            deleted_files: deleted,
            length_mismatch_files: length_mismatch,
            unreadable_files: unreadable,
            file_statuses,
            timestamp_status: if self.coverage_timestamp > 0 {
                TimestampStatus::Ok
            } else {
                TimestampStatus::Missing
            },
        };

        if self.mode == StalenessMode::Error && report.has_findings() {
            return Err(CovError::ProjectStale {
                report,
                coverage_timestamp: self.coverage_timestamp,
                resultset_path: self.resultset_display(),
            });
        }

        Ok(report)
    }

    /// Tracked files on disk that the coverage map has never seen.
    fn missing_tracked_files(&self, coverage_files: &[String]) -> Vec<String> {
        if self.tracked_globs.is_empty() {
            return Vec::new();
        }
        let matcher = match globs::build_matcher(&self.tracked_globs, &self.root) {
            Ok(matcher) => matcher,
            Err(e) => {
                debug!("skipping missing-file scan, bad tracked globs: {e}");
                return Vec::new();
            }
        };
        let covered: Vec<String> = coverage_files
            .iter()
            .map(|p| paths::normalize_for_compare(p, self.case_sensitive))
            .collect();
        globs::expand_tracked(&self.root, &matcher)
            .into_iter()
            .filter(|abs| {
                let key = paths::normalize_for_compare(abs, self.case_sensitive);
                !covered.contains(&key)
            })
            .map(|abs| self.rel(&abs))
            .collect()
    }

    fn rel(&self, path: &str) -> String {
        paths::relativize(path, &self.root, self.case_sensitive)
    }

    fn resultset_display(&self) -> Option<String> {
        self.resultset_path
            .as_ref()
            .map(|p| p.display().to_string())
    }
}

// ============================================================================
// Filesystem Probes
// ============================================================================

/// (exists, mtime, read_error) for one path, never raising.
fn file_state(path: &Path) -> (bool, Option<i64>, bool) {
    match path_exists(path) {
        Ok(false) => (false, None, false),
        Ok(true) => match mtime_epoch(path) {
            Ok(mtime) => (true, mtime, false),
            Err(_) => (true, None, true),
        },
        Err(_) => (false, None, true),
    }
}

/// Existence check that distinguishes "not there" from "can't tell".
fn path_exists(path: &Path) -> Result<bool, std::io::Error> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn mtime_epoch(path: &Path) -> Result<Option<i64>, std::io::Error> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64))
}

/// Line count the way a text editor reports it: newline-separated, with an
/// unterminated final line still counting.
fn count_lines(path: &Path) -> Result<usize, std::io::Error> {
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Ok(0);
    }
    let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
    if bytes.last() == Some(&b'\n') {
        Ok(newlines)
    } else {
        Ok(newlines + 1)
    }
}

// ============================================================================
// Tests
// ============================================================================
