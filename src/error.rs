//! Unified error type for covscope.
//!
//! All subsystem failures converge on [`CovError`] before reaching the CLI
//! or MCP layers. The taxonomy separates failures a caller can act on
//! differently: data-format problems (retrying never helps), missing files
//! (run your tests), permission problems, and staleness — a *policy*
//! failure raised only when the caller opted into strict checking, carrying
//! the full diagnostic bundle so the renderer can explain precisely what
//! diverged.

use std::fmt::Write as _;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::staleness::{ProjectStalenessReport, StalenessDetail};

// ============================================================================
// Error Type
// ============================================================================

/// Unified error type for CLI and MCP output.
#[derive(Debug, Error)]
pub enum CovError {
    /// Command line usage errors.
    #[error("{0}")]
    Usage(String),

    /// Configuration or setup related errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// No resultset file could be located.
    #[error("{message}")]
    ResultsetNotFound { message: String },

    /// A source file (or explicitly named input) is absent.
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// Filesystem read denied; distinguished from not-found so callers can
    /// give a more specific diagnostic.
    #[error("permission denied: {path}")]
    FilePermission { path: String },

    /// The coverage map has no entry for the requested file.
    #[error("no coverage data found for file: {path}")]
    NoCoverageData { path: String },

    /// The resultset document is malformed (unparsable, wrong shape, or no
    /// usable suites).
    #[error("coverage data error: {0}")]
    CoverageData(String),

    /// An individual coverage entry is malformed.
    #[error("corrupt coverage data: {0}")]
    CorruptCoverageData(String),

    /// Strict-mode staleness failure for a single file.
    #[error("coverage data appears stale for {file}")]
    Stale {
        file: String,
        detail: StalenessDetail,
        resultset_path: Option<String>,
    },

    /// Strict-mode staleness failure for the whole project.
    #[error("coverage data appears stale for project")]
    ProjectStale {
        report: ProjectStalenessReport,
        coverage_timestamp: i64,
        resultset_path: Option<String>,
    },

    /// Unclassified I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (bug or unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CovError {
    /// Classify an I/O error against the path that produced it.
    pub fn from_io(err: io::Error, path: &Path) -> CovError {
        match err.kind() {
            io::ErrorKind::NotFound => CovError::FileNotFound {
                path: path.display().to_string(),
            },
            io::ErrorKind::PermissionDenied => CovError::FilePermission {
                path: path.display().to_string(),
            },
            _ => CovError::Io(err),
        }
    }

    /// Process exit code for the CLI: usage 2, resolution 3, staleness 4,
    /// everything else 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            CovError::Usage(_) | CovError::Config(_) => 2,
            CovError::ResultsetNotFound { .. }
            | CovError::FileNotFound { .. }
            | CovError::NoCoverageData { .. } => 3,
            CovError::Stale { .. } | CovError::ProjectStale { .. } => 4,
            _ => 1,
        }
    }

    /// Message suitable for direct presentation to a person.
    pub fn user_message(&self) -> String {
        match self {
            CovError::ResultsetNotFound { message } => format!(
                "File error: {message}\n\n\
                 Try one of the following:\n  \
                 - cd to a directory containing coverage/.resultset.json\n  \
                 - Specify a resultset: covscope --resultset PATH"
            ),
            CovError::FileNotFound { .. }
            | CovError::FilePermission { .. }
            | CovError::NoCoverageData { .. } => format!("File error: {self}"),
            CovError::CoverageData(_) | CovError::CorruptCoverageData(_) => {
                format!("Coverage data error: {self}")
            }
            CovError::Stale {
                file,
                detail,
                resultset_path,
            } => format_stale_message(file, detail, resultset_path.as_deref()),
            CovError::ProjectStale {
                report,
                coverage_timestamp,
                resultset_path,
            } => {
                format_project_stale_message(report, *coverage_timestamp, resultset_path.as_deref())
            }
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Staleness Message Formatting
// ============================================================================

fn format_epoch(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| seconds.to_string())
}

fn format_stale_message(
    file: &str,
    detail: &StalenessDetail,
    resultset_path: Option<&str>,
) -> String {
    let mut out = format!("Coverage data stale: coverage data appears stale for {file}");
    let file_time = detail
        .file_mtime
        .map(format_epoch)
        .unwrap_or_else(|| "not found".to_string());
    let _ = write!(
        out,
        "\nFile     - time: {file_time}, lines: {}\nCoverage - time: {}, lines: {}",
        detail.current_line_count,
        format_epoch(detail.coverage_timestamp),
        detail.recorded_line_count,
    );
    if let Some(path) = resultset_path {
        let _ = write!(out, "\nResultset: {path}");
    }
    out
}

fn format_project_stale_message(
    report: &ProjectStalenessReport,
    coverage_timestamp: i64,
    resultset_path: Option<&str>,
) -> String {
    let mut out = format!(
        "Coverage data stale (project): coverage timestamp {}",
        format_epoch(coverage_timestamp)
    );
    let sections: &[(&str, &Vec<String>)] = &[
        ("Newer than coverage", &report.newer_files),
        ("Tracked but never measured", &report.missing_files),
        ("Deleted since coverage", &report.deleted_files),
        ("Line count changed", &report.length_mismatch_files),
        ("Unreadable", &report.unreadable_files),
    ];
    for (label, files) in sections {
        if !files.is_empty() {
            let _ = write!(out, "\n{label}: {}", files.join(", "));
        }
    }
    if let Some(path) = resultset_path {
        let _ = write!(out, "\nResultset: {path}");
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
