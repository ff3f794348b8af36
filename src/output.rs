//! Output payload types and table rendering for CLI and MCP responses.
//!
//! These types are the caller contract: the CLI serializes them as JSON or
//! renders the listing as a table, and the MCP layer ships them as tool
//! results. Field names are stable; paths are absolute here and made
//! root-relative by [`crate::paths::PathRelativizer`] at the boundary.

use serde::Serialize;

use crate::coverage::{CoverageLines, DetailedLine, LineSummary};
use crate::loader::SkippedEntry;
use crate::staleness::StaleStatus;

// ============================================================================
// Per-file Payloads
// ============================================================================

/// Raw per-line hit counts for one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileRawPayload {
    pub file: String,
    pub lines: CoverageLines,
}

/// Covered/total/percentage for one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummaryPayload {
    pub file: String,
    pub summary: LineSummary,
}

/// Uncovered line numbers for one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileUncoveredPayload {
    pub file: String,
    pub uncovered: Vec<u32>,
    pub summary: LineSummary,
}

/// Detailed per-line rows for one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileDetailedPayload {
    pub file: String,
    pub lines: Vec<DetailedLine>,
    pub summary: LineSummary,
}

/// Per-file staleness verdict.
#[derive(Debug, Clone, Serialize)]
pub struct FileStalenessPayload {
    pub file: String,
    pub stale: StaleStatus,
}

// ============================================================================
// Project Payloads
// ============================================================================

/// One row of the project listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileRow {
    pub file: String,
    pub covered: u64,
    pub total: u64,
    pub percentage: f64,
    pub stale: StaleStatus,
}

/// The project listing: sorted rows plus staleness findings.
#[derive(Debug, Clone, Serialize)]
pub struct FileListReport {
    pub files: Vec<FileRow>,
    pub skipped_files: Vec<SkippedEntry>,
    pub missing_tracked_files: Vec<String>,
    pub newer_files: Vec<String>,
    pub deleted_files: Vec<String>,
}

/// Line sums across included files.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LineTotals {
    pub covered: u64,
    pub uncovered: u64,
    pub total: u64,
}

/// File counts by staleness.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FileCounts {
    pub total: usize,
    pub ok: usize,
    pub stale: usize,
}

/// Why files were excluded from the totals.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExcludedFiles {
    pub skipped: usize,
    pub missing_tracked: usize,
    pub newer: usize,
    pub deleted: usize,
}

/// Project-wide aggregate. Sums cover only files whose status is ok;
/// everything else is counted in `files.stale` and `excluded_files`.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectTotals {
    pub lines: LineTotals,
    pub percentage: f64,
    pub files: FileCounts,
    pub excluded_files: ExcludedFiles,
}

// ============================================================================
// Table Rendering
// ============================================================================

/// Render listing rows as a box-drawing table with a summary footer.
///
/// Stale rows carry a single-letter tag (T/L/M/E) in the last column; when
/// any row is tagged, a legend line follows the footer.
pub fn format_table(rows: &[FileRow]) -> String {
    if rows.is_empty() {
        return "No coverage data found".to_string();
    }

    let file_width = rows
        .iter()
        .map(|r| r.file.len())
        .max()
        .unwrap_or(0)
        .max("File".len())
        + 2;
    let pct_width = 8;
    let covered_width = rows
        .iter()
        .map(|r| r.covered.to_string().len())
        .max()
        .unwrap_or(0)
        .max("Covered".len())
        + 2;
    let total_width = rows
        .iter()
        .map(|r| r.total.to_string().len())
        .max()
        .unwrap_or(0)
        .max("Total".len())
        + 2;
    let stale_width = "Stale".len();

    let border = |left: &str, mid: &str, right: &str| {
        let seg = |w: usize| "─".repeat(w + 2);
        format!(
            "{left}{}{mid}{}{mid}{}{mid}{}{mid}{}{right}",
            seg(file_width),
            seg(pct_width),
            seg(covered_width),
            seg(total_width),
            seg(stale_width)
        )
    };

    let mut lines = Vec::with_capacity(rows.len() + 5);
    lines.push(border("┌", "┬", "┐"));
    lines.push(format!(
        "│ {:<file_width$} │ {:>pct_width$} │ {:>covered_width$} │ {:>total_width$} │ {:^stale_width$} │",
        "File", " %", "Covered", "Total", "Stale"
    ));
    lines.push(border("├", "┼", "┤"));
    for row in rows {
        lines.push(format!(
            "│ {:<file_width$} │ {:>pct_prec$.2}% │ {:>covered_width$} │ {:>total_width$} │ {:^stale_width$} │",
            row.file,
            row.percentage,
            row.covered,
            row.total,
            row.stale.code(),
            pct_prec = pct_width - 1,
        ));
    }
    lines.push(border("└", "┴", "┘"));

    let stale_count = rows.iter().filter(|r| r.stale.is_stale()).count();
    lines.push(format!(
        "Files: total {}, ok {}, stale {}",
        rows.len(),
        rows.len() - stale_count,
        stale_count
    ));
    if stale_count > 0 {
        lines.push("Staleness: T=newer, L=length mismatch, M=missing, E=error".to_string());
    }

    lines.join("\n")
}

// ============================================================================
// Tests
// ============================================================================
