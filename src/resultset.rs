//! Resultset file discovery.
//!
//! An explicit `--resultset` argument is strict: a named file must exist, a
//! named directory must contain `.resultset.json`. Without an argument, a
//! small ordered list of conventional locations under the project root is
//! searched, and exhausting it is a hard error — silently proceeding with
//! no coverage would make every downstream answer meaningless.

use std::path::{Path, PathBuf};

use crate::error::CovError;
use crate::paths;

/// Conventional locations, probed in order, relative to the project root.
pub const RESULTSET_CANDIDATES: &[&str] = &[
    ".resultset.json",
    "coverage/.resultset.json",
    "tmp/.resultset.json",
];

/// Locate the resultset file for a project.
pub fn find_resultset(root: &Path, explicit: Option<&Path>) -> Result<PathBuf, CovError> {
    if let Some(arg) = explicit {
        let candidate = paths::canonicalize(arg, root);
        return resolve_explicit(&candidate);
    }

    RESULTSET_CANDIDATES
        .iter()
        .map(|rel| paths::canonicalize(Path::new(rel), root))
        .find(|p| p.is_file())
        .ok_or_else(|| CovError::ResultsetNotFound {
            message: format!(
                "could not find .resultset.json under {}; run tests or pass --resultset",
                root.display()
            ),
        })
}

fn resolve_explicit(candidate: &Path) -> Result<PathBuf, CovError> {
    if candidate.is_file() {
        return Ok(candidate.to_path_buf());
    }
    if candidate.is_dir() {
        let nested = candidate.join(".resultset.json");
        if nested.is_file() {
            return Ok(nested);
        }
        return Err(CovError::ResultsetNotFound {
            message: format!(
                "no .resultset.json found in directory: {}",
                candidate.display()
            ),
        });
    }
    Err(CovError::ResultsetNotFound {
        message: format!("specified resultset not found: {}", candidate.display()),
    })
}

// ============================================================================
// Tests
// ============================================================================
