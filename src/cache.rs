//! Process-wide coverage data cache with two-stage invalidation.
//!
//! Parsing and merging a large resultset is the dominant cost of every
//! query, and every CLI invocation and MCP tool call re-derives the same
//! data. The cache makes repeated access cheap without ever serving data
//! that is quietly wrong:
//!
//! 1. A stat-based signature (mtime with sub-second precision, size, inode)
//!    is the cheap pre-check.
//! 2. On a signature match, a content digest confirms. Some filesystems
//!    truncate mtime to whole seconds, so a file rewritten within the same
//!    second with the same length would evade the signature alone — the
//!    digest is the correctness backstop.
//!
//! Entries are replaced, never mutated: a reader holding the previous
//! `Arc<ModelData>` keeps a fully valid snapshot across reloads.

use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::Hasher as _;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::debug;
use twox_hash::XxHash64;

use crate::coverage::CoverageMap;
use crate::error::CovError;
use crate::loader::{self, SkippedEntry};

// ============================================================================
// Model Data
// ============================================================================

/// Immutable unit of cached coverage: the merged map, the representative
/// timestamp, and the resultset it came from. Constructed by the loader on
/// a cache miss; superseded (never mutated) on reload.
#[derive(Debug)]
pub struct ModelData {
    pub coverage_map: CoverageMap,
    pub timestamp: i64,
    pub resultset_path: PathBuf,
    /// Entries the loader could not interpret, surfaced in listings.
    pub skipped: Vec<SkippedEntry>,
}

// ============================================================================
// File Signature
// ============================================================================

/// Cheap stat-derived identity for the resultset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSignature {
    /// Modification time at whatever precision the filesystem offers.
    pub mtime: SystemTime,
    pub size: u64,
    /// Inode where the platform has one; survives replace-by-rename.
    pub inode: Option<u64>,
}

fn compute_signature(path: &Path) -> Option<FileSignature> {
    let meta = fs::metadata(path).ok()?;
    Some(FileSignature {
        mtime: meta.modified().ok()?,
        size: meta.len(),
        inode: inode_of(&meta),
    })
}

#[cfg(unix)]
fn inode_of(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode_of(_meta: &fs::Metadata) -> Option<u64> {
    None
}

/// Fast non-cryptographic digest over the full file bytes. Change
/// detection only — collisions from an adversary are out of scope.
fn compute_digest(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut hasher = XxHash64::with_seed(0);
    let mut buffer = [0u8; 64 * 1024];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.write(&buffer[..n]),
            Err(_) => return None,
        }
    }
    Some(format!("{:016x}", hasher.finish()))
}

// ============================================================================
// Cache
// ============================================================================

struct CacheEntry {
    data: Arc<ModelData>,
    signature: FileSignature,
    digest: String,
}

/// Cache key: the resolved resultset path plus the volume case-sensitivity
/// used to normalize its keys — the same file loaded under different case
/// rules produces a differently keyed map.
type CacheKey = (PathBuf, bool);

/// Thread-safe store of the most recently loaded coverage per resultset.
///
/// One mutex guards the whole stat → compare → reload → store sequence.
/// Deliberately coarse: reloads are I/O-bound and the tool runs at
/// request timescales, so per-key locking would buy complexity, not
/// throughput. Construct one and pass it by reference; there is no ambient
/// global instance.
#[derive(Default)]
pub struct CoverageDataCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl CoverageDataCache {
    pub fn new() -> Self {
        CoverageDataCache::default()
    }

    /// Fetch coverage for `resultset_path`, reloading if the file changed.
    ///
    /// Two consecutive calls with no intervening file change return the
    /// same `Arc` allocation — no redundant parse work. When the stat or
    /// digest cannot be computed, the freshly loaded data is returned
    /// without caching it: fail open toward correctness, not caching.
    pub fn get(
        &self,
        resultset_path: &Path,
        root: &Path,
        case_sensitive: bool,
    ) -> Result<Arc<ModelData>, CovError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CovError::Internal("coverage cache mutex poisoned".into()))?;

        let key = (resultset_path.to_path_buf(), case_sensitive);
        let signature = compute_signature(resultset_path);

        let mut digest = None;
        if let (Some(entry), Some(sig)) = (entries.get(&key), signature.as_ref()) {
            if entry.signature == *sig {
                digest = compute_digest(resultset_path);
                if digest.as_deref() == Some(entry.digest.as_str()) {
                    return Ok(Arc::clone(&entry.data));
                }
                debug!(
                    "resultset {} digest changed under a matching signature; reloading",
                    resultset_path.display()
                );
            }
        }

        let loaded = loader::load(resultset_path, root, case_sensitive)?;
        let data = Arc::new(ModelData {
            coverage_map: loaded.coverage_map,
            timestamp: loaded.timestamp,
            resultset_path: resultset_path.to_path_buf(),
            skipped: loaded.skipped,
        });

        let digest = digest.or_else(|| compute_digest(resultset_path));
        match (signature, digest) {
            (Some(signature), Some(digest)) => {
                entries.insert(
                    key,
                    CacheEntry {
                        data: Arc::clone(&data),
                        signature,
                        digest,
                    },
                );
            }
            _ => {
                debug!(
                    "signature or digest unavailable for {}; serving uncached",
                    resultset_path.display()
                );
            }
        }

        Ok(data)
    }

    /// Drop all entries. Test isolation and explicit cache-bust only —
    /// never invoked automatically.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
