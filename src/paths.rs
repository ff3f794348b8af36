//! Path identity: canonical forms, volume case-sensitivity, relativization.
//!
//! Coverage maps are keyed by absolute path, but resultset files routinely
//! mix relative keys, redundant `.`/`..` segments, and (on some volumes)
//! inconsistent casing. Everything here is defensive string/path algebra:
//! canonicalization never touches the filesystem and never fails; the only
//! I/O is the empirical case-sensitivity probe, which is cached per
//! directory and degrades to "case-insensitive" on any error — the
//! conservative answer that avoids false "file changed" positives later.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::debug;

// ============================================================================
// Canonicalization
// ============================================================================

/// True for rooted paths, including `C:\`-style drive prefixes that
/// `Path::is_absolute` only recognizes on Windows.
pub fn is_absolute_like(path: &Path) -> bool {
    if path.is_absolute() {
        return true;
    }
    has_drive_prefix(&path.to_string_lossy())
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

/// Resolve `path` against `root` into a cleaned absolute path.
///
/// Pure lexical algebra: `.` segments drop, `..` segments pop (but never
/// below the root), already-absolute inputs pass through cleaning only.
pub fn canonicalize(path: &Path, root: &Path) -> PathBuf {
    if is_absolute_like(path) {
        clean(path)
    } else {
        clean(&root.join(path))
    }
}

/// Remove `.` and `..` segments without touching the filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Normalize a path string for comparison: forward slashes, and folded case
/// on case-insensitive volumes. Stored keys are never mutated — this exists
/// purely so two spellings of the same file compare equal.
pub fn normalize_for_compare(path: &str, case_sensitive: bool) -> String {
    let slashed = path.replace('\\', "/");
    if case_sensitive {
        slashed
    } else {
        slashed.to_lowercase()
    }
}

// ============================================================================
// Relativization
// ============================================================================

/// Whether `path` sits inside `root`, honoring the volume's case rules and
/// requiring a path-boundary match (`/foo/bar` is not inside `/foo/ba`).
pub fn within_root(path: &str, root: &Path, case_sensitive: bool) -> bool {
    let norm_path = normalize_for_compare(path, case_sensitive);
    let norm_root = normalize_for_compare(&root.to_string_lossy(), case_sensitive);
    if norm_root.is_empty() || !norm_path.starts_with(&norm_root) {
        return false;
    }
    if norm_path.len() == norm_root.len() {
        return true;
    }
    norm_path.as_bytes()[norm_root.len()] == b'/'
}

/// Root-relative form of `path` when it lies inside `root`, otherwise the
/// input unchanged (cross-volume and cross-drive inputs are left alone).
/// Original casing is preserved in the returned slice.
pub fn relativize(path: &str, root: &Path, case_sensitive: bool) -> String {
    if !within_root(path, root, case_sensitive) {
        return path.to_string();
    }
    let root_len = root.to_string_lossy().len();
    match path.get(root_len..) {
        Some("") => ".".to_string(),
        Some(rest) => rest.trim_start_matches(['/', '\\']).to_string(),
        None => path.to_string(),
    }
}

// ============================================================================
// Volume Case Sensitivity
// ============================================================================

fn case_probe_cache() -> &'static Mutex<HashMap<PathBuf, bool>> {
    static CACHE: OnceLock<Mutex<HashMap<PathBuf, bool>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Detect whether the volume holding `dir` treats file names
/// case-sensitively.
///
/// Prefers probing an existing file (no writes): if the case-swapped twin of
/// a real file resolves to the same inode, the volume folds case. Falls back
/// to creating a uniquely named mixed-case probe file. Results are cached
/// per directory; probes are filesystem I/O and this gets asked on every
/// model construction.
pub fn volume_case_sensitive(dir: &Path) -> bool {
    let key = dir.to_path_buf();
    if let Ok(cache) = case_probe_cache().lock() {
        if let Some(&cached) = cache.get(&key) {
            return cached;
        }
    }
    let result = probe_case_sensitivity(dir).unwrap_or(false);
    if let Ok(mut cache) = case_probe_cache().lock() {
        cache.insert(key, result);
    }
    result
}

/// Drop cached probe results. Test isolation only.
pub fn clear_case_probe_cache() {
    if let Ok(mut cache) = case_probe_cache().lock() {
        cache.clear();
    }
}

fn probe_case_sensitivity(dir: &Path) -> Option<bool> {
    if !dir.is_dir() {
        return None;
    }
    if let Some(existing) = find_probe_candidate(dir) {
        return probe_with_existing_file(dir, &existing);
    }
    probe_with_temp_file(dir)
}

/// An existing regular file whose name contains at least one letter, so a
/// case-swapped variant is actually a different spelling.
fn find_probe_candidate(dir: &Path) -> Option<String> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.chars().any(|c| c.is_ascii_alphabetic())
            && entry.file_type().map(|t| t.is_file()).unwrap_or(false)
        {
            return Some(name);
        }
    }
    None
}

fn swap_case(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_lowercase() {
                c.to_ascii_uppercase()
            } else if c.is_ascii_uppercase() {
                c.to_ascii_lowercase()
            } else {
                c
            }
        })
        .collect()
}

fn probe_with_existing_file(dir: &Path, name: &str) -> Option<bool> {
    let original = dir.join(name);
    let alternate = dir.join(swap_case(name));
    if !alternate.exists() {
        // The other spelling resolves to nothing: names are distinct.
        return Some(true);
    }
    // Same file under both spellings means the volume folds case.
    Some(!same_file(&original, &alternate))
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}

fn probe_with_temp_file(dir: &Path) -> Option<bool> {
    let probe = unique_probe_path(dir)?;
    fs::write(&probe, b"").ok()?;
    let name = probe.file_name()?.to_string_lossy().into_owned();
    let variants = [
        probe.clone(),
        dir.join(name.to_uppercase()),
        dir.join(name.to_lowercase()),
    ];
    let existing = variants.iter().filter(|v| v.exists()).count();
    for variant in &variants {
        let _ = fs::remove_file(variant);
    }
    // Exactly one spelling visible -> the volume is case-sensitive.
    Some(existing == 1)
}

fn unique_probe_path(dir: &Path) -> Option<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_nanos();
    for attempt in 0u32..16 {
        let candidate = dir.join(format!("CovScope_CaseProbe_{nanos:x}_{attempt}.tmp"));
        let name = candidate.file_name()?.to_string_lossy().into_owned();
        let upper = dir.join(name.to_uppercase());
        let lower = dir.join(name.to_lowercase());
        if !candidate.exists() && !upper.exists() && !lower.exists() {
            return Some(candidate);
        }
    }
    debug!("could not find a free case-probe filename in {}", dir.display());
    None
}

// ============================================================================
// Payload Relativizer
// ============================================================================

/// Keys holding a single path string in output payloads.
pub const RELATIVIZER_SCALAR_KEYS: &[&str] = &["file", "file_path", "resultset_path"];

/// Keys holding arrays of path strings in output payloads.
pub const RELATIVIZER_ARRAY_KEYS: &[&str] = &[
    "newer_files",
    "missing_files",
    "deleted_files",
    "length_mismatch_files",
    "unreadable_files",
    "missing_tracked_files",
    "skipped_files",
];

/// Rewrites the path-bearing keys of a JSON payload into root-relative form,
/// producing a copy and leaving everything else untouched. Paths outside the
/// root pass through unchanged.
#[derive(Debug, Clone)]
pub struct PathRelativizer {
    root: PathBuf,
    case_sensitive: bool,
}

impl PathRelativizer {
    pub fn new(root: &Path, case_sensitive: bool) -> Self {
        PathRelativizer {
            root: root.to_path_buf(),
            case_sensitive,
        }
    }

    /// Root-relative form of one path (or the input unchanged).
    pub fn relativize_path(&self, path: &str) -> String {
        relativize(path, &self.root, self.case_sensitive)
    }

    /// Deep-copy `value` with configured scalar and array keys relativized.
    pub fn relativize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.relativize_entry(k, v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.relativize(v)).collect()),
            other => other.clone(),
        }
    }

    fn relativize_entry(&self, key: &str, value: &Value) -> Value {
        if RELATIVIZER_SCALAR_KEYS.contains(&key) {
            if let Value::String(s) = value {
                return Value::String(self.relativize_path(s));
            }
        }
        if RELATIVIZER_ARRAY_KEYS.contains(&key) {
            if let Value::Array(items) = value {
                return Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => Value::String(self.relativize_path(s)),
                            other => self.relativize(other),
                        })
                        .collect(),
                );
            }
        }
        self.relativize(value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn canonicalize_joins_relative_paths_to_root() {
        let out = canonicalize(Path::new("lib/foo.rb"), Path::new("/proj"));
        assert_eq!(out, PathBuf::from("/proj/lib/foo.rb"));
    }

    #[test]
    fn canonicalize_leaves_absolute_paths_alone() {
        let out = canonicalize(Path::new("/other/lib/foo.rb"), Path::new("/proj"));
        assert_eq!(out, PathBuf::from("/other/lib/foo.rb"));
    }

    #[test]
    fn canonicalize_resolves_dot_segments() {
        let out = canonicalize(Path::new("./lib/../lib/foo.rb"), Path::new("/proj"));
        assert_eq!(out, PathBuf::from("/proj/lib/foo.rb"));
    }

    #[test]
    fn canonicalize_never_pops_past_the_root() {
        let out = canonicalize(Path::new("../../../etc"), Path::new("/proj"));
        assert_eq!(out, PathBuf::from("/etc"));
    }

    #[test]
    fn drive_prefixed_paths_count_as_absolute() {
        assert!(is_absolute_like(Path::new("C:/Users/dev/proj")));
        assert!(is_absolute_like(Path::new(r"D:\work")));
        assert!(!is_absolute_like(Path::new("lib/foo.rb")));
    }

    #[test]
    fn relativize_strips_root_prefix() {
        let out = relativize("/proj/lib/foo.rb", Path::new("/proj"), true);
        assert_eq!(out, "lib/foo.rb");
    }

    #[test]
    fn relativize_requires_a_path_boundary() {
        let out = relativize("/project-two/lib/foo.rb", Path::new("/proj"), true);
        assert_eq!(out, "/project-two/lib/foo.rb");
    }

    #[test]
    fn relativize_leaves_outside_paths_unchanged() {
        let out = relativize("/elsewhere/foo.rb", Path::new("/proj"), true);
        assert_eq!(out, "/elsewhere/foo.rb");
    }

    #[test]
    fn relativize_folds_case_on_insensitive_volumes() {
        let out = relativize("/Proj/Lib/Foo.rb", Path::new("/proj"), false);
        assert_eq!(out, "Lib/Foo.rb");
    }

    #[test]
    fn relativize_of_the_root_itself_is_dot() {
        assert_eq!(relativize("/proj", Path::new("/proj"), true), ".");
    }

    #[test]
    fn case_probe_returns_a_stable_cached_answer() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("probe.txt"), b"x").unwrap();
        let first = volume_case_sensitive(dir.path());
        let second = volume_case_sensitive(dir.path());
        assert_eq!(first, second);
    }

    #[test]
    fn case_probe_on_missing_directory_is_conservative() {
        assert!(!volume_case_sensitive(Path::new("/no/such/dir/anywhere")));
    }

    #[test]
    fn relativizer_rewrites_scalar_and_array_keys() {
        let relativizer = PathRelativizer::new(Path::new("/proj"), true);
        let payload = json!({
            "file": "/proj/lib/foo.rb",
            "summary": { "covered": 1 },
            "newer_files": ["/proj/lib/a.rb", "/outside/b.rb"],
            "nested": [{ "file": "/proj/lib/c.rb" }]
        });
        let out = relativizer.relativize(&payload);
        assert_eq!(out["file"], "lib/foo.rb");
        assert_eq!(out["summary"]["covered"], 1);
        assert_eq!(out["newer_files"][0], "lib/a.rb");
        assert_eq!(out["newer_files"][1], "/outside/b.rb");
        assert_eq!(out["nested"][0]["file"], "lib/c.rb");
    }
}
