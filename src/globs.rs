//! Glob matching for tracked-file scoping.
//!
//! The staleness aggregator consumes this as a black-box predicate: "does
//! this absolute path match the caller's tracked patterns." Patterns are
//! absolutized against the project root before compilation, and `*` does
//! not cross path separators (pathname semantics), so `lib/*.rb` matches
//! only direct children while `lib/**/*.rb` matches the whole subtree.

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::CovError;
use crate::paths;

/// Drop empty and whitespace-only patterns.
pub fn normalize_patterns(globs: &[String]) -> Vec<String> {
    globs
        .iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect()
}

/// Absolute form of one pattern: absolute patterns pass through, relative
/// ones anchor at the root.
pub fn absolutize_pattern(pattern: &str, root: &Path) -> String {
    if paths::is_absolute_like(Path::new(pattern)) {
        pattern.to_string()
    } else {
        format!("{}/{}", root.display(), pattern)
    }
}

/// Compile patterns into one matcher. Invalid patterns are a configuration
/// error carrying the offending pattern.
pub fn build_matcher(patterns: &[String], root: &Path) -> Result<GlobSet, CovError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let absolute = absolutize_pattern(pattern, root);
        let glob = GlobBuilder::new(&absolute)
            .literal_separator(true)
            .build()
            .map_err(|e| CovError::Config(format!("invalid glob pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CovError::Config(format!("invalid glob patterns: {e}")))
}

/// Whether one absolute path matches any compiled pattern.
pub fn matches(set: &GlobSet, abs_path: &str) -> bool {
    set.is_match(Path::new(abs_path))
}

/// Keep the paths matching the matcher; `None` keeps everything.
pub fn filter_paths<'a, I>(paths: I, set: Option<&GlobSet>) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    match set {
        None => paths.into_iter().cloned().collect(),
        Some(set) => paths
            .into_iter()
            .filter(|p| matches(set, p))
            .cloned()
            .collect(),
    }
}

/// Walk the project tree and return every regular file matching the
/// matcher, as canonical absolute path strings. Unreadable subtrees are
/// skipped rather than fatal — expansion feeds diagnostics, not queries.
pub fn expand_tracked(root: &Path, set: &GlobSet) -> Vec<String> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let abs = entry.path().to_string_lossy().into_owned();
        if matches(set, &abs) {
            out.push(abs);
        }
    }
    out.sort();
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn normalize_drops_empty_patterns() {
        let input = vec!["lib/**/*.rb".to_string(), "".to_string(), "  ".to_string()];
        assert_eq!(normalize_patterns(&input), vec!["lib/**/*.rb"]);
    }

    #[test]
    fn relative_patterns_anchor_at_root() {
        let set = build_matcher(&["lib/**/*.rb".to_string()], Path::new("/proj")).unwrap();
        assert!(matches(&set, "/proj/lib/a.rb"));
        assert!(matches(&set, "/proj/lib/deep/b.rb"));
        assert!(!matches(&set, "/other/lib/a.rb"));
    }

    #[test]
    fn single_star_does_not_cross_separators() {
        let set = build_matcher(&["lib/*.rb".to_string()], Path::new("/proj")).unwrap();
        assert!(matches(&set, "/proj/lib/a.rb"));
        assert!(!matches(&set, "/proj/lib/deep/b.rb"));
    }

    #[test]
    fn absolute_patterns_pass_through() {
        let set = build_matcher(&["/tmp/*.rb".to_string()], Path::new("/proj")).unwrap();
        assert!(matches(&set, "/tmp/a.rb"));
    }

    #[test]
    fn invalid_patterns_are_config_errors() {
        let err = build_matcher(&["lib/[".to_string()], Path::new("/proj")).unwrap_err();
        assert!(matches!(err, CovError::Config(_)));
    }

    #[test]
    fn expand_tracked_finds_matching_files_on_disk() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("lib/sub")).unwrap();
        fs::write(dir.path().join("lib/a.rb"), "x").unwrap();
        fs::write(dir.path().join("lib/sub/b.rb"), "x").unwrap();
        fs::write(dir.path().join("lib/readme.md"), "x").unwrap();

        let set = build_matcher(&["lib/**/*.rb".to_string()], dir.path()).unwrap();
        let found = expand_tracked(dir.path(), &set);
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("lib/a.rb"));
        assert!(found[1].ends_with("lib/sub/b.rb"));
    }

    #[test]
    fn filter_paths_without_matcher_keeps_everything() {
        let items = vec!["/a".to_string(), "/b".to_string()];
        assert_eq!(filter_paths(items.iter(), None).len(), 2);
    }
}
