//! Glob-based file enumeration and mtime-driven change detection.

use std::{
  collections::{BTreeMap, HashMap, HashSet},
  path::{Path, PathBuf},
  time::UNIX_EPOCH,
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::{debug, trace, warn};

use crate::error::IndexError;

/// A file discovered during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
  pub absolute_path: PathBuf,
  /// POSIX-style path relative to the project root
  pub relative_path: String,
  /// Modification time in Unix milliseconds
  pub mtime_ms: i64,
}

/// Classification of the current filesystem against stored file metadata.
///
/// The four lists are disjoint and order-stable (sorted by relative path).
#[derive(Debug, Default)]
pub struct ScanDiff {
  /// On disk but not in stored metadata
  pub added: Vec<ScannedFile>,
  /// In stored metadata with a newer mtime on disk
  pub modified: Vec<ScannedFile>,
  /// In stored metadata with an unchanged mtime
  pub unchanged: Vec<ScannedFile>,
  /// In stored metadata but no longer enumerated (relative paths)
  pub deleted: Vec<String>,
}

impl ScanDiff {
  pub fn has_changes(&self) -> bool {
    !self.added.is_empty() || !self.modified.is_empty() || !self.deleted.is_empty()
  }
}

/// Enumerates project files matching include/exclude globs.
pub struct Scanner {
  root: PathBuf,
  include: GlobSet,
  exclude: GlobSet,
}

impl Scanner {
  pub fn new(root: &Path, patterns: &[String], exclude_patterns: &[String]) -> Result<Self, IndexError> {
    Ok(Self {
      root: root.to_path_buf(),
      include: build_glob_set(patterns)?,
      exclude: build_glob_set(exclude_patterns)?,
    })
  }

  /// Enumerate matching files with deterministic ordering (sorted by relative
  /// path, de-duplicated).
  pub fn enumerate(&self) -> Result<Vec<ScannedFile>, IndexError> {
    // BTreeMap gives de-duplication and sorted output in one pass
    let mut found: BTreeMap<String, ScannedFile> = BTreeMap::new();

    let walker = WalkBuilder::new(&self.root)
      .hidden(true)
      .git_ignore(true)
      .git_global(true)
      .git_exclude(true)
      .build();

    for entry in walker.flatten() {
      let path = entry.path();
      if entry.file_type().is_none_or(|ft| ft.is_dir()) {
        continue;
      }

      let Ok(relative) = path.strip_prefix(&self.root) else {
        continue;
      };
      let relative_path = to_posix(relative);

      if !self.include.is_match(&relative_path) || self.exclude.is_match(&relative_path) {
        continue;
      }

      let mtime_ms = match file_mtime_ms(path) {
        Ok(mtime) => mtime,
        Err(e) => {
          warn!(path = %path.display(), err = %e, "Failed to stat file, skipping");
          continue;
        }
      };

      let absolute_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
      found.insert(
        relative_path.clone(),
        ScannedFile {
          absolute_path,
          relative_path,
          mtime_ms,
        },
      );
    }

    let files: Vec<ScannedFile> = found.into_values().collect();
    debug!(root = %self.root.display(), files = files.len(), "Enumeration complete");
    Ok(files)
  }

  /// Classify enumerated files against stored metadata (`relative path ->
  /// mtime_ms` as last indexed).
  pub fn diff(current: Vec<ScannedFile>, stored: &HashMap<String, i64>) -> ScanDiff {
    let current_paths: HashSet<&str> = current.iter().map(|f| f.relative_path.as_str()).collect();

    let mut deleted: Vec<String> = stored
      .keys()
      .filter(|path| !current_paths.contains(path.as_str()))
      .cloned()
      .collect();
    deleted.sort();

    let mut diff = ScanDiff {
      deleted,
      ..Default::default()
    };

    for file in current {
      match stored.get(&file.relative_path) {
        None => diff.added.push(file),
        Some(&stored_mtime) if file.mtime_ms > stored_mtime => diff.modified.push(file),
        Some(_) => diff.unchanged.push(file),
      }
    }

    trace!(
      added = diff.added.len(),
      modified = diff.modified.len(),
      unchanged = diff.unchanged.len(),
      deleted = diff.deleted.len(),
      "Change detection complete"
    );
    diff
  }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, IndexError> {
  let mut builder = GlobSetBuilder::new();
  for pattern in patterns {
    let glob = Glob::new(pattern).map_err(|e| IndexError::Pattern(format!("{}: {}", pattern, e)))?;
    builder.add(glob);
  }
  builder.build().map_err(|e| IndexError::Pattern(e.to_string()))
}

fn to_posix(path: &Path) -> String {
  path
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

pub(crate) fn file_mtime_ms(path: &Path) -> std::io::Result<i64> {
  let metadata = std::fs::metadata(path)?;
  let modified = metadata.modified()?;
  Ok(
    modified
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as i64)
      .unwrap_or(0),
  )
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  fn scanner_for(root: &Path) -> Scanner {
    Scanner::new(
      root,
      &["**/*.rs".to_string(), "**/*.py".to_string()],
      &["**/target/**".to_string()],
    )
    .unwrap()
  }

  #[test]
  fn test_enumerate_matches_patterns() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("main.rs"), "fn main() {}").unwrap();
    std::fs::write(temp.path().join("script.py"), "pass").unwrap();
    std::fs::write(temp.path().join("notes.txt"), "skip me").unwrap();

    let files = scanner_for(temp.path()).enumerate().unwrap();
    let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
    assert_eq!(paths, vec!["main.rs", "script.py"]);
  }

  #[test]
  fn test_enumerate_applies_excludes() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("target/debug")).unwrap();
    std::fs::write(temp.path().join("lib.rs"), "pub fn f() {}").unwrap();
    std::fs::write(temp.path().join("target/debug/gen.rs"), "fn g() {}").unwrap();

    let files = scanner_for(temp.path()).enumerate().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].relative_path, "lib.rs");
  }

  #[test]
  fn test_enumerate_is_sorted_and_deterministic() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("src")).unwrap();
    std::fs::write(temp.path().join("zeta.rs"), "x").unwrap();
    std::fs::write(temp.path().join("alpha.rs"), "x").unwrap();
    std::fs::write(temp.path().join("src/mid.rs"), "x").unwrap();

    let scanner = scanner_for(temp.path());
    let first = scanner.enumerate().unwrap();
    let second = scanner.enumerate().unwrap();
    assert_eq!(first, second);

    let paths: Vec<&str> = first.iter().map(|f| f.relative_path.as_str()).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
  }

  #[test]
  fn test_invalid_pattern_rejected() {
    let temp = TempDir::new().unwrap();
    let result = Scanner::new(temp.path(), &["[bad".to_string()], &[]);
    assert!(matches!(result, Err(IndexError::Pattern(_))));
  }

  #[test]
  fn test_diff_classification() {
    let current = vec![
      ScannedFile {
        absolute_path: PathBuf::from("/p/new.rs"),
        relative_path: "new.rs".to_string(),
        mtime_ms: 100,
      },
      ScannedFile {
        absolute_path: PathBuf::from("/p/touched.rs"),
        relative_path: "touched.rs".to_string(),
        mtime_ms: 500,
      },
      ScannedFile {
        absolute_path: PathBuf::from("/p/same.rs"),
        relative_path: "same.rs".to_string(),
        mtime_ms: 200,
      },
    ];
    let stored: HashMap<String, i64> = [
      ("touched.rs".to_string(), 400i64),
      ("same.rs".to_string(), 200),
      ("gone.rs".to_string(), 300),
    ]
    .into_iter()
    .collect();

    let diff = Scanner::diff(current, &stored);
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].relative_path, "new.rs");
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].relative_path, "touched.rs");
    assert_eq!(diff.unchanged.len(), 1);
    assert_eq!(diff.unchanged[0].relative_path, "same.rs");
    assert_eq!(diff.deleted, vec!["gone.rs".to_string()]);
    assert!(diff.has_changes());
  }

  #[test]
  fn test_diff_equal_mtime_is_unchanged() {
    let current = vec![ScannedFile {
      absolute_path: PathBuf::from("/p/a.rs"),
      relative_path: "a.rs".to_string(),
      mtime_ms: 100,
    }];
    let stored: HashMap<String, i64> = [("a.rs".to_string(), 100i64)].into_iter().collect();

    let diff = Scanner::diff(current, &stored);
    assert_eq!(diff.unchanged.len(), 1);
    assert!(!diff.has_changes());
  }

  #[test]
  fn test_mtime_bump_detected() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("a.rs");
    std::fs::write(&file, "fn a() {}").unwrap();

    let scanner = scanner_for(temp.path());
    let before = scanner.enumerate().unwrap();
    let stored: HashMap<String, i64> = before.iter().map(|f| (f.relative_path.clone(), f.mtime_ms)).collect();

    // Bump mtime forward by 10 seconds
    let new_time = filetime::FileTime::from_unix_time(before[0].mtime_ms / 1000 + 10, 0);
    filetime::set_file_mtime(&file, new_time).unwrap();

    let after = scanner.enumerate().unwrap();
    let diff = Scanner::diff(after, &stored);
    assert_eq!(diff.modified.len(), 1);
  }
}
