//! Candidate file discovery.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use fastcollect_core::Config;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::ExtractError;

/// Compiled file-name filters for one collection root.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    python_files: GlobSet,
    norecurse: GlobSet,
}

impl FileMatcher {
    /// Compile the naming and ignore patterns from `config`.
    ///
    /// # Errors
    ///
    /// Returns `ExtractError::Pattern` for an invalid glob.
    pub fn new(config: &Config) -> Result<Self, ExtractError> {
        Ok(Self {
            python_files: build_set(&config.python_files)?,
            norecurse: build_set(&config.norecursedirs)?,
        })
    }

    /// Whether a file name looks like a test module.
    #[must_use]
    pub fn is_test_file(&self, name: &OsStr) -> bool {
        Path::new(name).extension().is_some_and(|ext| ext == "py") && self.python_files.is_match(name)
    }

    /// Whether a directory name must not be descended into.
    #[must_use]
    pub fn is_ignored_dir(&self, name: &OsStr) -> bool {
        self.norecurse.is_match(name)
    }

    /// Whether `path` is a test module the walk would visit under `root`.
    ///
    /// Host-facing "skip this file" predicate: checks the file name and every
    /// directory between `root` and the file.
    #[must_use]
    pub fn accepts(&self, root: &Path, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        if !self.is_test_file(name) {
            return false;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        relative
            .parent()
            .into_iter()
            .flat_map(Path::components)
            .all(|c| !self.is_ignored_dir(c.as_os_str()))
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, ExtractError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ExtractError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ExtractError::Pattern {
        pattern: patterns.join(" "),
        source,
    })
}

/// All candidate test files under `config.root`, sorted by path.
///
/// Unreadable directory entries are skipped.
///
/// # Errors
///
/// Returns `ExtractError::MissingRoot` if the root is not a directory, or
/// `ExtractError::Pattern` for an invalid glob.
pub fn candidate_files(config: &Config) -> Result<Vec<PathBuf>, ExtractError> {
    if !config.root.is_dir() {
        return Err(ExtractError::MissingRoot(config.root.clone()));
    }
    let matcher = FileMatcher::new(config)?;

    let files: Vec<PathBuf> = WalkDir::new(&config.root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        // The root itself is never pruned, even if its own name matches.
        .filter_entry(|e| {
            e.depth() == 0 || !e.file_type().is_dir() || !matcher.is_ignored_dir(e.file_name())
        })
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                trace!(%e, "skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && matcher.is_test_file(e.file_name()))
        .map(walkdir::DirEntry::into_path)
        .collect();

    debug!(root = %config.root.display(), files = files.len(), "discovered candidate files");
    Ok(files)
}
