//! Parallel static extraction of test records.
//!
//! Walks the project tree, parses candidate files on the rayon pool and
//! merges the results with the incremental cache.

pub mod python;
pub mod walk;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fastcollect_core::cache::{CacheLock, cache_key, content_hash, file_mtime_ns};
use fastcollect_core::{CacheEntry, CacheStats, CacheStore, Config, ParseError, TestRecord};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

pub use walk::{FileMatcher, candidate_files};

/// Outcome for a single file.
pub type FileResult = Result<Vec<TestRecord>, ParseError>;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("collection root {} is not a directory", .0.display())]
    MissingRoot(PathBuf),
    #[error("invalid file pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Result of one extraction pass.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Per-file outcomes, ordered by path.
    pub files: BTreeMap<PathBuf, FileResult>,
    pub stats: CacheStats,
}

impl Extraction {
    /// All records from successfully parsed files, in path then source order.
    #[must_use]
    pub fn records(&self) -> Vec<TestRecord> {
        self.files
            .values()
            .filter_map(|r| r.as_ref().ok())
            .flatten()
            .cloned()
            .collect()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ParseError> {
        self.files.values().filter_map(|r| r.as_ref().err())
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// How a file's outcome was obtained.
enum Work {
    /// Valid cache entry for the current mtime.
    Hit(FileResult),
    /// mtime changed but content hash matched a stored entry.
    Revalidated { entry: CacheEntry, mtime_ns: u64 },
    /// Parsed from source.
    Parsed {
        mtime_ns: u64,
        hash: String,
        result: FileResult,
    },
    /// Could not be read at all.
    Unreadable(ParseError),
}

/// Extract records from every candidate file under `config.root`.
///
/// With a cache, unchanged files are served from it and the store is
/// updated in place; persisting it is the caller's job. A file that fails to
/// parse yields an error for that file only.
///
/// # Errors
///
/// Returns `ExtractError` only if the tree cannot be walked at all.
#[instrument(skip_all, fields(root = %config.root.display()))]
pub fn extract(config: &Config, mut cache: Option<&mut CacheStore>) -> Result<Extraction, ExtractError> {
    let started = Instant::now();
    let files = candidate_files(config)?;

    let lookup = cache.as_deref();
    let work: Vec<(PathBuf, String, Work)> = files
        .into_par_iter()
        .map(|path| {
            let key = cache_key(&path);
            let work = process_file(&path, &key, config, lookup);
            (path, key, work)
        })
        .collect();

    let mut extraction = Extraction::default();
    let stats = &mut extraction.stats;
    for (path, key, work) in work {
        let result = match work {
            Work::Hit(result) => {
                stats.cache_hits += 1;
                result
            }
            Work::Revalidated { mut entry, mtime_ns } => {
                stats.cache_misses += 1;
                stats.files_revalidated += 1;
                let result = entry.outcome();
                entry.mtime_ns = mtime_ns;
                if let Some(store) = cache.as_deref_mut() {
                    store.update(&path, entry);
                }
                result
            }
            Work::Parsed {
                mtime_ns,
                hash,
                result,
            } => {
                stats.cache_misses += 1;
                stats.files_parsed += 1;
                if let Some(store) = cache.as_deref_mut() {
                    record_parse(store, &path, &key, mtime_ns, hash, &result);
                }
                result
            }
            Work::Unreadable(e) => {
                stats.cache_misses += 1;
                Err(e)
            }
        };
        if let Err(e) = &result {
            stats.parse_errors += 1;
            debug!(%e, "file skipped");
        }
        extraction.files.insert(path, result);
    }

    info!(
        files = extraction.files.len(),
        parsed = extraction.stats.files_parsed,
        hits = extraction.stats.cache_hits,
        errors = extraction.stats.parse_errors,
        elapsed_ms = started.elapsed().as_millis(),
        "extraction complete"
    );
    Ok(extraction)
}

fn process_file(path: &Path, key: &str, config: &Config, cache: Option<&CacheStore>) -> Work {
    let mtime_ns = match file_mtime_ns(path) {
        Ok(m) => m,
        Err(e) => return Work::Unreadable(read_error(key, &e)),
    };
    if let Some(entry) = cache.and_then(|c| c.lookup_at(key, mtime_ns)) {
        return Work::Hit(entry.outcome());
    }

    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) => return Work::Unreadable(read_error(key, &e)),
    };
    let hash = content_hash(&bytes);

    let previous = cache.and_then(|c| c.get_any(key));
    if let Some(entry) = previous.filter(|e| e.content_hash.as_deref() == Some(hash.as_str())) {
        return Work::Revalidated {
            entry: entry.clone(),
            mtime_ns,
        };
    }

    Work::Parsed {
        mtime_ns,
        result: python::extract_source(key, &bytes, config),
        hash,
    }
}

/// A failed parse only creates a negative entry when nothing was cached
/// before; an existing entry stays as-is and misses on the next run.
fn record_parse(
    store: &mut CacheStore,
    path: &Path,
    key: &str,
    mtime_ns: u64,
    hash: String,
    result: &FileResult,
) {
    match result {
        Ok(records) => store.update(path, CacheEntry::parsed(key, mtime_ns, hash, records.clone())),
        Err(e) if store.get_any(key).is_none() => {
            store.update(path, CacheEntry::failed(key, mtime_ns, Some(hash), e.clone()));
        }
        Err(_) => {}
    }
}

fn read_error(key: &str, e: &std::io::Error) -> ParseError {
    ParseError::Read {
        path: key.to_string(),
        message: e.to_string(),
    }
}

/// Extract records from a single file, bypassing the cache.
///
/// # Errors
///
/// Returns `ParseError` if the file cannot be read or parsed.
pub fn extract_file(config: &Config, path: &Path) -> FileResult {
    let key = cache_key(path);
    let bytes = fs::read(path).map_err(|e| read_error(&key, &e))?;
    python::extract_source(&key, &bytes, config)
}

/// Load the configured cache, extract, and persist the updated cache.
///
/// Without `config.use_cache` this is a plain uncached pass. The document is
/// rewritten only while holding its [`CacheLock`]; when another process
/// holds it the pass still reads the cache but leaves the file untouched.
/// Failure to persist is logged and otherwise ignored.
///
/// # Errors
///
/// Returns `ExtractError` if the tree cannot be walked.
pub fn extract_with_cache(config: &Config) -> Result<Extraction, ExtractError> {
    if !config.use_cache {
        return extract(config, None);
    }
    let cache_path = config.cache_file();
    let lock = match CacheLock::try_acquire(&cache_path) {
        Ok(lock) => lock,
        Err(e) => {
            debug!(path = %cache_path.display(), %e, "cache lock unavailable");
            None
        }
    };
    let mut store = CacheStore::load(&cache_path);
    let extraction = extract(config, Some(&mut store))?;
    if lock.is_none() {
        debug!(path = %cache_path.display(), "cache owned by another writer, not persisting");
    } else if store.is_dirty() {
        if let Err(e) = store.persist(&cache_path) {
            warn!(path = %cache_path.display(), %e, "failed to persist cache");
        }
    }
    Ok(extraction)
}
