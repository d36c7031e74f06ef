//! Incremental on-disk cache of extraction results.
//!
//! One JSON document per project, keyed by absolute file path. An entry is
//! valid only while its stored mtime equals the file's current mtime.
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so readers never see a partial document.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::model::TestRecord;

/// Schema version; any other value is treated as corruption.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] io::Error),
    #[error("cache document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("unsupported cache schema version {found}")]
    VersionMismatch { found: u32 },
    #[error("failed to replace cache file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Cached extraction result for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Restored from the document key on load.
    #[serde(skip)]
    pub file_path: String,
    /// Modification time in nanoseconds since the Unix epoch.
    #[serde(rename = "mtime")]
    pub mtime_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub records: Vec<TestRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<ParseError>,
}

impl CacheEntry {
    /// Entry for a successfully parsed file.
    #[must_use]
    pub fn parsed(file_path: &str, mtime_ns: u64, hash: String, records: Vec<TestRecord>) -> Self {
        Self {
            file_path: file_path.to_string(),
            mtime_ns,
            content_hash: Some(hash),
            records,
            parse_error: None,
        }
    }

    /// Negative entry for a file that failed to parse.
    #[must_use]
    pub fn failed(file_path: &str, mtime_ns: u64, hash: Option<String>, error: ParseError) -> Self {
        Self {
            file_path: file_path.to_string(),
            mtime_ns,
            content_hash: hash,
            records: Vec::new(),
            parse_error: Some(error),
        }
    }

    /// The cached outcome as the extractor reports it.
    ///
    /// # Errors
    ///
    /// Returns the stored `ParseError` for negative entries.
    pub fn outcome(&self) -> Result<Vec<TestRecord>, ParseError> {
        match &self.parse_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.records.clone()),
        }
    }
}

#[derive(Serialize)]
struct CacheDocumentRef<'a> {
    version: u32,
    entries: BTreeMap<&'a str, &'a CacheEntry>,
}

#[derive(Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

/// In-memory view of the cache document.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
    dirty: bool,
}

impl CacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache document at `path`.
    ///
    /// Never fails: a missing, truncated, unparsable or version-mismatched
    /// document yields an empty store. Entries for files that no longer exist
    /// are dropped.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let mut store = match Self::read(path) {
            Ok(Some(store)) => store,
            Ok(None) => {
                debug!(path = %path.display(), "no cache file, starting empty");
                return Self::new();
            }
            Err(e) => {
                warn!(path = %path.display(), %e, "discarding unusable cache");
                // Rewritten on the next persist.
                return Self {
                    entries: HashMap::new(),
                    dirty: true,
                };
            }
        };

        let before = store.entries.len();
        store.entries.retain(|key, _| Path::new(key).exists());
        let pruned = before - store.entries.len();
        if pruned > 0 {
            debug!(pruned, "pruned cache entries for deleted files");
            store.dirty = true;
        }
        debug!(entries = store.entries.len(), "cache loaded");
        store
    }

    fn read(path: &Path) -> Result<Option<Self>, CacheError> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let document: CacheDocument = serde_json::from_reader(BufReader::new(file))?;
        if document.version != CACHE_VERSION {
            return Err(CacheError::VersionMismatch {
                found: document.version,
            });
        }

        let entries = document
            .entries
            .into_iter()
            .map(|(key, mut entry)| {
                entry.file_path.clone_from(&key);
                (key, entry)
            })
            .collect();
        Ok(Some(Self {
            entries,
            dirty: false,
        }))
    }

    /// Valid entry for `file`, or `None` if absent, unreadable, or stale.
    #[must_use]
    pub fn lookup(&self, file: &Path) -> Option<&CacheEntry> {
        let mtime = file_mtime_ns(file).ok()?;
        self.lookup_at(&cache_key(file), mtime)
    }

    /// Valid entry for `key` given an already-observed mtime.
    #[must_use]
    pub fn lookup_at(&self, key: &str, mtime_ns: u64) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|e| e.mtime_ns == mtime_ns)
    }

    /// Entry for `key` regardless of freshness (used for hash revalidation).
    #[must_use]
    pub fn get_any(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace the entry for `file`.
    pub fn update(&mut self, file: &Path, mut entry: CacheEntry) {
        let key = cache_key(file);
        entry.file_path.clone_from(&key);
        self.entries.insert(key, entry);
        self.dirty = true;
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.dirty = true;
        }
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the store changed since it was loaded or last persisted.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Atomically write the document to `path`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the directory cannot be created or the
    /// temporary file cannot be written or renamed into place.
    pub fn persist(&mut self, path: &Path) -> Result<(), CacheError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir)?;

        let document = CacheDocumentRef {
            version: CACHE_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &document)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;

        self.dirty = false;
        debug!(path = %path.display(), entries = self.entries.len(), "cache persisted");
        Ok(())
    }
}

/// Key under which `file` is stored: its absolute path.
#[must_use]
pub fn cache_key(file: &Path) -> String {
    std::path::absolute(file)
        .unwrap_or_else(|_| file.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Modification time of `file` in nanoseconds since the Unix epoch.
///
/// # Errors
///
/// Returns an error if the file cannot be stat'ed.
pub fn file_mtime_ns(file: &Path) -> io::Result<u64> {
    let modified = fs::metadata(file)?.modified()?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Hex SHA-256 of file contents.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    sha256_hex(bytes, 32)
}

/// Lowercase hex of the first `len` bytes of the SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write as _;
    let digest = Sha256::digest(bytes);
    let len = len.min(digest.len());
    digest[..len]
        .iter()
        .fold(String::with_capacity(len * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

// ─── Writer lock ────────────────────────────────────────────────────────────

/// Exclusive advisory lock on `<cache>.lock`, held across load-modify-persist.
///
/// Only one process may rewrite a cache document at a time. A process that
/// cannot take the lock still reads the document but must not persist it.
#[derive(Debug)]
pub struct CacheLock {
    file: fs::File,
    path: PathBuf,
}

impl CacheLock {
    /// Take the writer lock for the cache document at `cache_path` without
    /// waiting. Returns `Ok(None)` when another writer holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked for a
    /// reason other than contention.
    pub fn try_acquire(cache_path: &Path) -> io::Result<Option<Self>> {
        let path = lock_path(cache_path);
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(path = %path.display(), "cache writer lock acquired");
                Ok(Some(Self { file, path }))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                debug!(path = %path.display(), "cache writer lock held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), %e, "failed to release cache lock");
        }
    }
}

/// `<cache>.lock` next to the cache document.
fn lock_path(cache_path: &Path) -> PathBuf {
    let mut name = cache_path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".lock");
    cache_path.with_file_name(name)
}

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Per-pass cache effectiveness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Misses that were parsed (successfully or not).
    pub files_parsed: usize,
    /// Misses whose content hash still matched, so records were reused.
    pub files_revalidated: usize,
    pub parse_errors: usize,
}

impl CacheStats {
    /// Fraction of files served without parsing.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        (self.cache_hits + self.files_revalidated) as f64 / total as f64
    }

    #[must_use]
    pub const fn files_from_cache(&self) -> usize {
        self.cache_hits + self.files_revalidated
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files from cache, {} parsed ({:.1}% hit rate)",
            self.files_from_cache(),
            self.files_parsed,
            self.hit_rate() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::model::ItemKind;

    fn record(file: &str, name: &str) -> TestRecord {
        TestRecord {
            file_path: file.to_string(),
            qualified_name: name.to_string(),
            kind: ItemKind::Function,
            line_number: 3,
            markers: BTreeSet::new(),
            parent_class: None,
        }
    }

    fn write_source(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "def test_a():\n    pass\n").unwrap();
        path
    }

    fn entry_for(file: &Path) -> CacheEntry {
        let key = cache_key(file);
        CacheEntry::parsed(
            &key,
            file_mtime_ns(file).unwrap(),
            content_hash(b"x"),
            vec![record(&key, "test_a")],
        )
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::load(&dir.path().join("cache.json"));
        assert!(store.is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn roundtrip_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), "test_a.py");
        let cache_path = dir.path().join("nested").join("cache.json");

        let mut store = CacheStore::new();
        store.update(&source, entry_for(&source));
        store.persist(&cache_path).unwrap();
        assert!(!store.is_dirty());

        let loaded = CacheStore::load(&cache_path);
        assert_eq!(loaded.len(), 1);
        let entry = loaded.lookup(&source).unwrap();
        assert_eq!(entry.file_path, cache_key(&source));
        assert_eq!(entry.records, entry_for(&source).records);
    }

    #[test]
    fn stale_mtime_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), "test_a.py");
        let mut entry = entry_for(&source);
        entry.mtime_ns -= 1;

        let mut store = CacheStore::new();
        store.update(&source, entry);
        assert!(store.lookup(&source).is_none());
        assert!(store.get_any(&cache_key(&source)).is_some());
    }

    #[test]
    fn truncated_document_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        fs::write(&cache_path, r#"{"version": 1, "entries": {"/x": {"mti"#).unwrap();

        let store = CacheStore::load(&cache_path);
        assert!(store.is_empty());
        assert!(store.is_dirty());
    }

    #[test]
    fn version_mismatch_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), "test_a.py");
        let cache_path = dir.path().join("cache.json");
        let key = cache_key(&source);
        let doc = serde_json::json!({
            "version": 99,
            "entries": { key: { "mtime": 1, "records": [] } }
        });
        fs::write(&cache_path, doc.to_string()).unwrap();

        assert!(CacheStore::load(&cache_path).is_empty());
    }

    #[test]
    fn load_prunes_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept = write_source(dir.path(), "test_kept.py");
        let gone = write_source(dir.path(), "test_gone.py");
        let cache_path = dir.path().join("cache.json");

        let mut store = CacheStore::new();
        store.update(&kept, entry_for(&kept));
        store.update(&gone, entry_for(&gone));
        store.persist(&cache_path).unwrap();
        fs::remove_file(&gone).unwrap();

        let loaded = CacheStore::load(&cache_path);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.lookup(&kept).is_some());
        assert!(loaded.is_dirty());
    }

    #[test]
    fn persist_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        let mut store = CacheStore::new();
        store.persist(&cache_path).unwrap();
        store.persist(&cache_path).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("cache.json")]);
    }

    #[test]
    fn on_disk_schema_has_version_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), "test_a.py");
        let cache_path = dir.path().join("cache.json");
        let mut store = CacheStore::new();
        store.update(&source, entry_for(&source));
        store.persist(&cache_path).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&cache_path).unwrap()).unwrap();
        assert_eq!(doc["version"], CACHE_VERSION);
        let entry = &doc["entries"][cache_key(&source)];
        assert!(entry["mtime"].is_u64());
        assert!(entry["content_hash"].is_string());
        assert!(entry.get("file_path").is_none());
    }

    #[test]
    fn negative_entry_reports_parse_error() {
        let err = ParseError::Syntax {
            path: "/p/test_bad.py".to_string(),
            line: 2,
            column: 4,
        };
        let entry = CacheEntry::failed("/p/test_bad.py", 1, None, err.clone());
        assert_eq!(entry.outcome(), Err(err));
    }

    #[test]
    fn content_hash_is_hex_sha256() {
        let hash = content_hash(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn truncated_digest_keeps_leading_bytes() {
        let short = sha256_hex(b"abc", 8);
        assert_eq!(short, "ba7816bf8f01cfea");
        assert!(content_hash(b"abc").starts_with(&short));
        assert_eq!(sha256_hex(b"abc", 64).len(), 64);
    }

    #[test]
    fn writer_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("nested").join("cache.json");

        let held = CacheLock::try_acquire(&cache_path).unwrap();
        assert!(held.is_some());
        assert!(dir.path().join("nested").join("cache.json.lock").exists());
        assert!(CacheLock::try_acquire(&cache_path).unwrap().is_none());

        drop(held);
        assert!(CacheLock::try_acquire(&cache_path).unwrap().is_some());
    }

    #[test]
    fn cleared_store_persists_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path(), "test_a.py");
        let cache_path = dir.path().join("cache.json");
        let mut store = CacheStore::new();
        store.update(&source, entry_for(&source));
        store.persist(&cache_path).unwrap();

        let mut loaded = CacheStore::load(&cache_path);
        loaded.clear();
        assert!(loaded.is_dirty());
        loaded.persist(&cache_path).unwrap();
        assert!(CacheStore::load(&cache_path).is_empty());
    }

    #[test]
    fn stats_hit_rate_and_display() {
        let stats = CacheStats {
            cache_hits: 7,
            cache_misses: 3,
            files_parsed: 3,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.7).abs() < f64::EPSILON);
        assert_eq!(stats.to_string(), "7 files from cache, 3 parsed (70.0% hit rate)");
        assert!(CacheStats::default().hit_rate().abs() < f64::EPSILON);
    }
}
