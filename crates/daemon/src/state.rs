//! Resident daemon state.
//!
//! Records live in an immutable [`Snapshot`] behind a single handle. `collect`
//! clones the handle; `reload` builds a whole new snapshot and swaps the
//! handle, so a request sees either the old or the new set, never a mix.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fastcollect_core::{
    CacheStats, Config, FilterError, Filters, TestRecord, normalize_path, select,
};
use fastcollect_extract::Extraction;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::protocol::StatusInfo;

/// One complete extraction result.
#[derive(Debug)]
pub struct Snapshot {
    pub records: Vec<TestRecord>,
    pub file_count: usize,
    pub parse_errors: usize,
    pub stats: CacheStats,
    pub generation: u64,
    pub loaded_at: Instant,
}

impl Snapshot {
    fn from_extraction(extraction: &Extraction, generation: u64) -> Self {
        Self {
            records: extraction.records(),
            file_count: extraction.file_count(),
            parse_errors: extraction.stats.parse_errors,
            stats: extraction.stats,
            generation,
            loaded_at: Instant::now(),
        }
    }

    /// Records matching `filters`, in snapshot order.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if a filter string does not parse.
    pub fn collect(&self, filters: &Filters) -> Result<Vec<TestRecord>, FilterError> {
        let expression = filters.compile()?;
        Ok(select(&self.records, expression.as_ref()))
    }
}

#[derive(Debug, Default)]
pub struct HealthCounters {
    pub requests_served: AtomicU64,
    pub requests_failed: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub reloads: AtomicU64,
}

impl HealthCounters {
    pub fn served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct DaemonState {
    pid: u32,
    started: Instant,
    config: Config,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes reloads; readers never take it.
    reload_gate: tokio::sync::Mutex<()>,
    pub counters: HealthCounters,
}

impl DaemonState {
    #[must_use]
    pub fn new(config: Config, extraction: &Extraction) -> Self {
        let snapshot = Snapshot::from_extraction(extraction, 0);
        info!(
            records = snapshot.records.len(),
            files = snapshot.file_count,
            "initial snapshot loaded"
        );
        Self {
            pid: std::process::id(),
            started: Instant::now(),
            config,
            snapshot: RwLock::new(Arc::new(snapshot)),
            reload_gate: tokio::sync::Mutex::new(()),
            counters: HealthCounters::default(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Current snapshot. Holding it keeps that generation alive.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Replace the snapshot with a new extraction result.
    pub fn swap(&self, extraction: &Extraction) -> Arc<Snapshot> {
        let mut guard = self.snapshot.write();
        let next = Arc::new(Snapshot::from_extraction(extraction, guard.generation + 1));
        *guard = Arc::clone(&next);
        drop(guard);
        self.counters.reloads.fetch_add(1, Ordering::Relaxed);
        debug!(generation = next.generation, records = next.records.len(), "snapshot swapped");
        next
    }

    /// Guard held for the duration of one reload.
    pub async fn begin_reload(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.reload_gate.lock().await
    }

    /// Whether a client-supplied root names this daemon's project.
    #[must_use]
    pub fn root_matches(&self, root_path: &str) -> bool {
        !root_path.is_empty() && normalize_path(Path::new(root_path)) == self.config.root
    }

    #[must_use]
    pub fn status(&self) -> StatusInfo {
        let snapshot = self.snapshot();
        StatusInfo {
            pid: self.pid,
            project_root: self.config.root.to_string_lossy().into_owned(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            record_count: snapshot.records.len(),
            file_count: snapshot.file_count,
            memory_bytes: resident_memory_bytes(),
            generation: snapshot.generation,
            requests_served: self.counters.requests_served.load(Ordering::Relaxed),
            requests_failed: self.counters.requests_failed.load(Ordering::Relaxed),
            connections_rejected: self.counters.connections_rejected.load(Ordering::Relaxed),
            reloads: self.counters.reloads.load(Ordering::Relaxed),
        }
    }
}

/// Approximate resident set size of this process.
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(not(target_os = "linux"))]
const fn resident_memory_bytes() -> Option<u64> {
    None
}
