//! Host-facing collection API.
//!
//! Asks the project's daemon first and falls back to local extraction on any
//! daemon failure. The daemon is an optimization only: both paths return the
//! same records for the same tree and filters.

use std::fmt;
use std::path::Path;

use fastcollect_core::{
    CacheStats, Config, FilterError, Filters, ParseError, TestRecord, normalize_path, select,
};
use fastcollect_daemon::{ClientConfig, ClientError, DaemonClient};
use fastcollect_extract::{ExtractError, FileMatcher, FileResult, extract_file, extract_with_cache};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Where a collection result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Daemon,
    Local,
}

#[derive(Debug, Clone)]
pub struct CollectOutcome {
    pub records: Vec<TestRecord>,
    pub source: Source,
    /// Cache statistics of the local pass; `None` when the daemon answered.
    pub stats: Option<CacheStats>,
    /// Files that failed to parse during the local pass.
    pub parse_errors: Vec<ParseError>,
}

impl CollectOutcome {
    /// One informational line describing how records were obtained.
    #[must_use]
    pub fn status_line(&self) -> String {
        match (self.source, &self.stats) {
            (Source::Daemon, _) => format!("fastcollect: {} items from daemon", self.records.len()),
            (Source::Local, Some(stats)) => format!("fastcollect: {stats}"),
            (Source::Local, None) => format!("fastcollect: {} items collected", self.records.len()),
        }
    }
}

impl fmt::Display for CollectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_line())
    }
}

/// Collection entry point for one project root.
#[derive(Debug)]
pub struct Collector {
    config: Config,
    client: DaemonClient,
    matcher: FileMatcher,
}

impl Collector {
    /// # Errors
    ///
    /// Returns `HostError::Extract` if a configured file pattern is invalid.
    pub fn new(config: Config) -> Result<Self, HostError> {
        Self::with_client_config(config, ClientConfig::default())
    }

    /// # Errors
    ///
    /// Returns `HostError::Extract` if a configured file pattern is invalid.
    pub fn with_client_config(config: Config, client_config: ClientConfig) -> Result<Self, HostError> {
        let matcher = FileMatcher::new(&config)?;
        let client = DaemonClient::new(&config.root, client_config);
        Ok(Self {
            config,
            client,
            matcher,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn client(&self) -> &DaemonClient {
        &self.client
    }

    /// Records matching `filters`, from the daemon when one answers and
    /// from a local extraction otherwise.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Filter` for an unparseable filter and
    /// `HostError::Extract` if the local pass cannot walk the root. Daemon
    /// failures are never returned.
    #[instrument(skip_all, fields(root = %self.config.root.display()))]
    pub fn collect(&self, filters: &Filters) -> Result<CollectOutcome, HostError> {
        // Invalid filters fail the same way on both paths; check before any IPC.
        filters.compile()?;

        if self.config.use_daemon {
            match self.client.request(filters) {
                Ok(records) => {
                    info!(records = records.len(), "collected via daemon");
                    return Ok(CollectOutcome {
                        records,
                        source: Source::Daemon,
                        stats: None,
                        parse_errors: Vec::new(),
                    });
                }
                Err(e) => self.report_fallback(&e),
            }
        }

        let outcome = self.collect_local(filters)?;
        if self.config.use_daemon && self.config.auto_start_daemon {
            self.spawn_daemon();
        }
        Ok(outcome)
    }

    /// Extract and filter in-process, using the on-disk cache when enabled.
    ///
    /// # Errors
    ///
    /// Same as [`Collector::collect`].
    pub fn collect_local(&self, filters: &Filters) -> Result<CollectOutcome, HostError> {
        let expression = filters.compile()?;
        let extraction = extract_with_cache(&self.config)?;
        let records = select(&extraction.records(), expression.as_ref());
        debug!(records = records.len(), stats = %extraction.stats, "collected locally");
        Ok(CollectOutcome {
            records,
            source: Source::Local,
            stats: Some(extraction.stats),
            parse_errors: extraction.errors().cloned().collect(),
        })
    }

    /// Whether the host should skip `path` as a collection candidate.
    #[must_use]
    pub fn should_skip(&self, path: &Path) -> bool {
        !self.matcher.accepts(&self.config.root, &normalize_path(path))
    }

    /// Records in a single file, parsed directly.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if the file cannot be read or parsed.
    pub fn list_file(&self, path: &Path) -> FileResult {
        extract_file(&self.config, path)
    }

    fn report_fallback(&self, e: &ClientError) {
        if self.config.verbose {
            warn!(%e, "daemon unavailable, collecting locally");
        } else {
            debug!(%e, "daemon unavailable, collecting locally");
        }
    }

    fn spawn_daemon(&self) {
        if self.client.is_running() {
            return;
        }
        let seed = self.config.use_cache.then(|| self.config.cache_file());
        if let Err(e) = fastcollect_daemon::start_background(&self.config.root, seed.as_deref()) {
            debug!(%e, "background daemon not started");
        }
    }
}
