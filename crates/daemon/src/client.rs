//! Daemon client for IPC communication.
//!
//! Blocking: the host calls it from synchronous collection hooks.
//! Every failure is typed so the caller can fall back to local extraction.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command as Process, Stdio};
use std::time::{Duration, Instant};

use fastcollect_core::{Filters, TestRecord, normalize_path};
use tracing::{debug, info, instrument, trace};

use crate::protocol::{self, Command, ErrorKind, ProtocolError, Request, Response, ResponseData, StatusInfo};
use crate::transport::{self, Stream};

/// Env override for the executable spawned by [`start_background`].
pub const DAEMON_EXE_ENV: &str = "FASTCOLLECT_DAEMON_EXE";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connect and liveness-probe deadline.
    pub connect_timeout: Duration,
    /// Deadline for one request/response exchange.
    pub request_timeout: Duration,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_ceiling: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.backoff_ceiling)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon not reachable: {0}")]
    Connection(#[source] io::Error),
    #[error("daemon did not answer within {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("daemon returned an error: {message}")]
    Daemon {
        kind: Option<ErrorKind>,
        message: String,
    },
    #[error("failed to spawn daemon: {0}")]
    Spawn(String),
}

impl ClientError {
    /// Worth retrying: the daemon exists but was busy, slow, or dropped us.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::Interrupted
            ),
            Self::Timeout(_) => true,
            Self::Protocol(e) => e.is_transient(),
            Self::Daemon { kind, .. } => *kind == Some(ErrorKind::Backpressure),
            Self::Spawn(_) => false,
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Client bound to one project root.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    root: PathBuf,
    config: ClientConfig,
}

impl DaemonClient {
    #[must_use]
    pub fn new(root: &Path, config: ClientConfig) -> Self {
        Self {
            root: normalize_path(root),
            config,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Liveness probe; any failure means "not running".
    #[must_use]
    pub fn is_running(&self) -> bool {
        probe(&self.root, self.config.connect_timeout)
    }

    /// Records matching `filters`, as the daemon currently sees them.
    ///
    /// # Errors
    ///
    /// Returns `ClientError` once retries are exhausted or on a non-transient failure.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub fn request(&self, filters: &Filters) -> Result<Vec<TestRecord>, ClientError> {
        let req = Request::collect(&self.root_str(), filters.clone());
        match self.call(&req)?.data {
            Some(ResponseData::Records(records)) => Ok(records),
            None => Ok(Vec::new()),
            Some(ResponseData::Status(_)) => Err(unexpected("collect")),
        }
    }

    /// # Errors
    ///
    /// Returns `ClientError` if the daemon cannot be reached or answers with an error.
    pub fn status(&self) -> Result<StatusInfo, ClientError> {
        let req = Request::new(Command::Status, &self.root_str());
        status_payload(self.call(&req)?)
    }

    /// Ask the daemon to re-extract and swap its snapshot. Not retried: a
    /// reload that missed the deadline may still be running on the daemon.
    ///
    /// # Errors
    ///
    /// Returns `ClientError` if the daemon cannot be reached, the reload
    /// fails, or no answer arrives within `request_timeout`.
    pub fn reload(&self) -> Result<StatusInfo, ClientError> {
        let req = Request::new(Command::Reload, &self.root_str());
        status_payload(self.call_once(&req)?)
    }

    /// Ask the daemon to drain and exit. Not retried.
    ///
    /// # Errors
    ///
    /// Returns `ClientError` if the daemon cannot be reached or refuses.
    pub fn stop(&self) -> Result<(), ClientError> {
        let req = Request::new(Command::Stop, &self.root_str());
        self.call_once(&req).map(|_| ())
    }

    fn root_str(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    /// One request with retries on transient failures.
    fn call(&self, req: &Request) -> Result<Response, ClientError> {
        let mut attempt = 0;
        loop {
            match self.call_once(req) {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    debug!(%e, attempt, ?delay, "transient daemon failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    debug!(%e, attempt, "daemon request failed");
                    return Err(e);
                }
            }
        }
    }

    fn call_once(&self, req: &Request) -> Result<Response, ClientError> {
        let started = Instant::now();
        let mut stream = Stream::connect(&self.root, self.config.connect_timeout).map_err(|e| {
            if is_timeout(&e) {
                ClientError::Timeout(self.config.connect_timeout)
            } else {
                ClientError::Connection(e)
            }
        })?;
        stream
            .set_timeout(self.config.request_timeout)
            .map_err(ClientError::Connection)?;

        let exchange = protocol::write_request(&mut stream, req)
            .and_then(|()| protocol::read_response(&mut stream));
        let resp = match exchange {
            Ok(resp) => resp,
            Err(ProtocolError::Io(e)) if is_timeout(&e) => {
                return Err(ClientError::Timeout(self.config.request_timeout));
            }
            Err(e) => return Err(e.into()),
        };
        trace!(
            command = ?req.command,
            elapsed_ms = started.elapsed().as_millis(),
            server_seconds = resp.timing.elapsed_seconds,
            "daemon answered"
        );

        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(ClientError::Daemon {
                kind: resp.error_kind,
                message: resp.error_message.unwrap_or_else(|| "unspecified error".into()),
            })
        }
    }
}

fn status_payload(resp: Response) -> Result<StatusInfo, ClientError> {
    match resp.data {
        Some(ResponseData::Status(status)) => Ok(status),
        _ => Err(unexpected("status")),
    }
}

fn unexpected(command: &str) -> ClientError {
    ClientError::Daemon {
        kind: Some(ErrorKind::Protocol),
        message: format!("unexpected payload in {command} response"),
    }
}

/// Check if a daemon for `root` answers a `status` request within `timeout`.
#[must_use]
pub fn probe(root: &Path, timeout: Duration) -> bool {
    trace!("checking if daemon is running");
    let root = normalize_path(root);
    let Ok(mut stream) = Stream::connect(&root, timeout) else {
        trace!("daemon not running (connection failed)");
        return false;
    };

    let req = Request::new(Command::Status, &root.to_string_lossy());
    if protocol::write_request(&mut stream, &req).is_err() {
        trace!("daemon not running (write failed)");
        return false;
    }

    let running = protocol::read_response(&mut stream).is_ok_and(|r| r.is_ok());
    trace!(running, "daemon running check complete");
    running
}

fn daemon_executable() -> Result<PathBuf, ClientError> {
    if let Some(exe) = std::env::var_os(DAEMON_EXE_ENV) {
        return Ok(PathBuf::from(exe));
    }
    std::env::current_exe()
        .map_err(|e| ClientError::Spawn(format!("failed to resolve executable: {e}")))
}

/// Spawn a detached daemon for `root` and return without waiting for it.
///
/// `seed_cache` points the daemon's cold extraction at an existing cache
/// document so it starts warm. Stale state from a dead daemon is removed
/// first. The daemon's stderr goes to the per-root log file.
///
/// # Errors
///
/// Returns `ClientError::Spawn` if the executable cannot be resolved or the
/// process fails to spawn.
pub fn start_background(root: &Path, seed_cache: Option<&Path>) -> Result<(), ClientError> {
    let root = normalize_path(root);
    transport::cleanup_stale_state(&root);

    let exe = daemon_executable()?;
    let mut cmd = Process::new(&exe);
    cmd.arg("--root").arg(&root);
    if let Some(seed) = seed_cache {
        cmd.arg("--cache-path").arg(seed);
    }
    cmd.arg("serve");

    let stderr = transport::log_file_path(&root)
        .and_then(|path| std::fs::OpenOptions::new().create(true).append(true).open(path))
        .map_or_else(|_| Stdio::null(), Stdio::from);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(stderr);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group: terminal signals aimed at the caller do not reach it.
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .map_err(|e| ClientError::Spawn(format!("failed to spawn {}: {e}", exe.display())))?;
    info!(pid = child.id(), root = %root.display(), "daemon spawned");
    Ok(())
}

const BACKOFF_MS: [u64; 8] = [50, 100, 200, 300, 500, 1000, 2000, 3000];

/// Poll until a daemon for `root` answers, for at most `timeout`.
#[must_use]
pub fn wait_until_running(root: &Path, timeout: Duration) -> bool {
    let started = Instant::now();
    for delay_ms in BACKOFF_MS {
        if probe(root, Duration::from_millis(200)) {
            return true;
        }
        if started.elapsed() >= timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(delay_ms).min(timeout.saturating_sub(started.elapsed())));
    }
    probe(root, Duration::from_millis(200))
}
