//! Async daemon server.
//!
//! `Starting`: bind the per-root socket, write the pid file, run one cold
//! extraction. `Running`: accept sessions up to `max_sessions`, queue a few
//! more for `queue_timeout`, reject the rest. `Draining`: on `stop` or idle
//! timeout, close the listener and wait for in-flight sessions.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fastcollect_core::Config;
use fastcollect_extract::{ExtractError, extract_with_cache};
use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::tokio::Stream as LocalStream;
use interprocess::local_socket::traits::tokio::Listener as _;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::protocol::{
    Command, DaemonCodec, ErrorKind, MAX_REQUEST_BYTES, ProtocolError, Request, Response,
    ResponseData,
};
use crate::state::DaemonState;
use crate::transport;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Exit after this long without a new connection. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Deadline for serving one request once it has been read.
    pub request_timeout: Duration,
    /// How long an open session may sit without sending a request.
    pub session_idle_timeout: Duration,
    /// Sessions served concurrently.
    pub max_sessions: usize,
    /// Connections allowed to wait for a session slot.
    pub max_queued: usize,
    /// How long a queued connection waits before being rejected.
    pub queue_timeout: Duration,
    pub max_request_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            request_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(60),
            max_sessions: 10,
            max_queued: 32,
            queue_timeout: Duration::from_secs(5),
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon failed to start: {0}")]
    Startup(String),
    #[error("request rejected: {0}")]
    Security(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Releases the socket and this daemon's pid file when the daemon exits by
/// any path, including task abort.
struct RuntimeFiles {
    root: PathBuf,
}

impl Drop for RuntimeFiles {
    fn drop(&mut self) {
        transport::release_state(&self.root);
        debug!("runtime files released");
    }
}

struct Shared {
    state: DaemonState,
    config: DaemonConfig,
    shutdown: CancellationToken,
    sessions: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Run the daemon for `config.root` until `stop` or idle timeout.
///
/// # Errors
///
/// Returns `DaemonError::Startup` if another daemon is serving the root, the
/// socket cannot be bound, or the cold extraction fails. Nothing is left
/// behind on failure.
#[instrument(skip_all, fields(root = %config.root.display()))]
pub async fn run(config: Config, daemon_config: DaemonConfig) -> Result<(), DaemonError> {
    let root = config.root.clone();
    let check_root = root.clone();
    let running = tokio::task::spawn_blocking(move || {
        crate::client::probe(&check_root, Duration::from_millis(200))
    })
    .await
    .unwrap_or(false);
    if running {
        warn!("another daemon is already running");
        return Err(DaemonError::Startup(
            "another daemon is already running for this root".into(),
        ));
    }

    let listener = transport::bind_async(&root)
        .await
        .map_err(|e| DaemonError::Startup(format!("failed to bind socket: {e}")))?;
    let files = RuntimeFiles { root: root.clone() };
    transport::write_pid(&root)
        .map_err(|e| DaemonError::Startup(format!("failed to write pid file: {e}")))?;

    let extraction = cold_extract(&config)
        .await
        .map_err(|e| DaemonError::Startup(format!("initial extraction failed: {e}")))?;

    let shared = Arc::new(Shared {
        state: DaemonState::new(config, &extraction),
        sessions: Arc::new(Semaphore::new(daemon_config.max_sessions.max(1))),
        queued: AtomicUsize::new(0),
        shutdown: CancellationToken::new(),
        config: daemon_config,
    });
    info!(pid = std::process::id(), "daemon started");

    let tracker = TaskTracker::new();
    let mut deadline = shared.config.idle_timeout.map(|t| Instant::now() + t);

    loop {
        let idle = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(stream) => {
                        debug!("accepted connection");
                        admit(&shared, &tracker, stream);
                        deadline = shared.config.idle_timeout.map(|t| Instant::now() + t);
                    }
                    Err(e) => {
                        warn!(%e, "accept error");
                    }
                }
            }
            () = idle => {
                if shared.sessions.available_permits() < shared.config.max_sessions.max(1) {
                    deadline = shared.config.idle_timeout.map(|t| Instant::now() + t);
                    continue;
                }
                info!("idle timeout, shutting down");
                break;
            }
            () = shared.shutdown.cancelled() => {
                info!("stop requested, draining");
                break;
            }
        }
    }

    // Draining: no new connections, let in-flight sessions finish.
    drop(listener);
    shared.shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    drop(files);
    info!("daemon stopped");
    Ok(())
}

async fn cold_extract(config: &Config) -> Result<fastcollect_extract::Extraction, String> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || extract_with_cache(&config))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e: ExtractError| e.to_string())
}

/// Hand a connection to a session slot, the wait queue, or a rejection.
fn admit(shared: &Arc<Shared>, tracker: &TaskTracker, stream: LocalStream) {
    if let Ok(permit) = Arc::clone(&shared.sessions).try_acquire_owned() {
        tracker.spawn(run_session(Arc::clone(shared), stream, permit));
        return;
    }

    let queued = shared.queued.fetch_add(1, Ordering::AcqRel);
    if queued >= shared.config.max_queued {
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        shared.state.counters.rejected();
        debug!(queued, "session queue full, rejecting");
        tracker.spawn(reject(stream, "session queue full"));
        return;
    }

    let shared = Arc::clone(shared);
    tracker.spawn(async move {
        let sessions = Arc::clone(&shared.sessions);
        let waited = tokio::time::timeout(shared.config.queue_timeout, sessions.acquire_owned()).await;
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        match waited {
            Ok(Ok(permit)) => run_session(shared, stream, permit).await,
            Ok(Err(_)) => {}
            Err(_) => {
                shared.state.counters.rejected();
                debug!("timed out waiting for a session slot");
                reject(stream, "timed out waiting for a session slot").await;
            }
        }
    });
}

async fn reject(stream: LocalStream, reason: &'static str) {
    let mut framed = Framed::new(stream, DaemonCodec::default());
    let resp = Response::error(ErrorKind::Backpressure, format!("daemon busy: {reason}"));
    let _ = framed.send(resp).await;
}

/// Serve sequential requests on one connection until it closes, misbehaves,
/// or the daemon drains.
async fn run_session(shared: Arc<Shared>, stream: LocalStream, _permit: OwnedSemaphorePermit) {
    let mut framed = Framed::new(stream, DaemonCodec::new(shared.config.max_request_bytes));
    let idle = shared.config.session_idle_timeout;
    let timeout = shared.config.request_timeout;

    loop {
        let next = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            next = tokio::time::timeout(idle, framed.next()) => next,
        };

        let req = match next {
            Err(_) => {
                debug!("session idle too long, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(req))) => req,
            Ok(Some(Err(ProtocolError::Io(e)))) => {
                debug!(%e, "session read error");
                break;
            }
            Ok(Some(Err(e))) => {
                shared.state.counters.failed();
                let kind = match e {
                    ProtocolError::Oversized { .. } => ErrorKind::Security,
                    _ => ErrorKind::Protocol,
                };
                warn!(%e, "rejecting request");
                let _ = framed.send(Response::error(kind, e.to_string())).await;
                break;
            }
        };

        let started = Instant::now();
        let command = req.command;
        let (resp, keep_open) = match tokio::time::timeout(timeout, handle_request(&shared, req)).await
        {
            Ok(resp) => (resp, true),
            Err(_) => {
                warn!(?command, "request exceeded deadline");
                (
                    Response::error(ErrorKind::Timeout, "request exceeded processing deadline"),
                    false,
                )
            }
        };

        if resp.is_ok() {
            shared.state.counters.served();
        } else {
            shared.state.counters.failed();
        }
        let stopping = command == Command::Stop && resp.is_ok();
        let resp = resp.with_elapsed(started.elapsed().as_secs_f64());
        if let Err(e) = framed.send(resp).await {
            debug!(%e, "client went away before response");
            break;
        }
        if stopping {
            shared.shutdown.cancel();
            break;
        }
        if !keep_open {
            break;
        }
    }
}

#[instrument(skip_all, fields(command = ?req.command))]
async fn handle_request(shared: &Shared, req: Request) -> Response {
    let state = &shared.state;
    if req.command == Command::Unknown {
        return Response::error(ErrorKind::Protocol, "unknown command");
    }
    // Checked before any work, for every command including stop.
    if !state.root_matches(&req.root_path) {
        let e = DaemonError::Security(format!(
            "root_path {:?} does not match daemon root {}",
            req.root_path,
            state.root().display()
        ));
        warn!(%e, "rejecting request");
        return Response::error(ErrorKind::Security, e.to_string());
    }

    match req.command {
        Command::Collect => {
            let snapshot = state.snapshot();
            let filters = req.filters;
            let collected = tokio::task::spawn_blocking(move || snapshot.collect(&filters)).await;
            match collected {
                Ok(Ok(records)) => {
                    debug!(records = records.len(), "collect served");
                    Response::ok(Some(ResponseData::Records(records)))
                }
                Ok(Err(e)) => Response::error(ErrorKind::InvalidFilter, e.to_string()),
                Err(e) => Response::error(ErrorKind::Internal, e.to_string()),
            }
        }
        Command::Status => Response::ok(Some(ResponseData::Status(state.status()))),
        Command::Reload => reload(state).await,
        Command::Stop => {
            info!("stop command received");
            Response::ok(None)
        }
        Command::Unknown => Response::error(ErrorKind::Protocol, "unknown command"),
    }
}

async fn reload(state: &DaemonState) -> Response {
    let _gate = state.begin_reload().await;
    match cold_extract(state.config()).await {
        Ok(extraction) => {
            let snapshot = state.swap(&extraction);
            info!(generation = snapshot.generation, records = snapshot.records.len(), "reloaded");
            Response::ok(Some(ResponseData::Status(state.status())))
        }
        Err(e) => {
            warn!(%e, "reload failed, keeping previous snapshot");
            Response::error(ErrorKind::Internal, format!("reload failed: {e}"))
        }
    }
}
