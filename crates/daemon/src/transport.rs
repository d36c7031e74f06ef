//! IPC transport layer for daemon communication.
//!
//! Every project root gets its own socket, pid file and log file, named after
//! a hash of the normalized root path.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fastcollect_core::cache::sha256_hex;
use fastcollect_core::normalize_path;
use interprocess::local_socket::{GenericFilePath, ListenerOptions, prelude::*};

/// Env override for the runtime directory (used by tests).
pub const RUNTIME_DIR_ENV: &str = "FASTCOLLECT_RUNTIME_DIR";

/// Digest bytes of the root hash used in file names.
const ROOT_HASH_BYTES: usize = 8;

/// How long `bind_async` waits to learn whether an existing socket is served.
#[cfg(unix)]
const LIVENESS_TIMEOUT: Duration = Duration::from_millis(200);

/// Returns the per-user runtime directory, creating it with mode 0700.
///
/// `$FASTCOLLECT_RUNTIME_DIR`, else `$XDG_RUNTIME_DIR/fastcollect`, else
/// `<tmp>/fastcollect-<user>`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn runtime_dir() -> io::Result<PathBuf> {
    let dir = if let Some(dir) = std::env::var_os(RUNTIME_DIR_ENV) {
        PathBuf::from(dir)
    } else if let Some(dir) = dirs::runtime_dir() {
        dir.join("fastcollect")
    } else {
        std::env::temp_dir().join(format!("fastcollect-{}", user_name()))
    };
    create_private_dir(&dir)?;
    Ok(dir)
}

fn user_name() -> String {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .find_map(|k| std::env::var(k).ok())
        .filter(|u| !u.is_empty() && u.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)))
        .unwrap_or_else(|| "user".to_string())
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Stable short hash of the normalized project root.
#[must_use]
pub fn root_hash(root: &Path) -> String {
    let normalized = normalize_path(root);
    sha256_hex(normalized.to_string_lossy().as_bytes(), ROOT_HASH_BYTES)
}

fn runtime_file(root: &Path, extension: &str) -> io::Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("fastcollect-{}.{extension}", root_hash(root))))
}

/// # Errors
///
/// Returns an error if the runtime directory cannot be created.
pub fn socket_path(root: &Path) -> io::Result<PathBuf> {
    runtime_file(root, "sock")
}

/// # Errors
///
/// Returns an error if the runtime directory cannot be created.
pub fn pid_file_path(root: &Path) -> io::Result<PathBuf> {
    runtime_file(root, "pid")
}

/// Where a background daemon's stderr goes.
///
/// # Errors
///
/// Returns an error if the runtime directory cannot be created.
pub fn log_file_path(root: &Path) -> io::Result<PathBuf> {
    runtime_file(root, "log")
}

/// Check if the daemon socket file for `root` exists on disk.
#[must_use]
pub fn socket_exists(root: &Path) -> bool {
    socket_path(root).is_ok_and(|p| p.exists())
}

fn socket_name(root: &Path) -> io::Result<interprocess::local_socket::Name<'static>> {
    // Always use filesystem path for reliable cleanup across all platforms.
    socket_path(root)?
        .to_fs_name::<GenericFilePath>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Pid recorded in the pid file for `root`, if any.
#[must_use]
pub fn read_pid(root: &Path) -> Option<u32> {
    let path = pid_file_path(root).ok()?;
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Record the current process as the daemon for `root`.
///
/// # Errors
///
/// Returns an error if the pid file cannot be written.
pub fn write_pid(root: &Path) -> io::Result<PathBuf> {
    let path = pid_file_path(root)?;
    std::fs::write(&path, std::process::id().to_string())?;
    Ok(path)
}

// ─── Stale state cleanup ─────────────────────────────────────────────────────

/// Check if a process with the given PID is alive.
#[cfg(unix)]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    unsafe extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid == 0 {
        return false;
    }
    // SAFETY: kill with signal 0 checks process existence without sending a signal.
    unsafe { kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
#[must_use]
pub fn is_process_alive(_pid: u32) -> bool {
    // Cannot verify on non-Unix; assume alive to avoid accidental cleanup.
    true
}

/// Remove stale daemon state (pid file and socket) for `root` if the recorded
/// process is no longer alive. Returns whether anything was removed.
pub fn cleanup_stale_state(root: &Path) -> bool {
    let Ok(pid_path) = pid_file_path(root) else {
        return false;
    };
    let mut removed = false;

    if let Ok(pid_str) = std::fs::read_to_string(&pid_path) {
        match pid_str.trim().parse::<u32>() {
            Ok(pid) if is_process_alive(pid) => return false,
            Ok(pid) => {
                tracing::info!(pid, "removing stale daemon state (process not alive)");
            }
            Err(_) => {
                tracing::info!("removing corrupt daemon pid file");
            }
        }
        removed |= std::fs::remove_file(&pid_path).is_ok();
    }

    // Clean up orphaned socket even if pid file was missing
    if let Ok(sock) = socket_path(root) {
        if sock.exists() {
            tracing::info!(path = %sock.display(), "removing stale socket");
            removed |= std::fs::remove_file(&sock).is_ok();
        }
    }
    removed
}

/// Remove the runtime files of the daemon in this process for `root`.
///
/// The socket is always removed; the pid file only while it still names this
/// process, so a successor's pid file survives.
pub fn release_state(root: &Path) {
    if let Ok(sock) = socket_path(root) {
        let _ = std::fs::remove_file(sock);
    }
    if read_pid(root) == Some(std::process::id()) {
        if let Ok(pid) = pid_file_path(root) {
            let _ = std::fs::remove_file(pid);
        }
    }
}

// ─── Async listener (for daemon server) ──────────────────────────────────────

/// Create an async tokio listener for the daemon serving `root`. The socket
/// file is restricted to the owning user.
///
/// An existing socket file is replaced only when nothing accepts on it.
///
/// # Errors
///
/// Returns `AddrInUse` if a live daemon is serving the socket, or another
/// error if the socket cannot be created.
pub async fn bind_async(root: &Path) -> io::Result<interprocess::local_socket::tokio::Listener> {
    let sock_path = socket_path(root)?;
    if sock_path.exists() {
        if socket_is_served(&sock_path).await {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is served by a live daemon", sock_path.display()),
            ));
        }
        cleanup_stale_state(root);
        // Left behind when the recorded pid is alive but no longer listening.
        match std::fs::remove_file(&sock_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => tracing::debug!(path = %sock_path.display(), "replaced unserved socket"),
        }
    }

    let name = socket_name(root)?;
    let listener = ListenerOptions::new().name(name).create_tokio()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(listener)
}

/// Whether some process accepts (or queues) connections on `path`.
#[cfg(unix)]
async fn socket_is_served(path: &Path) -> bool {
    match tokio::time::timeout(LIVENESS_TIMEOUT, tokio::net::UnixStream::connect(path)).await {
        Ok(Ok(_)) | Err(_) => true,
        Ok(Err(e)) => e.kind() == io::ErrorKind::WouldBlock,
    }
}

#[cfg(not(unix))]
async fn socket_is_served(_path: &Path) -> bool {
    false
}

// ─── Sync stream (for daemon client) ────────────────────────────────────────

pub struct Stream {
    #[cfg(unix)]
    inner: std::os::unix::net::UnixStream,
    #[cfg(not(unix))]
    inner: interprocess::local_socket::Stream,
}

impl Stream {
    /// Connect to the daemon for `root`. Connecting, reading and writing each
    /// fail with `TimedOut` (or `WouldBlock`) after `timeout`.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established in time.
    pub fn connect(root: &Path, timeout: Duration) -> io::Result<Self> {
        #[cfg(unix)]
        let inner = connect_bounded(&socket_path(root)?, timeout)?;
        #[cfg(not(unix))]
        let inner = interprocess::local_socket::Stream::connect(socket_name(root)?)?;

        let stream = Self { inner };
        stream.set_timeout(timeout)?;
        Ok(stream)
    }

    /// Change the read and write timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket rejects the timeout.
    pub fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.inner.set_read_timeout(Some(timeout))?;
            self.inner.set_write_timeout(Some(timeout))
        }
        #[cfg(not(unix))]
        {
            self.inner.set_recv_timeout(Some(timeout))?;
            self.inner.set_send_timeout(Some(timeout))
        }
    }
}

/// Connect to `path`, giving up with `TimedOut` once `timeout` elapses.
///
/// A blocking connect to a listener that never accepts hangs once the
/// backlog is full, so the connect runs nonblocking against a timer.
#[cfg(unix)]
fn connect_bounded(path: &Path, timeout: Duration) -> io::Result<std::os::unix::net::UnixStream> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let stream = rt.block_on(async {
        tokio::time::timeout(timeout, connect_retrying(path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??
            .into_std()
    })?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

#[cfg(unix)]
async fn connect_retrying(path: &Path) -> io::Result<tokio::net::UnixStream> {
    loop {
        match tokio::net::UnixStream::connect(path).await {
            // Linux reports a full backlog as EAGAIN on a nonblocking connect.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            result => return result,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_util::EnvGuard;

    #[test]
    fn runtime_dir_respects_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        assert_eq!(runtime_dir().unwrap(), dir.path().to_path_buf());
    }

    #[test]
    #[cfg(unix)]
    fn runtime_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("rt");
        let _guard = EnvGuard::new(&runtime);
        runtime_dir().unwrap();
        let mode = std::fs::metadata(&runtime).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn paths_are_stable_per_root() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        assert_eq!(socket_path(&a).unwrap(), socket_path(&a.join(".")).unwrap());
        assert_ne!(socket_path(&a).unwrap(), socket_path(&b).unwrap());
        assert_eq!(root_hash(&a).len(), ROOT_HASH_BYTES * 2);
        let name = pid_file_path(&a).unwrap();
        assert!(name.to_string_lossy().ends_with(".pid"));
    }

    #[test]
    fn connect_fails_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        assert!(Stream::connect(dir.path(), Duration::from_millis(50)).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn cleanup_removes_dead_daemon_state() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        let root = dir.path();

        // Max pid values are never live.
        std::fs::write(pid_file_path(root).unwrap(), "2147483646").unwrap();
        std::fs::write(socket_path(root).unwrap(), "").unwrap();

        assert!(cleanup_stale_state(root));
        assert!(!socket_exists(root));
        assert!(read_pid(root).is_none());
    }

    #[test]
    fn cleanup_keeps_live_daemon_state() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        let root = dir.path();

        write_pid(root).unwrap();
        std::fs::write(socket_path(root).unwrap(), "").unwrap();

        assert!(!cleanup_stale_state(root));
        assert!(socket_exists(root));
        assert_eq!(read_pid(root), Some(std::process::id()));
    }

    #[test]
    fn release_keeps_successor_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        let root = dir.path();

        std::fs::write(pid_file_path(root).unwrap(), "2147483646").unwrap();
        std::fs::write(socket_path(root).unwrap(), "").unwrap();
        release_state(root);
        assert!(!socket_exists(root));
        assert_eq!(read_pid(root), Some(2_147_483_646));

        write_pid(root).unwrap();
        release_state(root);
        assert!(read_pid(root).is_none());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn bind_refuses_socket_served_by_live_listener() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        let root = dir.path();

        let live = bind_async(root).await.unwrap();
        write_pid(root).unwrap();
        let err = bind_async(root).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(socket_exists(root));
        assert_eq!(read_pid(root), Some(std::process::id()));

        // Unserved socket file: replaced even though the recorded pid is alive.
        drop(live);
        let _ = std::fs::remove_file(socket_path(root).unwrap());
        std::fs::write(socket_path(root).unwrap(), "").unwrap();
        let _rebound = bind_async(root).await.unwrap();
        assert!(socket_exists(root));
    }
}
