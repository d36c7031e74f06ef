use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fastcollect_core::{Config, Filters, TestRecord};
use fastcollect_daemon::protocol::{self, Command, ErrorKind, Request};
use fastcollect_daemon::transport::{self, Stream};
use fastcollect_daemon::{ClientConfig, ClientError, DaemonClient, DaemonConfig, DaemonError};
use tokio::task::JoinHandle;

type DaemonHandle = JoinHandle<Result<(), DaemonError>>;

fn write_project(root: &Path) {
    std::fs::write(
        root.join("test_one.py"),
        "import pytest\n\ndef test_a():\n    pass\n\n@pytest.mark.slow\ndef test_b():\n    pass\n",
    )
    .unwrap();
    std::fs::write(root.join("test_two.py"), "def helper():\n    pass\n").unwrap();
    std::fs::write(root.join("test_six.py"), "import os\n").unwrap();
}

fn test_config() -> DaemonConfig {
    DaemonConfig {
        idle_timeout: Some(Duration::from_secs(60)),
        request_timeout: Duration::from_secs(5),
        ..DaemonConfig::default()
    }
}

/// Many small modules so an uncached extraction takes measurable time.
fn write_large_tree(root: &Path, files: usize) {
    for i in 0..files {
        let body: String = (0..30)
            .map(|j| format!("def test_case_{i}_{j}():\n    assert {j} == {j}\n\n"))
            .collect();
        std::fs::write(root.join(format!("test_gen_{i:04}.py")), body).unwrap();
    }
}

async fn start_daemon_with(root: &Path, daemon_config: DaemonConfig) -> DaemonHandle {
    start_daemon_for(Config::for_root(root), daemon_config).await
}

async fn start_daemon_for(config: Config, daemon_config: DaemonConfig) -> DaemonHandle {
    let root = config.root.clone();
    let handle = tokio::spawn(fastcollect_daemon::run(config, daemon_config));

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let r = root.clone();
        let ready = tokio::task::spawn_blocking(move || {
            fastcollect_daemon::probe(&r, Duration::from_millis(200))
        })
        .await
        .unwrap();
        if ready {
            return handle;
        }
    }
    panic!("daemon failed to start");
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

fn client(root: &Path) -> DaemonClient {
    DaemonClient::new(root, ClientConfig::default())
}

fn names(records: &[TestRecord]) -> Vec<String> {
    records.iter().map(|r| r.qualified_name.clone()).collect()
}

async fn collect(root: &Path, filters: Filters) -> Result<Vec<TestRecord>, ClientError> {
    let c = client(root);
    blocking(move || c.request(&filters)).await
}

/// All cases run in a single test to avoid env var races
/// (`FASTCOLLECT_RUNTIME_DIR` is process-global).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn daemon_e2e() {
    let runtime = tempfile::tempdir().unwrap();
    unsafe { std::env::set_var(transport::RUNTIME_DIR_ENV, runtime.path()) };

    // ── collect with filters ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let handle = start_daemon_with(&root, test_config()).await;

        let all = collect(&root, Filters::default()).await.unwrap();
        assert_eq!(names(&all), vec!["test_a", "test_b"]);

        let by_keyword = collect(&root, Filters::keyword("a")).await.unwrap();
        assert_eq!(names(&by_keyword), vec!["test_a"]);

        let by_marker = collect(&root, Filters::marker("slow")).await.unwrap();
        assert_eq!(names(&by_marker), vec!["test_b"]);

        let either = collect(&root, Filters::keyword("a or marker:slow")).await.unwrap();
        assert_eq!(names(&either), vec!["test_a", "test_b"]);

        let bad = collect(&root, Filters::marker("slow and")).await.unwrap_err();
        assert!(matches!(
            bad,
            ClientError::Daemon {
                kind: Some(ErrorKind::InvalidFilter),
                ..
            }
        ));

        let c = client(&root);
        let status = blocking(move || c.status()).await.unwrap();
        assert_eq!(status.pid, std::process::id());
        assert_eq!(status.record_count, 2);
        assert_eq!(status.file_count, 3);
        assert!(status.requests_served >= 4);

        let c = client(&root);
        blocking(move || c.stop()).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(exit, Ok(Ok(Ok(())))));
        assert!(!transport::socket_exists(&root));
        assert!(transport::read_pid(&root).is_none());
    }

    // ── one connection, several requests; security and protocol rejections ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let handle = start_daemon_with(&root, test_config()).await;

        let r = root.clone();
        blocking(move || {
            let root_str = fastcollect_core::normalize_path(&r).to_string_lossy().into_owned();
            let mut stream = Stream::connect(&r, Duration::from_secs(2)).unwrap();

            protocol::write_request(&mut stream, &Request::new(Command::Status, &root_str)).unwrap();
            assert!(protocol::read_response(&mut stream).unwrap().is_ok());

            let collect = Request::collect(&root_str, Filters::marker("slow"));
            protocol::write_request(&mut stream, &collect).unwrap();
            assert!(protocol::read_response(&mut stream).unwrap().is_ok());

            let foreign = Request::new(Command::Collect, "/definitely/not/this/root");
            protocol::write_request(&mut stream, &foreign).unwrap();
            let resp = protocol::read_response(&mut stream).unwrap();
            assert!(!resp.is_ok());
            assert_eq!(resp.error_kind, Some(ErrorKind::Security));

            let body = format!(r#"{{"command":"explode","root_path":{root_str:?}}}"#);
            let len = u32::try_from(body.len()).unwrap();
            stream.write_all(&len.to_le_bytes()).unwrap();
            stream.write_all(body.as_bytes()).unwrap();
            let resp = protocol::read_response(&mut stream).unwrap();
            assert_eq!(resp.error_kind, Some(ErrorKind::Protocol));

            // Session is still usable after rejected requests.
            protocol::write_request(&mut stream, &Request::new(Command::Status, &root_str)).unwrap();
            assert!(protocol::read_response(&mut stream).unwrap().is_ok());
        })
        .await;

        handle.abort();
        let _ = handle.await;
    }

    // ── oversized payload is rejected; daemon stays responsive ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let daemon_config = DaemonConfig {
            max_request_bytes: 1024,
            ..test_config()
        };
        let handle = start_daemon_with(&root, daemon_config).await;

        let r = root.clone();
        blocking(move || {
            let mut stream = Stream::connect(&r, Duration::from_secs(2)).unwrap();
            stream.write_all(&(64 * 1024 * 1024u32).to_le_bytes()).unwrap();
            stream.flush().unwrap();
            let resp = protocol::read_response(&mut stream).unwrap();
            assert!(!resp.is_ok());
            assert_eq!(resp.error_kind, Some(ErrorKind::Security));
        })
        .await;

        let all = collect(&root, Filters::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let c = client(&root);
        let status = blocking(move || c.status()).await.unwrap();
        assert!(status.requests_failed >= 1);

        handle.abort();
        let _ = handle.await;
    }

    // ── reload consistency ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let handle = start_daemon_with(&root, test_config()).await;

        let before = names(&collect(&root, Filters::default()).await.unwrap());
        std::fs::write(root.join("test_new.py"), "def test_new():\n    pass\n").unwrap();

        let mut readers = Vec::new();
        for _ in 0..6 {
            let r = root.clone();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..5 {
                    seen.push(names(&collect(&r, Filters::default()).await.unwrap()));
                }
                seen
            }));
        }
        let c = client(&root);
        let reloaded = blocking(move || c.reload()).await.unwrap();
        assert_eq!(reloaded.generation, 1);

        let after = names(&collect(&root, Filters::default()).await.unwrap());
        assert_eq!(after.len(), before.len() + 1);
        assert!(after.contains(&"test_new".to_string()));

        for reader in readers {
            for seen in reader.await.unwrap() {
                assert!(seen == before || seen == after, "mixed snapshot: {seen:?}");
            }
        }

        handle.abort();
        let _ = handle.await;
    }

    // ── backpressure when sessions and queue are full ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let daemon_config = DaemonConfig {
            max_sessions: 1,
            max_queued: 0,
            ..test_config()
        };
        let handle = start_daemon_with(&root, daemon_config).await;
        // Let the readiness probe's session release its slot.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let r = root.clone();
        let held = blocking(move || Stream::connect(&r, Duration::from_secs(2)).unwrap()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let impatient = DaemonClient::new(
            &root,
            ClientConfig {
                max_retries: 0,
                ..ClientConfig::default()
            },
        );
        let err = blocking(move || impatient.request(&Filters::default()))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ClientError::Daemon {
                    kind: Some(ErrorKind::Backpressure),
                    ..
                }
            ),
            "{err:?}"
        );

        drop(held);
        let all = collect(&root, Filters::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let c = client(&root);
        let status = blocking(move || c.status()).await.unwrap();
        assert!(status.connections_rejected >= 1);

        handle.abort();
        let _ = handle.await;
    }

    // ── queued connection is served once a session slot frees up ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let daemon_config = DaemonConfig {
            max_sessions: 1,
            max_queued: 1,
            queue_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let handle = start_daemon_with(&root, daemon_config).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let r = root.clone();
        let held = blocking(move || Stream::connect(&r, Duration::from_secs(2)).unwrap()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let patient = DaemonClient::new(
            &root,
            ClientConfig {
                max_retries: 0,
                ..ClientConfig::default()
            },
        );
        let pending = tokio::task::spawn_blocking(move || patient.request(&Filters::default()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!pending.is_finished(), "queued request answered while the slot was held");

        drop(held);
        let served = pending.await.unwrap().unwrap();
        assert_eq!(names(&served), vec!["test_a", "test_b"]);

        let c = client(&root);
        let status = blocking(move || c.status()).await.unwrap();
        assert_eq!(status.connections_rejected, 0);

        handle.abort();
        let _ = handle.await;
    }

    // ── a request past its deadline fails alone; other sessions keep working ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        write_large_tree(dir.path(), 300);
        let root = dir.path().to_path_buf();
        let mut config = Config::for_root(&root);
        config.use_cache = false;
        let daemon_config = DaemonConfig {
            request_timeout: Duration::from_millis(1),
            ..test_config()
        };
        let handle = start_daemon_for(config, daemon_config).await;

        let r = root.clone();
        blocking(move || {
            let root_str = fastcollect_core::normalize_path(&r).to_string_lossy().into_owned();
            let status = Request::new(Command::Status, &root_str);
            let mut steady = Stream::connect(&r, Duration::from_secs(5)).unwrap();
            protocol::write_request(&mut steady, &status).unwrap();
            assert!(protocol::read_response(&mut steady).unwrap().is_ok());

            let mut slow = Stream::connect(&r, Duration::from_secs(5)).unwrap();
            protocol::write_request(&mut slow, &Request::new(Command::Reload, &root_str)).unwrap();
            let resp = protocol::read_response(&mut slow).unwrap();
            assert_eq!(resp.error_kind, Some(ErrorKind::Timeout));
            // The session that missed its deadline is closed.
            assert!(protocol::read_response(&mut slow).is_err());

            protocol::write_request(&mut steady, &status).unwrap();
            assert!(protocol::read_response(&mut steady).unwrap().is_ok());
        })
        .await;

        let c = client(&root);
        let status = blocking(move || c.status()).await.unwrap();
        assert_eq!(status.generation, 0);
        assert!(status.requests_failed >= 1);

        handle.abort();
        let _ = handle.await;
    }

    // ── startup failures leave nothing behind ──
    {
        let dir = tempfile::tempdir().unwrap();
        let missing: PathBuf = dir.path().join("absent");
        let result = fastcollect_daemon::run(Config::for_root(&missing), test_config()).await;
        assert!(matches!(result, Err(DaemonError::Startup(_))));
        assert!(!transport::socket_exists(&missing));
        assert!(transport::read_pid(&missing).is_none());

        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let handle = start_daemon_with(&root, test_config()).await;
        let second = fastcollect_daemon::run(Config::for_root(&root), test_config()).await;
        assert!(matches!(second, Err(DaemonError::Startup(_))));
        // The first daemon is unaffected.
        assert_eq!(collect(&root, Filters::default()).await.unwrap().len(), 2);

        handle.abort();
        let _ = handle.await;
    }

    // ── idle timeout shutdown ──
    {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let root = dir.path().to_path_buf();
        let daemon_config = DaemonConfig {
            idle_timeout: Some(Duration::from_secs(1)),
            ..test_config()
        };
        let handle = start_daemon_with(&root, daemon_config).await;

        let exit = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(exit, Ok(Ok(Ok(())))));

        let r = root.clone();
        let running = blocking(move || fastcollect_daemon::probe(&r, Duration::from_millis(200))).await;
        assert!(!running);
    }

    unsafe { std::env::remove_var(transport::RUNTIME_DIR_ENV) };
}
