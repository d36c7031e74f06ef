//! fastcollect CLI - static test collection with a resident daemon.

mod cli;

use clap::Parser;
use fastcollect_core::cache::{CACHE_VERSION, CacheError, CacheLock};
use fastcollect_core::{CacheStore, Config, Filters};
use fastcollect_daemon::{ClientConfig, DaemonClient, DaemonConfig};
use fastcollect_host::{Collector, Source};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("FASTCOLLECT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    // stdout carries results; diagnostics go to stderr (the daemon log when spawned).
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = cli::Cli::parse();
    let config = build_config(&cli);
    debug!(root = %config.root.display(), "configuration loaded");

    match cli.command {
        Some(cli::Command::Serve {
            idle_timeout,
            max_sessions,
        }) => run_serve(config, idle_timeout, max_sessions),
        Some(cli::Command::Daemon { action }) => run_daemon(&config, &action),
        Some(cli::Command::Cache { action }) => run_cache(&config, &action),
        Some(cli::Command::Collect(args)) => run_collect(config, &args),
        None => run_collect(config, &cli::CollectArgs::default()),
    }
}

/// Project settings from `pyproject.toml`, overridden by flags.
fn build_config(cli: &cli::Cli) -> Config {
    let mut config = Config::load(&cli.root);
    if cli.no_cache {
        config.use_cache = false;
    }
    if cli.no_daemon {
        config.use_daemon = false;
    }
    if cli.auto_daemon {
        config.auto_start_daemon = true;
    }
    if let Some(path) = &cli.cache_path {
        config.cache_path = Some(std::path::absolute(path).unwrap_or_else(|_| path.clone()));
    }
    config.verbose = cli.verbose;
    config
}

fn run_collect(config: Config, args: &cli::CollectArgs) -> ExitCode {
    let verbose = config.verbose;
    let collector = match Collector::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fastcollect: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filters = Filters {
        keyword: args.keyword.clone(),
        marker_expression: args.marker.clone(),
    };
    let outcome = match collector.collect(&filters) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("fastcollect: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&outcome.records) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("fastcollect: failed to serialize records: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let tests: Vec<_> = outcome.records.iter().filter(|r| r.is_runnable()).collect();
        if !args.quiet {
            for record in &tests {
                println!("{}", record.node_id());
            }
            println!();
        }
        match outcome.parse_errors.len() {
            0 => println!("{} tests collected", tests.len()),
            n => println!("{} tests collected, {n} errors", tests.len()),
        }
    }

    if verbose {
        for e in &outcome.parse_errors {
            eprintln!("fastcollect: {e}");
        }
    }
    if verbose || outcome.source == Source::Daemon {
        eprintln!("{}", outcome.status_line());
    }
    ExitCode::SUCCESS
}

fn run_serve(config: Config, idle_timeout: u64, max_sessions: usize) -> ExitCode {
    info!(idle_timeout, max_sessions, "starting daemon server");
    let daemon_config = DaemonConfig {
        idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
        max_sessions,
        ..DaemonConfig::default()
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            warn!(%e, "failed to build tokio runtime");
            eprintln!("runtime error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(fastcollect_daemon::run(config, daemon_config)) {
        Ok(()) => {
            info!("daemon shutdown cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            warn!(%e, "daemon error");
            eprintln!("daemon error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_daemon(config: &Config, action: &cli::DaemonAction) -> ExitCode {
    let client = DaemonClient::new(&config.root, ClientConfig::default());
    let result = match action {
        cli::DaemonAction::Start { wait } => return start_daemon(config, &client, *wait),
        cli::DaemonAction::Stop => client.stop().map(|()| {
            println!("daemon stopped");
        }),
        cli::DaemonAction::Status => client.status().map(|status| print_json(&status)),
        cli::DaemonAction::Reload => client.reload().map(|status| print_json(&status)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fastcollect: {e}");
            ExitCode::FAILURE
        }
    }
}

fn start_daemon(config: &Config, client: &DaemonClient, wait: u64) -> ExitCode {
    if client.is_running() {
        println!("daemon already running for {}", config.root.display());
        return ExitCode::SUCCESS;
    }
    let seed = config.use_cache.then(|| config.cache_file());
    if let Err(e) = fastcollect_daemon::start_background(&config.root, seed.as_deref()) {
        eprintln!("fastcollect: {e}");
        return ExitCode::FAILURE;
    }
    if fastcollect_daemon::wait_until_running(&config.root, Duration::from_secs(wait)) {
        println!("daemon started for {}", config.root.display());
        ExitCode::SUCCESS
    } else {
        eprintln!("fastcollect: daemon did not come up within {wait}s");
        ExitCode::FAILURE
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("fastcollect: failed to serialize: {e}"),
    }
}

fn run_cache(config: &Config, action: &cli::CacheAction) -> ExitCode {
    let path = config.cache_file();
    match action {
        cli::CacheAction::Info => {
            let store = CacheStore::load(&path);
            println!("path:    {}", path.display());
            println!("version: {CACHE_VERSION}");
            println!("exists:  {}", path.exists());
            println!("entries: {}", store.len());
            ExitCode::SUCCESS
        }
        cli::CacheAction::Clear => match clear_cache(&path) {
            Ok(removed) => {
                println!("cleared {removed} entries from {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("fastcollect: failed to clear {}: {e}", path.display());
                ExitCode::FAILURE
            }
        },
    }
}

/// Empty the cache document under the writer lock. Returns the number of
/// entries dropped.
fn clear_cache(path: &Path) -> Result<usize, CacheError> {
    let Some(_lock) = CacheLock::try_acquire(path)? else {
        return Err(CacheError::Io(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "cache is being written by another process",
        )));
    };
    let mut store = CacheStore::load(path);
    let removed = store.len();
    store.clear();
    store.persist(path)?;
    Ok(removed)
}
