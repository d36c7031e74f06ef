//! CLI argument parsing.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fastcollect",
    version,
    about = "Fast static test collection for large Python trees"
)]
pub struct Cli {
    /// Project root to collect from
    #[arg(long, global = true, env = "FASTCOLLECT_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Cache document location (default: <root>/.pytest_cache/fastcollect/cache.json)
    #[arg(long, global = true, env = "FASTCOLLECT_CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Disable the on-disk cache
    #[arg(long, global = true, env = "FASTCOLLECT_NO_CACHE")]
    pub no_cache: bool,

    /// Never contact or start a daemon
    #[arg(long, global = true, env = "FASTCOLLECT_NO_DAEMON")]
    pub no_daemon: bool,

    /// Start a background daemon after a local collection
    #[arg(long, global = true, env = "FASTCOLLECT_AUTO_DAEMON")]
    pub auto_daemon: bool,

    /// Report daemon fallbacks and per-file parse errors
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Default)]
pub struct CollectArgs {
    /// Keyword expression, e.g. "login and not slow"
    #[arg(short = 'k')]
    pub keyword: Option<String>,

    /// Marker expression, e.g. "slow or integration"
    #[arg(short = 'm')]
    pub marker: Option<String>,

    /// Print records as JSON
    #[arg(long)]
    pub json: bool,

    /// Print only the summary line
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// List tests matching the filters (default)
    Collect(CollectArgs),
    /// Run the collection daemon in the foreground
    Serve {
        /// Idle timeout in seconds before the daemon shuts down (0 disables)
        #[arg(long, default_value = "1800")]
        idle_timeout: u64,
        /// Concurrent sessions served
        #[arg(long, default_value = "10")]
        max_sessions: usize,
    },
    /// Control the background daemon for the project root
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Inspect or clear the on-disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Spawn a background daemon and wait until it answers
    Start {
        /// Seconds to wait for the daemon to come up
        #[arg(long, default_value = "10")]
        wait: u64,
    },
    /// Ask the daemon to drain and exit
    Stop,
    /// Print daemon status as JSON
    Status,
    /// Re-extract the tree and swap the daemon's records
    Reload,
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Show cache location, schema version and entry count
    Info,
    /// Drop every cache entry
    Clear,
}
