//! Long-lived collection daemon and its client.
//!
//! The daemon keeps the extracted record set resident in memory and serves
//! filtered views of it over a per-project local socket, avoiding repeated
//! extraction across runs.

pub mod client;
pub mod protocol;
pub mod server;
pub mod state;
pub mod transport;

pub use client::{ClientConfig, ClientError, DaemonClient, probe, start_background, wait_until_running};
pub use protocol::{Command, ErrorKind, Request, Response, ResponseData, StatusInfo};
pub use server::{DaemonConfig, DaemonError, run};
