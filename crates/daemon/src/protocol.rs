//! Wire protocol for daemon IPC.
//!
//! Wire format: `[4B body_len_le][JSON body]`, one frame per message. A
//! connection may carry any number of request/response pairs in sequence.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use fastcollect_core::{Filters, TestRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum request body accepted by the daemon: 10 MiB.
pub const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Maximum response body accepted by the client: 256 MiB.
pub const MAX_RESPONSE_BYTES: usize = 256 * 1024 * 1024;

/// Length prefix size.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("message of {len} bytes exceeds limit of {max} bytes")]
    Oversized { len: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the peer went away or stalled, as opposed to speaking garbage.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
            ),
            Self::Oversized { .. } | Self::Malformed(_) => false,
        }
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Collect,
    Status,
    Reload,
    Stop,
    /// Any command name this daemon does not know.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    /// Project root the client believes this daemon serves.
    #[serde(default)]
    pub root_path: String,
    #[serde(default)]
    pub filters: Filters,
}

impl Request {
    #[must_use]
    pub fn new(command: Command, root_path: &str) -> Self {
        Self {
            command,
            root_path: root_path.to_string(),
            filters: Filters::default(),
        }
    }

    #[must_use]
    pub fn collect(root_path: &str, filters: Filters) -> Self {
        Self {
            filters,
            ..Self::new(Command::Collect, root_path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Classifies an error response so the client can decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Too many sessions; retry later.
    Backpressure,
    /// Root mismatch or oversized payload.
    Security,
    /// Request could not be decoded or named an unknown command.
    Protocol,
    /// Filter expression did not parse.
    InvalidFilter,
    /// Request exceeded its processing deadline.
    Timeout,
    /// Daemon-side failure (e.g. reload extraction failed).
    Internal,
}

/// Daemon health snapshot returned by `status` and `reload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub pid: u32,
    pub project_root: String,
    pub uptime_seconds: f64,
    pub record_count: usize,
    pub file_count: usize,
    /// Resident set size, if the platform reports it.
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    /// Increments on every successful reload.
    pub generation: u64,
    pub requests_served: u64,
    pub requests_failed: u64,
    pub connections_rejected: u64,
    pub reloads: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Records(Vec<TestRecord>),
    Status(StatusInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Timing {
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub data: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub timing: Timing,
}

impl Response {
    #[must_use]
    pub fn ok(data: Option<ResponseData>) -> Self {
        Self {
            status: Status::Ok,
            data,
            error_message: None,
            error_kind: None,
            timing: Timing::default(),
        }
    }

    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            data: None,
            error_message: Some(message.into()),
            error_kind: Some(kind),
            timing: Timing::default(),
        }
    }

    #[must_use]
    pub fn with_elapsed(mut self, elapsed_seconds: f64) -> Self {
        self.timing.elapsed_seconds = elapsed_seconds;
        self
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.status, Status::Ok)
    }
}

// ─── Framing ────────────────────────────────────────────────────────────────

fn encode_frame<T: Serialize>(item: &T, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(item)?;
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::Oversized {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    dst.put_u32_le(len);
    dst.put_slice(&body);
    Ok(())
}

/// Decode one frame. Returns `Ok(None)` if not enough data yet.
///
/// The size limit is checked from the header alone, before any body bytes
/// are buffered or parsed.
fn decode_frame<T: DeserializeOwned>(
    src: &mut BytesMut,
    max: usize,
) -> Result<Option<T>, ProtocolError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > max {
        return Err(ProtocolError::Oversized { len, max });
    }

    let total = HEADER_LEN + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    let body = src.split_to(len);
    Ok(Some(serde_json::from_slice(&body)?))
}

// ─── Tokio codec (async server) ─────────────────────────────────────────────

/// Server-side codec: decodes requests, encodes responses.
#[derive(Debug, Clone, Copy)]
pub struct DaemonCodec {
    max_request_bytes: usize,
}

impl DaemonCodec {
    #[must_use]
    pub const fn new(max_request_bytes: usize) -> Self {
        Self { max_request_bytes }
    }
}

impl Default for DaemonCodec {
    fn default() -> Self {
        Self::new(MAX_REQUEST_BYTES)
    }
}

impl Decoder for DaemonCodec {
    type Item = Request;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        decode_frame(src, self.max_request_bytes)
    }
}

impl Encoder<Response> for DaemonCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_frame(&item, dst)
    }
}

// ─── Sync helpers (client) ──────────────────────────────────────────────────

/// Write a request frame to a sync writer.
///
/// # Errors
///
/// Returns an error if serialization or writing to the stream fails.
pub fn write_request<W: Write>(w: &mut W, req: &Request) -> Result<(), ProtocolError> {
    let mut buf = Vec::with_capacity(256);
    encode_frame(req, &mut buf)?;
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Read one response frame from a sync reader.
///
/// # Errors
///
/// Returns an error if reading fails, the frame exceeds `MAX_RESPONSE_BYTES`,
/// or the body is not a valid response.
pub fn read_response<R: Read>(r: &mut R) -> Result<Response, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_RESPONSE_BYTES {
        return Err(ProtocolError::Oversized {
            len,
            max: MAX_RESPONSE_BYTES,
        });
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
