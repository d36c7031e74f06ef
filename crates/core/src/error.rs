use serde::{Deserialize, Serialize};

pub type Result<T> = eyre::Result<T>;

/// A single source file could not be turned into records.
///
/// Scoped to one file: a batch containing a broken file still succeeds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ParseError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("{path} is not valid UTF-8")]
    Encoding { path: String },
    #[error("{path}:{line}:{column}: invalid syntax")]
    Syntax {
        path: String,
        line: usize,
        column: usize,
    },
}
