//! Contract for the consensus proposer.
//!
//! The proposer turns an opaque command into an agreed, numbered log entry.
//! The server submits a command and blocks until it is durably ordered; only
//! the outcome classification and message text cross back over the boundary.

use std::fmt;
use std::future::Future;

use bytes::Bytes;

/// Why a proposed command was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposeError {
    /// The command named a malformed path.
    BadPath(String),
    /// The command's expected revision did not match the current state.
    RevMismatch,
    /// Anything else, carrying the underlying message.
    Other(String),
}

impl fmt::Display for ProposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposeError::BadPath(path) => write!(f, "bad path: {path}"),
            ProposeError::RevMismatch => f.write_str("revision mismatch"),
            ProposeError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ProposeError {}

/// Submits commands to the consensus log.
pub trait Proposer: Clone + Send + Sync + 'static {
    /// Propose an opaque command and wait until it is ordered, returning
    /// the revision it was applied at.
    fn propose(&self, cmd: Bytes) -> impl Future<Output = Result<i64, ProposeError>> + Send;
}
