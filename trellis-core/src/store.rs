//! Contract for the replicated store.
//!
//! The store is an external collaborator: it applies consensus-ordered
//! commands, assigns revisions, and hands out immutable point-in-time
//! snapshots. The server consumes it through these traits and never relies
//! on anything beyond them.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use futures::Stream;

use crate::glob::Glob;

/// Revision sentinel: the path does not exist.
pub const MISSING: i64 = 0;
/// Revision sentinel: an expected revision that always matches.
pub const CLOBBER: i64 = -1;
/// Revision sentinel: the path is a directory.
pub const DIR: i64 = -2;

/// What a change event did to its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Set,
    Del,
}

/// One applied mutation, as observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub path: String,
    pub body: Bytes,
    pub rev: i64,
    pub kind: EventKind,
}

impl Event {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.kind == EventKind::Set
    }

    #[must_use]
    pub fn is_del(&self) -> bool {
        self.kind == EventKind::Del
    }
}

/// Errors surfaced by the store contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested revision has already been pruned from history.
    TooLate,
    Other(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::TooLate => f.write_str("revision too late"),
            StoreError::Other(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// An immutable view of store state as of a specific revision.
pub trait Getter: Send + Sync {
    /// Look up a path.
    ///
    /// For a file, returns its body as a single value and the revision it
    /// was last set at. For a directory, returns the immediate entry names
    /// and [`DIR`]. For an absent path, returns no values and [`MISSING`].
    fn get(&self, path: &str) -> (Vec<Bytes>, i64);

    /// Length and revision of a path; entry count for directories.
    fn stat(&self, path: &str) -> (i32, i64);

    /// Visit every file matching `glob`, in path order. The visitor returns
    /// `true` to stop the traversal; `walk` returns whether it was stopped.
    fn walk(&self, glob: &Glob, visit: &mut dyn FnMut(&str, &[u8], i64) -> bool) -> bool;
}

/// The replicated store.
pub trait Store: Clone + Send + Sync + 'static {
    type Getter: Getter + Send + Sync + 'static;
    type Watch: Stream<Item = Event> + Send + Unpin + 'static;

    /// The current revision counter, read from a live source.
    fn rev(&self) -> i64;

    /// A snapshot of the latest state.
    fn snapshot(&self) -> (i64, Self::Getter);

    /// Wait until `rev` exists and return a snapshot at exactly that
    /// revision. Fails with [`StoreError::TooLate`] if `rev` has already
    /// been pruned.
    fn wait(&self, rev: i64) -> impl Future<Output = Result<Self::Getter, StoreError>> + Send;

    /// Stream changes matching `glob` from now on.
    fn watch(&self, glob: Glob) -> Self::Watch;

    /// Stream changes matching `glob`, starting from revision `rev`
    /// (replaying history), then live. Fails with [`StoreError::TooLate`]
    /// if `rev` has already been pruned.
    fn watch_from(&self, glob: Glob, rev: i64) -> Result<Self::Watch, StoreError>;
}
