//! In-memory replicated store.
//!
//! Applies mutation commands in order, assigns revisions, keeps a bounded
//! window of point-in-time snapshots, and broadcasts change events. Good
//! enough to stand in for the real replicated store in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use trellis_core::glob::{Glob, check_path};
use trellis_core::ops::Op;
use trellis_core::proposer::ProposeError;
use trellis_core::store::{self, Event, EventKind, Getter, Store, StoreError};

type Tree = Arc<BTreeMap<String, (Bytes, i64)>>;

/// How many historical snapshots are retained by default.
const DEFAULT_HISTORY: usize = 360;

#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
    rev_tx: Arc<watch::Sender<i64>>,
    events: broadcast::Sender<Event>,
}

struct Inner {
    rev: i64,
    current: Tree,
    /// One full tree per revision, oldest pruned first.
    snapshots: BTreeMap<i64, Tree>,
    /// Change events by revision; no-op revisions leave a gap.
    log: BTreeMap<i64, Event>,
    history: usize,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// A store that prunes snapshots more than `history` revisions back.
    #[must_use]
    pub fn with_history(history: usize) -> Self {
        let empty: Tree = Arc::new(BTreeMap::new());
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, Arc::clone(&empty));
        let (rev_tx, _) = watch::channel(0);
        let (events, _) = broadcast::channel(1024);
        MemStore {
            inner: Arc::new(Mutex::new(Inner {
                rev: 0,
                current: empty,
                snapshots,
                log: BTreeMap::new(),
                history: history.max(1),
            })),
            rev_tx: Arc::new(rev_tx),
            events,
        }
    }

    /// Apply one consensus-ordered mutation, returning the revision it
    /// landed at.
    ///
    /// # Errors
    ///
    /// Rejects malformed paths and stale expected revisions; the revision
    /// counter does not advance on rejection.
    ///
    /// # Panics
    /// Panics if the store lock is poisoned.
    pub fn apply(&self, op: &Op) -> Result<i64, ProposeError> {
        let mut inner = self.inner.lock().unwrap();

        let change = match op {
            Op::Nop => None,
            Op::Set { path, value, rev } => {
                inner.check_mutation(path, *rev)?;
                Some((path.clone(), value.clone(), EventKind::Set))
            }
            Op::Del { path, rev } => {
                inner.check_mutation(path, *rev)?;
                Some((path.clone(), Bytes::new(), EventKind::Del))
            }
        };

        let rev = inner.rev + 1;
        inner.rev = rev;

        if let Some((path, body, kind)) = change {
            let mut tree = (*inner.current).clone();
            match kind {
                EventKind::Set => {
                    tree.insert(path.clone(), (body.clone(), rev));
                }
                EventKind::Del => {
                    tree.remove(&path);
                }
            }
            inner.current = Arc::new(tree);

            let event = Event { path, body, rev, kind };
            inner.log.insert(rev, event.clone());
            let _ = self.events.send(event);
        }

        let current = Arc::clone(&inner.current);
        inner.snapshots.insert(rev, current);
        while inner.snapshots.len() > inner.history {
            let oldest = *inner.snapshots.keys().next().expect("snapshots is non-empty");
            inner.snapshots.remove(&oldest);
            inner.log.retain(|r, _| *r > oldest);
        }

        self.rev_tx.send_replace(rev);
        Ok(rev)
    }

    /// Apply a set directly; convenience for test setup.
    ///
    /// # Panics
    /// Panics if the mutation is rejected.
    pub fn set(&self, path: &str, value: impl Into<Bytes>, rev: i64) -> i64 {
        self.apply(&Op::Set {
            path: path.to_owned(),
            value: value.into(),
            rev,
        })
        .expect("set")
    }

    /// Apply a delete directly; convenience for test setup.
    ///
    /// # Panics
    /// Panics if the mutation is rejected.
    pub fn del(&self, path: &str, rev: i64) -> i64 {
        self.apply(&Op::Del {
            path: path.to_owned(),
            rev,
        })
        .expect("del")
    }
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore::new()
    }
}

impl Inner {
    fn check_mutation(&self, path: &str, expected: i64) -> Result<(), ProposeError> {
        check_path(path).map_err(|e| ProposeError::BadPath(e.path))?;
        let current = self
            .current
            .get(path)
            .map_or(store::MISSING, |(_, rev)| *rev);
        if expected != store::CLOBBER && expected < current {
            return Err(ProposeError::RevMismatch);
        }
        Ok(())
    }
}

/// A point-in-time view of the tree. Directories are implicit: a path is a
/// directory exactly when files exist beneath it (the root is always one).
#[derive(Debug)]
pub struct MemGetter {
    tree: Tree,
}

impl Getter for MemGetter {
    fn get(&self, path: &str) -> (Vec<Bytes>, i64) {
        if let Some((body, rev)) = self.tree.get(path) {
            return (vec![body.clone()], *rev);
        }

        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        let mut entries = BTreeSet::new();
        for key in self.tree.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                entries.insert(name.to_owned());
            }
        }
        if entries.is_empty() && path != "/" {
            return (Vec::new(), store::MISSING);
        }
        (entries.into_iter().map(Bytes::from).collect(), store::DIR)
    }

    fn stat(&self, path: &str) -> (i32, i64) {
        let (values, rev) = self.get(path);
        match rev {
            store::DIR => (i32::try_from(values.len()).unwrap_or(i32::MAX), store::DIR),
            store::MISSING => (0, store::MISSING),
            _ => (
                i32::try_from(values[0].len()).unwrap_or(i32::MAX),
                rev,
            ),
        }
    }

    fn walk(&self, glob: &Glob, visit: &mut dyn FnMut(&str, &[u8], i64) -> bool) -> bool {
        for (path, (body, rev)) in self.tree.iter() {
            if glob.matches(path) && visit(path, body, *rev) {
                return true;
            }
        }
        false
    }
}

impl Store for MemStore {
    type Getter = MemGetter;
    type Watch = ReceiverStream<Event>;

    fn rev(&self) -> i64 {
        *self.rev_tx.borrow()
    }

    fn snapshot(&self) -> (i64, MemGetter) {
        let inner = self.inner.lock().unwrap();
        (
            inner.rev,
            MemGetter {
                tree: Arc::clone(&inner.current),
            },
        )
    }

    async fn wait(&self, rev: i64) -> Result<MemGetter, StoreError> {
        let mut rev_rx = self.rev_tx.subscribe();
        rev_rx
            .wait_for(|r| *r >= rev)
            .await
            .map_err(|_| StoreError::Other("store closed".to_owned()))?;

        let inner = self.inner.lock().unwrap();
        match inner.snapshots.get(&rev) {
            Some(tree) => Ok(MemGetter {
                tree: Arc::clone(tree),
            }),
            None => Err(StoreError::TooLate),
        }
    }

    fn watch(&self, glob: Glob) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(64);
        let mut live = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if glob.matches(&event.path) && tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        ReceiverStream::new(rx)
    }

    fn watch_from(&self, glob: Glob, rev: i64) -> Result<ReceiverStream<Event>, StoreError> {
        // subscribe under the lock so no event falls between the history
        // snapshot and the live subscription
        let (history, mut live, mut last) = {
            let inner = self.inner.lock().unwrap();
            let floor = *inner.snapshots.keys().next().expect("snapshots is non-empty");
            if rev < floor {
                return Err(StoreError::TooLate);
            }
            let history: Vec<Event> = inner
                .log
                .range(rev..)
                .filter(|(_, event)| glob.matches(&event.path))
                .map(|(_, event)| event.clone())
                .collect();
            (history, self.events.subscribe(), inner.rev.max(rev - 1))
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in history {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if event.rev > last && glob.matches(&event.path) {
                            last = event.rev;
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(ReceiverStream::new(rx))
    }
}
