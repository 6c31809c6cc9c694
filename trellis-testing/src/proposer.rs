//! Loopback proposer: applies commands straight to a [`MemStore`], standing
//! in for a real consensus round.

use bytes::Bytes;

use trellis_core::ops;
use trellis_core::proposer::{ProposeError, Proposer};

use crate::store::MemStore;

#[derive(Clone)]
pub struct LocalProposer {
    store: MemStore,
}

impl LocalProposer {
    #[must_use]
    pub fn new(store: MemStore) -> Self {
        LocalProposer { store }
    }
}

impl Proposer for LocalProposer {
    async fn propose(&self, cmd: Bytes) -> Result<i64, ProposeError> {
        // a real round trips the network; keep the await point so callers
        // racing cancellation against proposals behave the same way
        tokio::task::yield_now().await;
        let op = ops::parse(&cmd).map_err(|e| ProposeError::Other(e.to_string()))?;
        self.store.apply(&op)
    }
}
