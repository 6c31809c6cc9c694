use std::sync::Arc;

use bytes::Bytes;
use rand::seq::IndexedRandom;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, instrument, warn};

use trellis_core::codec::PostcardCodec;
use trellis_core::glob::Glob;
use trellis_core::ops;
use trellis_core::proposer::Proposer;
use trellis_core::store::{self, Getter, Store};

use crate::conn::Conn;

/// Writer-set membership lives under this subtree; each file's body is a
/// node id.
const CAL_GLOB: &str = "/ctl/cal/*";

/// Shared state behind every connection: the applied store and the handle
/// for submitting commands to consensus.
pub struct Server<St, P> {
    store: St,
    proposer: P,
}

impl<St: Store, P: Proposer> Server<St, P> {
    pub fn new(store: St, proposer: P) -> Self {
        Server { store, proposer }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn proposer(&self) -> &P {
        &self.proposer
    }

    /// Node ids currently holding a writer-set slot. Unclaimed slots
    /// (empty bodies) are skipped.
    pub fn cals(&self) -> Vec<String> {
        let glob = Glob::compile(CAL_GLOB).expect("static glob is valid");
        let (_, getter) = self.store.snapshot();
        let mut cals = Vec::new();
        getter.walk(&glob, &mut |_, body, _| {
            if !body.is_empty() {
                cals.push(String::from_utf8_lossy(body).into_owned());
            }
            false
        });
        cals
    }

    /// The advertised address of a randomly chosen writer-set member, if
    /// any member has one on record.
    pub(crate) fn writer_addr(&self) -> Option<String> {
        let cals = self.cals();
        let id = cals.choose(&mut rand::rng())?;
        let (_, getter) = self.store.snapshot();
        let (mut values, rev) = getter.get(&format!("/ctl/node/{id}/addr"));
        if rev == store::DIR || rev == store::MISSING || values.is_empty() {
            return None;
        }
        let addr = String::from_utf8_lossy(&values.remove(0)).into_owned();
        (!addr.is_empty()).then_some(addr)
    }

    /// Drive the applied log forward by proposing no-op commands, one at a
    /// time, until `done` fires. Used while catching up to make sure
    /// in-flight consensus instances resolve.
    pub async fn advance_until(&self, mut done: oneshot::Receiver<()>) {
        while matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            if let Err(err) = self.proposer.propose(Bytes::from_static(ops::NOP)).await {
                debug!(%err, "nop proposal failed");
            }
        }
    }

    /// Accept connections forever.
    ///
    /// `cal` is the promotion signal: until it fires, connections reject
    /// mutations with a redirect; once it fires, newly accepted connections
    /// submit mutations through the proposer.
    #[instrument(skip_all, name = "server")]
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut cal: oneshot::Receiver<()>) {
        let mut writable = false;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, writable, "accepted connection");
                    let (read, write) = socket.into_split();
                    let conn = Conn::new(Arc::clone(&self), write, writable, peer.to_string());
                    tokio::spawn(async move {
                        if let Err(err) = conn.serve(FramedRead::new(read, PostcardCodec::new())).await {
                            debug!(error = ?err, "connection error");
                        }
                    });
                }
                _ = &mut cal, if !writable => {
                    writable = true;
                    info!("promoted to writer set");
                }
            }
        }
    }
}
