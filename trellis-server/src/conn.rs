//! Per-connection transaction multiplexer.
//!
//! One reader task decodes framed requests and dispatches each to a verb
//! handler; handlers that may block on the store or proposer run as their
//! own tasks. Every in-flight request is a transaction keyed by its
//! client-assigned tag, carrying a cancellation signal and a completion
//! signal. Frame writes are serialized by a connection-wide lock so
//! concurrent handlers never interleave partial frames, and any write-level
//! failure poisons the connection permanently: after that no response
//! attempt performs I/O, it only unblocks its caller.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::fmt;

use bytes::Bytes;
use error_stack::Report;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument, trace, warn};

use trellis_core::codec::PostcardCodec;
use trellis_core::glob::Glob;
use trellis_core::ops;
use trellis_core::proposer::{ProposeError, Proposer};
use trellis_core::proto::{ErrCode, Request, Response, Verb, flags};
use trellis_core::store::{self, Getter, Store, StoreError};

use crate::server::Server;

/// The connection failed at the transport level.
#[derive(Debug)]
pub struct ConnError;

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection failed")
    }
}

impl std::error::Error for ConnError {}

/// The connection's outbound path has failed; no further I/O is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poisoned;

impl fmt::Display for Poisoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection poisoned")
    }
}

impl std::error::Error for Poisoned {}

/// A streaming handler must stop: its transaction was cancelled or the
/// connection was poisoned. Either way the transaction is already torn
/// down.
struct StreamStop;

/// Table entry for one in-flight request.
///
/// The handler task holds the receiving end of `cancel`; `done` flips to
/// true exactly once, when the transaction leaves the table.
struct Txn {
    cancel: mpsc::Sender<()>,
    done: watch::Sender<bool>,
}

impl Txn {
    fn new() -> (Txn, mpsc::Receiver<()>) {
        let (cancel, cancel_rx) = mpsc::channel(1);
        let (done, _) = watch::channel(false);
        (Txn { cancel, done }, cancel_rx)
    }
}

/// One multiplexer per network session.
pub struct Conn<St: Store, P: Proposer, W> {
    server: Arc<Server<St, P>>,
    writer: Mutex<FramedWrite<W, PostcardCodec<Response>>>,
    txns: StdMutex<HashMap<u32, Txn>>,
    poisoned: AtomicBool,
    writable: bool,
    peer: String,
}

impl<St, P, W> Conn<St, P, W>
where
    St: Store,
    P: Proposer,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(server: Arc<Server<St, P>>, writer: W, writable: bool, peer: String) -> Arc<Self> {
        Arc::new(Conn {
            server,
            writer: Mutex::new(FramedWrite::new(writer, PostcardCodec::new())),
            txns: StdMutex::new(HashMap::new()),
            poisoned: AtomicBool::new(false),
            writable,
            peer,
        })
    }

    /// Read framed requests until the peer closes or the transport fails.
    /// On exit every still-open transaction receives a best-effort
    /// cancellation signal.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError`] if a frame fails to decode; a clean EOF is not
    /// an error.
    #[instrument(skip_all, name = "conn", fields(peer = %self.peer))]
    pub async fn serve<R>(
        self: Arc<Self>,
        mut reader: FramedRead<R, PostcardCodec<Request>>,
    ) -> Result<(), Report<ConnError>>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let result = loop {
            match reader.next().await {
                None => break Ok(()),
                Some(Err(e)) => {
                    debug!(error = %e, "read failed");
                    break Err(Report::new(e).change_context(ConnError));
                }
                Some(Ok(req)) => Arc::clone(&self).dispatch(req).await,
            }
        };
        self.cancel_all();
        debug!("connection closed");
        result
    }

    async fn dispatch(self: Arc<Self>, req: Request) {
        let verb = match Verb::try_from(req.verb) {
            Ok(verb) => verb,
            Err(unknown) => {
                trace!(code = unknown.0, "unknown verb");
                let _ = self
                    .send_frame(
                        req.tag,
                        flags::VALID | flags::DONE,
                        Response::err(ErrCode::UnknownVerb),
                    )
                    .await;
                return;
            }
        };

        let tag = req.tag;
        let cancel = {
            let mut txns = self.txns.lock().unwrap();
            if txns.contains_key(&tag) {
                None
            } else {
                let (txn, cancel_rx) = Txn::new();
                txns.insert(tag, txn);
                Some(cancel_rx)
            }
        };
        let Some(cancel) = cancel else {
            let _ = self
                .send_frame(tag, flags::VALID | flags::DONE, Response::err(ErrCode::TagInUse))
                .await;
            return;
        };

        trace!(tag, ?verb, "dispatch");
        let conn = Arc::clone(&self);
        match verb {
            // rev reads a counter and never blocks the reader; everything
            // else may park on the store or proposer and runs as its own
            // task, cancel included (it waits on its target's completion)
            Verb::Rev => self.rev(&req).await,
            Verb::Cancel => {
                tokio::spawn(async move { conn.cancel_other(req).await });
            }
            Verb::Get => {
                tokio::spawn(async move { conn.get(req, cancel).await });
            }
            Verb::Stat => {
                tokio::spawn(async move { conn.stat(req, cancel).await });
            }
            Verb::Getdir => {
                tokio::spawn(async move { conn.getdir(req, cancel).await });
            }
            Verb::Walk => {
                tokio::spawn(async move { conn.walk(req, cancel).await });
            }
            Verb::Watch => {
                tokio::spawn(async move { conn.watch(req, cancel).await });
            }
            Verb::Set => {
                tokio::spawn(async move { conn.set(req, cancel).await });
            }
            Verb::Del => {
                tokio::spawn(async move { conn.del(req, cancel).await });
            }
            Verb::Nop => {
                tokio::spawn(async move { conn.nop(req, cancel).await });
            }
        }
    }

    /// Remove a transaction from the table and fire its completion signal.
    /// Idempotent.
    fn close_txn(&self, tag: u32) {
        let txn = self.txns.lock().unwrap().remove(&tag);
        if let Some(txn) = txn {
            txn.done.send_replace(true);
        }
    }

    /// Best-effort cancellation of every open transaction; a signal that
    /// cannot be delivered is dropped.
    fn cancel_all(&self) {
        let txns = self.txns.lock().unwrap();
        for txn in txns.values() {
            let _ = txn.cancel.try_send(());
        }
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    async fn write_locked(
        &self,
        writer: &mut FramedWrite<W, PostcardCodec<Response>>,
        resp: Response,
    ) -> Result<(), Poisoned> {
        if let Err(e) = writer.send(resp).await {
            self.poisoned.store(true, Ordering::Release);
            warn!(error = %e, "write failed, poisoning connection");
            return Err(Poisoned);
        }
        Ok(())
    }

    /// Write one frame under the connection-wide write lock. Performs no
    /// I/O once the connection is poisoned.
    async fn send_frame(&self, tag: u32, flag: u32, mut resp: Response) -> Result<(), Poisoned> {
        resp.tag = tag;
        resp.flags = flag;

        if self.is_poisoned() {
            return Err(Poisoned);
        }
        let mut writer = self.writer.lock().await;
        if self.is_poisoned() {
            return Err(Poisoned);
        }
        self.write_locked(&mut writer, resp).await
    }

    /// Send a response frame; a frame carrying [`flags::DONE`] first closes
    /// the transaction, so completion is observed even when the write path
    /// has failed.
    async fn respond(&self, tag: u32, flag: u32, resp: Response) -> Result<(), Poisoned> {
        if flag & flags::DONE != 0 {
            self.close_txn(tag);
        }
        self.send_frame(tag, flag, resp).await
    }

    /// Send one non-terminal streaming frame, offering the transaction's
    /// cancellation signal as an alternate path while waiting for the
    /// writer. If cancellation wins, or the connection is poisoned, the
    /// frame is dropped and the transaction is torn down.
    async fn stream_frame(
        &self,
        tag: u32,
        flag: u32,
        mut resp: Response,
        cancel: &mut mpsc::Receiver<()>,
    ) -> Result<(), StreamStop> {
        resp.tag = tag;
        resp.flags = flag;

        if self.is_poisoned() {
            self.close_txn(tag);
            return Err(StreamStop);
        }
        let mut writer = tokio::select! {
            biased;
            _ = cancel.recv() => {
                trace!(tag, "stream cancelled");
                self.close_txn(tag);
                return Err(StreamStop);
            }
            writer = self.writer.lock() => writer,
        };
        if self.is_poisoned() {
            self.close_txn(tag);
            return Err(StreamStop);
        }
        // once the writer is held the frame is written to completion, so
        // the peer never sees a partial frame
        self.write_locked(&mut writer, resp).await.map_err(|Poisoned| {
            self.close_txn(tag);
            StreamStop
        })
    }

    /// Resolve the snapshot a read should run against: the latest, or the
    /// one at the request's revision, waiting for it to exist. The wait
    /// races the transaction's cancellation signal; if cancellation wins
    /// the transaction is torn down and no frame is sent.
    async fn getter_for(
        &self,
        req: &Request,
        cancel: &mut mpsc::Receiver<()>,
    ) -> Option<St::Getter> {
        let Some(rev) = req.rev else {
            return Some(self.server.store().snapshot().1);
        };
        let result = tokio::select! {
            _ = cancel.recv() => {
                trace!(tag = req.tag, "read cancelled while waiting for a revision");
                self.close_txn(req.tag);
                return None;
            }
            result = self.server.store().wait(rev) => result,
        };
        match result {
            Ok(getter) => Some(getter),
            Err(StoreError::TooLate) => {
                let _ = self
                    .respond(req.tag, flags::VALID | flags::DONE, Response::err(ErrCode::TooLate))
                    .await;
                None
            }
            Err(err) => {
                let _ = self
                    .respond(req.tag, flags::VALID | flags::DONE, Response::other(err.to_string()))
                    .await;
                None
            }
        }
    }

    async fn rev(&self, req: &Request) {
        let rev = self.server.store().rev();
        let _ = self
            .respond(req.tag, flags::VALID | flags::DONE, Response::with_rev(rev))
            .await;
    }

    async fn get(&self, req: Request, mut cancel: mpsc::Receiver<()>) {
        let Some(getter) = self.getter_for(&req, &mut cancel).await else {
            return;
        };
        let (mut values, rev) = getter.get(req.path.as_deref().unwrap_or_default());
        if rev == store::DIR {
            let _ = self
                .respond(req.tag, flags::VALID | flags::DONE, Response::err(ErrCode::IsDir))
                .await;
            return;
        }

        let mut resp = Response::with_rev(rev);
        if values.len() == 1 {
            resp.value = Some(values.remove(0));
        }
        let _ = self.respond(req.tag, flags::VALID | flags::DONE, resp).await;
    }

    async fn stat(&self, req: Request, mut cancel: mpsc::Receiver<()>) {
        let Some(getter) = self.getter_for(&req, &mut cancel).await else {
            return;
        };
        let (len, rev) = getter.stat(req.path.as_deref().unwrap_or_default());
        let resp = Response {
            len: Some(len),
            rev: Some(rev),
            ..Response::default()
        };
        let _ = self.respond(req.tag, flags::VALID | flags::DONE, resp).await;
    }

    async fn getdir(&self, req: Request, mut cancel: mpsc::Receiver<()>) {
        let Some(getter) = self.getter_for(&req, &mut cancel).await else {
            return;
        };
        let (entries, rev) = getter.get(req.path.as_deref().unwrap_or_default());
        if rev == store::MISSING {
            let _ = self
                .respond(req.tag, flags::VALID | flags::DONE, Response::err(ErrCode::NoEnt))
                .await;
            return;
        }
        if rev != store::DIR {
            let _ = self
                .respond(req.tag, flags::VALID | flags::DONE, Response::err(ErrCode::NotDir))
                .await;
            return;
        }

        let (start, end) = clamp_window(req.offset, req.limit, entries.len());
        for entry in &entries[start..end] {
            let frame = Response {
                path: Some(String::from_utf8_lossy(entry).into_owned()),
                ..Response::default()
            };
            if self
                .stream_frame(req.tag, flags::VALID, frame, &mut cancel)
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = self.respond(req.tag, flags::DONE, Response::default()).await;
    }

    async fn walk(&self, req: Request, mut cancel: mpsc::Receiver<()>) {
        let pattern = req.path.clone().unwrap_or_default();
        let glob = match Glob::compile(&pattern) {
            Ok(glob) => glob,
            Err(err) => {
                let resp = Response {
                    err_code: Some(ErrCode::BadPath),
                    err_detail: Some(err.path),
                    ..Response::default()
                };
                let _ = self.respond(req.tag, flags::VALID | flags::DONE, resp).await;
                return;
            }
        };
        let Some(getter) = self.getter_for(&req, &mut cancel).await else {
            return;
        };

        let mut offset = req.offset.unwrap_or(0);
        let mut limit = match req.limit {
            Some(limit) if limit > 0 => limit,
            _ => i32::MAX,
        };

        // matches flow through a bounded channel so frames stream while the
        // traversal is still running; dropping the receiver stops the walk
        let (matches_tx, mut matches) = mpsc::channel::<(String, Bytes, i64)>(16);
        tokio::task::spawn_blocking(move || {
            getter.walk(&glob, &mut |path, body, rev| {
                if offset > 0 {
                    offset -= 1;
                    return false;
                }
                if matches_tx
                    .blocking_send((path.to_owned(), Bytes::copy_from_slice(body), rev))
                    .is_err()
                {
                    return true;
                }
                limit -= 1;
                limit == 0
            });
        });

        loop {
            let entry = tokio::select! {
                _ = cancel.recv() => {
                    trace!(tag = req.tag, "walk cancelled");
                    self.close_txn(req.tag);
                    return;
                }
                entry = matches.recv() => entry,
            };
            let Some((path, value, rev)) = entry else { break };
            let frame = Response {
                path: Some(path),
                value: Some(value),
                rev: Some(rev),
                ..Response::default()
            };
            if self
                .stream_frame(req.tag, flags::VALID | flags::SET, frame, &mut cancel)
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = self.respond(req.tag, flags::DONE, Response::default()).await;
    }

    async fn watch(&self, req: Request, mut cancel: mpsc::Receiver<()>) {
        let pattern = req.path.clone().unwrap_or_default();
        let glob = match Glob::compile(&pattern) {
            Ok(glob) => glob,
            Err(err) => {
                let resp = Response {
                    err_code: Some(ErrCode::BadPath),
                    err_detail: Some(err.path),
                    ..Response::default()
                };
                let _ = self.respond(req.tag, flags::VALID | flags::DONE, resp).await;
                return;
            }
        };

        // a request carrying any revision resumes from history; whether that
        // revision is in range is the store's call
        let mut events = match req.rev {
            Some(rev) => match self.server.store().watch_from(glob, rev) {
                Ok(events) => events,
                Err(StoreError::TooLate) => {
                    let _ = self
                        .respond(req.tag, flags::VALID | flags::DONE, Response::err(ErrCode::TooLate))
                        .await;
                    return;
                }
                Err(err) => {
                    let _ = self
                        .respond(req.tag, flags::VALID | flags::DONE, Response::other(err.to_string()))
                        .await;
                    return;
                }
            },
            None => self.server.store().watch(glob),
        };

        loop {
            tokio::select! {
                _ = cancel.recv() => {
                    trace!(tag = req.tag, "watch cancelled");
                    self.close_txn(req.tag);
                    return;
                }
                event = events.next() => {
                    let Some(event) = event else {
                        // server-side event source closed
                        self.close_txn(req.tag);
                        return;
                    };
                    let subtype = if event.is_set() { flags::SET } else { flags::DEL };
                    let frame = Response {
                        path: Some(event.path),
                        value: Some(event.body),
                        rev: Some(event.rev),
                        ..Response::default()
                    };
                    if self
                        .stream_frame(req.tag, flags::VALID | subtype, frame, &mut cancel)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    async fn set(&self, req: Request, cancel: mpsc::Receiver<()>) {
        if !self.writable {
            self.redirect(&req).await;
            return;
        }
        let (Some(path), Some(rev)) = (req.path.as_deref(), req.rev) else {
            let _ = self
                .respond(req.tag, flags::VALID | flags::DONE, Response::err(ErrCode::MissingArg))
                .await;
            return;
        };
        let cmd = ops::set(path, req.value.as_deref().unwrap_or_default(), rev);
        self.submit(req.tag, cmd, cancel).await;
    }

    async fn del(&self, req: Request, cancel: mpsc::Receiver<()>) {
        if !self.writable {
            self.redirect(&req).await;
            return;
        }
        let (Some(path), Some(rev)) = (req.path.as_deref(), req.rev) else {
            let _ = self
                .respond(req.tag, flags::VALID | flags::DONE, Response::err(ErrCode::MissingArg))
                .await;
            return;
        };
        self.submit(req.tag, ops::del(path, rev), cancel).await;
    }

    async fn nop(&self, req: Request, cancel: mpsc::Receiver<()>) {
        if !self.writable {
            self.redirect(&req).await;
            return;
        }
        self.submit(req.tag, Bytes::from_static(ops::NOP), cancel).await;
    }

    /// Submit a command through the proposer, racing the transaction's
    /// cancellation. If cancellation wins, no response body is sent; the
    /// caller already knows it asked to cancel.
    async fn submit(&self, tag: u32, cmd: Bytes, mut cancel: mpsc::Receiver<()>) {
        tokio::select! {
            _ = cancel.recv() => {
                trace!(tag, "mutation cancelled while pending");
                self.close_txn(tag);
            }
            result = self.server.proposer().propose(cmd) => {
                let _ = self.respond(tag, flags::VALID | flags::DONE, outcome_response(result)).await;
            }
        }
    }

    /// Signal another transaction's cancellation and wait for it to
    /// complete. Runs off the reader task since the wait lasts as long as
    /// the target takes to wind down. Cancelling an unknown (or our own)
    /// tag reports back instead of hanging.
    async fn cancel_other(&self, req: Request) {
        let other = req.other_tag.unwrap_or_default();
        let target = if other == req.tag {
            None
        } else {
            let txns = self.txns.lock().unwrap();
            txns.get(&other)
                .map(|txn| (txn.cancel.clone(), txn.done.subscribe()))
        };

        match target {
            Some((cancel, mut done)) => {
                // level-triggered: if a signal is already pending the new
                // one is dropped
                let _ = cancel.try_send(());
                let _ = done.wait_for(|done| *done).await;
                let _ = self
                    .respond(req.tag, flags::VALID | flags::DONE, Response::default())
                    .await;
            }
            None => {
                let _ = self
                    .respond(req.tag, flags::VALID | flags::DONE, Response::other("unknown tag"))
                    .await;
            }
        }
    }

    /// This node may not originate writes: point the client at one that
    /// can.
    async fn redirect(&self, req: &Request) {
        let resp = match self.server.writer_addr() {
            Some(addr) => Response::redirect(addr),
            None => Response::other("no known writeable addresses"),
        };
        let _ = self.respond(req.tag, flags::VALID | flags::DONE, resp).await;
    }
}

fn outcome_response(result: Result<i64, ProposeError>) -> Response {
    match result {
        Ok(rev) => Response::with_rev(rev),
        Err(ProposeError::BadPath(path)) => Response {
            err_code: Some(ErrCode::BadPath),
            err_detail: Some(path),
            ..Response::default()
        },
        Err(ProposeError::RevMismatch) => Response::err(ErrCode::RevMismatch),
        Err(ProposeError::Other(msg)) => Response::other(msg),
    }
}

/// Clamp a client-supplied offset/limit pair to a listing of `len`
/// entries: a non-positive limit means no limit, a negative offset clamps
/// to zero, and the window never extends past the end.
fn clamp_window(offset: Option<i32>, limit: Option<i32>, len: usize) -> (usize, usize) {
    let offset = usize::try_from(offset.unwrap_or(0).max(0))
        .unwrap_or(0)
        .min(len);
    let limit = match limit {
        Some(limit) if limit > 0 => usize::try_from(limit).unwrap_or(len),
        _ => len,
    };
    (offset, offset.saturating_add(limit).min(len))
}
