//! Test utilities for trellis integration tests: an in-memory replicated
//! store, a loopback proposer, and a framed client over an in-process pipe.

mod proposer;
mod store;

pub use proposer::LocalProposer;
pub use store::{MemGetter, MemStore};

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing_subscriber::{EnvFilter, fmt};

use trellis_core::codec::PostcardCodec;
use trellis_core::proposer::Proposer;
use trellis_core::proto::{Request, Response};
use trellis_core::store::Store;
use trellis_server::{Conn, Server};

/// Safe to call multiple times.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trellis=trace")),
        )
        .with_test_writer()
        .try_init();
}

/// A framed client talking to one server connection over an in-process
/// pipe, with the connection task running in the background.
pub struct TestClient {
    requests: FramedWrite<WriteHalf<DuplexStream>, PostcardCodec<Request>>,
    responses: FramedRead<ReadHalf<DuplexStream>, PostcardCodec<Response>>,
    _serve: JoinHandle<()>,
}

/// Open a connection to `server` without touching the network.
pub fn connect<St: Store, P: Proposer>(
    server: &Arc<Server<St, P>>,
    writable: bool,
) -> TestClient {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_end);
    let (client_read, client_write) = tokio::io::split(client_end);

    let conn = Conn::new(Arc::clone(server), server_write, writable, "test".to_owned());
    let serve = tokio::spawn(async move {
        let _ = conn
            .serve(FramedRead::new(server_read, PostcardCodec::new()))
            .await;
    });

    TestClient {
        requests: FramedWrite::new(client_write, PostcardCodec::new()),
        responses: FramedRead::new(client_read, PostcardCodec::new()),
        _serve: serve,
    }
}

impl TestClient {
    /// # Panics
    /// Panics if the request cannot be written.
    pub async fn send(&mut self, req: Request) {
        self.requests.send(req).await.expect("send request");
    }

    /// Next response frame.
    ///
    /// # Panics
    /// Panics if no frame arrives within five seconds.
    pub async fn recv(&mut self) -> Response {
        tokio::time::timeout(Duration::from_secs(5), self.responses.next())
            .await
            .expect("timed out waiting for a response")
            .expect("connection closed")
            .expect("decode response")
    }

    /// Next response frame, or `None` if the server stays quiet for `wait`.
    pub async fn recv_quiet(&mut self, wait: Duration) -> Option<Response> {
        match tokio::time::timeout(wait, self.responses.next()).await {
            Ok(frame) => Some(frame.expect("connection closed").expect("decode response")),
            Err(_) => None,
        }
    }

    /// Send a request and wait for its single response frame.
    ///
    /// # Panics
    /// Panics if the response carries a different tag.
    pub async fn request(&mut self, req: Request) -> Response {
        let tag = req.tag;
        self.send(req).await;
        let resp = self.recv().await;
        assert_eq!(resp.tag, tag, "response for the wrong tag");
        resp
    }

    /// Collect every frame for `tag` up to and including its terminal
    /// frame.
    ///
    /// # Panics
    /// Panics if a frame for a different tag interleaves.
    pub async fn collect(&mut self, tag: u32) -> Vec<Response> {
        let mut frames = Vec::new();
        loop {
            let resp = self.recv().await;
            assert_eq!(resp.tag, tag, "response for the wrong tag");
            let done = resp.is_done();
            frames.push(resp);
            if done {
                return frames;
            }
        }
    }

    /// Close the request side, prompting connection teardown.
    ///
    /// # Panics
    /// Panics if the pipe is already gone.
    pub async fn close(&mut self) {
        self.requests.close().await.expect("close request stream");
    }
}
