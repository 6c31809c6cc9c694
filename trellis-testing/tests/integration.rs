//! Integration tests for the connection multiplexer.
//!
//! Each test drives one server connection through an in-process framed
//! pipe and asserts on the response frames. All receives carry timeouts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use trellis_core::glob::Glob;
use trellis_core::proposer::{ProposeError, Proposer};
use trellis_core::proto::{ErrCode, Request, Verb, flags};
use trellis_core::store::{self, Getter, Store, StoreError};
use trellis_server::Server;
use trellis_testing::{LocalProposer, MemGetter, MemStore, TestClient, connect, init_tracing};

fn new_server(history: usize) -> (Arc<Server<MemStore, LocalProposer>>, MemStore) {
    let store = MemStore::with_history(history);
    let server = Arc::new(Server::new(store.clone(), LocalProposer::new(store.clone())));
    (server, store)
}

fn writable_client() -> (TestClient, MemStore) {
    let (server, store) = new_server(360);
    (connect(&server, true), store)
}

fn get(tag: u32, path: &str) -> Request {
    Request {
        path: Some(path.to_owned()),
        ..Request::new(tag, Verb::Get)
    }
}

fn set(tag: u32, path: &str, value: &'static [u8], rev: i64) -> Request {
    Request {
        path: Some(path.to_owned()),
        value: Some(Bytes::from_static(value)),
        rev: Some(rev),
        ..Request::new(tag, Verb::Set)
    }
}

/// Proposer that holds every command until the test releases it.
#[derive(Clone)]
struct GatedProposer {
    inner: LocalProposer,
    gate: Arc<Notify>,
}

impl Proposer for GatedProposer {
    async fn propose(&self, cmd: Bytes) -> Result<i64, ProposeError> {
        self.gate.notified().await;
        self.inner.propose(cmd).await
    }
}

/// Store whose walk parks on a gate after every visited entry, so a test
/// can observe frames flowing while the traversal is still in progress.
#[derive(Clone)]
struct GatedWalkStore {
    inner: MemStore,
    gate: Arc<Mutex<std::sync::mpsc::Receiver<()>>>,
}

struct GatedWalkGetter {
    inner: MemGetter,
    gate: Arc<Mutex<std::sync::mpsc::Receiver<()>>>,
}

impl Getter for GatedWalkGetter {
    fn get(&self, path: &str) -> (Vec<Bytes>, i64) {
        self.inner.get(path)
    }

    fn stat(&self, path: &str) -> (i32, i64) {
        self.inner.stat(path)
    }

    fn walk(&self, glob: &Glob, visit: &mut dyn FnMut(&str, &[u8], i64) -> bool) -> bool {
        self.inner.walk(glob, &mut |path, body, rev| {
            let stopped = visit(path, body, rev);
            if !stopped {
                let _ = self.gate.lock().unwrap().recv();
            }
            stopped
        })
    }
}

impl Store for GatedWalkStore {
    type Getter = GatedWalkGetter;
    type Watch = <MemStore as Store>::Watch;

    fn rev(&self) -> i64 {
        self.inner.rev()
    }

    fn snapshot(&self) -> (i64, GatedWalkGetter) {
        let (rev, inner) = self.inner.snapshot();
        let gate = Arc::clone(&self.gate);
        (rev, GatedWalkGetter { inner, gate })
    }

    async fn wait(&self, rev: i64) -> Result<GatedWalkGetter, StoreError> {
        let inner = self.inner.wait(rev).await?;
        let gate = Arc::clone(&self.gate);
        Ok(GatedWalkGetter { inner, gate })
    }

    fn watch(&self, glob: Glob) -> Self::Watch {
        self.inner.watch(glob)
    }

    fn watch_from(&self, glob: Glob, rev: i64) -> Result<Self::Watch, StoreError> {
        self.inner.watch_from(glob, rev)
    }
}

#[tokio::test]
async fn rev_reports_the_applied_revision() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/a", "x", store::CLOBBER);
    store.set("/b", "y", store::CLOBBER);

    let resp = client.request(Request::new(1, Verb::Rev)).await;
    assert_eq!(resp.flags, flags::VALID | flags::DONE);
    assert_eq!(resp.rev, Some(2));
}

#[tokio::test]
async fn get_returns_the_file_body() {
    init_tracing();
    let (mut client, store) = writable_client();
    let rev = store.set("/greeting", "hello", store::CLOBBER);

    let resp = client.request(get(1, "/greeting")).await;
    assert_eq!(resp.flags, flags::VALID | flags::DONE);
    assert_eq!(resp.value, Some(Bytes::from_static(b"hello")));
    assert_eq!(resp.rev, Some(rev));
    assert!(resp.err_code.is_none());
}

#[tokio::test]
async fn get_of_a_missing_path_reports_revision_zero() {
    init_tracing();
    let (mut client, _store) = writable_client();

    let resp = client.request(get(1, "/nope")).await;
    assert_eq!(resp.rev, Some(store::MISSING));
    assert!(resp.value.is_none());
    assert!(resp.err_code.is_none());
}

#[tokio::test]
async fn get_of_a_directory_is_an_error() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/d/a", "1", store::CLOBBER);

    let resp = client.request(get(1, "/d")).await;
    assert_eq!(resp.err_code, Some(ErrCode::IsDir));
}

#[tokio::test]
async fn get_at_a_revision_reads_the_pinned_snapshot() {
    init_tracing();
    let (mut client, store) = writable_client();
    let first = store.set("/k", "one", store::CLOBBER);
    store.set("/k", "two", store::CLOBBER);

    let resp = client
        .request(Request {
            rev: Some(first),
            ..get(1, "/k")
        })
        .await;
    assert_eq!(resp.value, Some(Bytes::from_static(b"one")));
    assert_eq!(resp.rev, Some(first));
}

#[tokio::test]
async fn get_waits_for_a_future_revision() {
    init_tracing();
    let (mut client, store) = writable_client();

    client
        .send(Request {
            rev: Some(1),
            ..get(1, "/k")
        })
        .await;
    assert!(client.recv_quiet(Duration::from_millis(100)).await.is_none());

    store.set("/k", "v", store::CLOBBER);
    let resp = client.recv().await;
    assert_eq!(resp.value, Some(Bytes::from_static(b"v")));
}

#[tokio::test]
async fn get_at_a_pruned_revision_is_too_late() {
    init_tracing();
    let (server, store) = new_server(2);
    let mut client = connect(&server, true);
    for _ in 0..5 {
        store.set("/k", "v", store::CLOBBER);
    }

    let resp = client
        .request(Request {
            rev: Some(1),
            ..get(1, "/k")
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::TooLate));
}

#[tokio::test]
async fn stat_reports_length_and_entry_count() {
    init_tracing();
    let (mut client, store) = writable_client();
    let rev = store.set("/d/a", "hello", store::CLOBBER);

    let resp = client
        .request(Request {
            path: Some("/d/a".to_owned()),
            ..Request::new(1, Verb::Stat)
        })
        .await;
    assert_eq!(resp.len, Some(5));
    assert_eq!(resp.rev, Some(rev));

    let resp = client
        .request(Request {
            path: Some("/d".to_owned()),
            ..Request::new(2, Verb::Stat)
        })
        .await;
    assert_eq!(resp.len, Some(1));
    assert_eq!(resp.rev, Some(store::DIR));
}

#[tokio::test]
async fn set_applies_through_the_proposer() {
    init_tracing();
    let (mut client, store) = writable_client();

    let resp = client.request(set(1, "/new", b"body", store::CLOBBER)).await;
    assert_eq!(resp.flags, flags::VALID | flags::DONE);
    assert_eq!(resp.rev, Some(1));
    assert!(resp.err_code.is_none());

    let (_, getter) = store.snapshot();
    assert_eq!(getter.get("/new"), (vec![Bytes::from_static(b"body")], 1));
}

#[tokio::test]
async fn set_with_a_stale_revision_is_rejected() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/k", "one", store::CLOBBER);
    store.set("/k", "two", store::CLOBBER);

    let resp = client.request(set(1, "/k", b"three", 1)).await;
    assert_eq!(resp.err_code, Some(ErrCode::RevMismatch));
}

#[tokio::test]
async fn set_with_a_bad_path_is_rejected() {
    init_tracing();
    let (mut client, _store) = writable_client();

    let resp = client.request(set(1, "relative", b"x", store::CLOBBER)).await;
    assert_eq!(resp.err_code, Some(ErrCode::BadPath));
    assert_eq!(resp.err_detail.as_deref(), Some("relative"));
}

#[tokio::test]
async fn set_without_a_revision_is_missing_an_argument() {
    init_tracing();
    let (mut client, _store) = writable_client();

    let resp = client
        .request(Request {
            path: Some("/k".to_owned()),
            value: Some(Bytes::from_static(b"x")),
            ..Request::new(1, Verb::Set)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::MissingArg));
}

#[tokio::test]
async fn del_removes_the_file() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/k", "v", store::CLOBBER);

    let resp = client
        .request(Request {
            path: Some("/k".to_owned()),
            rev: Some(store::CLOBBER),
            ..Request::new(1, Verb::Del)
        })
        .await;
    assert!(resp.err_code.is_none());

    let resp = client.request(get(2, "/k")).await;
    assert_eq!(resp.rev, Some(store::MISSING));
}

#[tokio::test]
async fn nop_advances_the_revision() {
    init_tracing();
    let (mut client, store) = writable_client();

    let resp = client.request(Request::new(1, Verb::Nop)).await;
    assert_eq!(resp.rev, Some(1));
    assert_eq!(store.rev(), 1);
}

#[tokio::test]
async fn getdir_streams_entries_in_order() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/d/c", "3", store::CLOBBER);
    store.set("/d/a", "1", store::CLOBBER);
    store.set("/d/b", "2", store::CLOBBER);

    client
        .send(Request {
            path: Some("/d".to_owned()),
            ..Request::new(1, Verb::Getdir)
        })
        .await;
    let frames = client.collect(1).await;

    assert_eq!(frames.len(), 4);
    for (frame, name) in frames.iter().zip(["a", "b", "c"]) {
        assert_eq!(frame.flags, flags::VALID);
        assert_eq!(frame.path.as_deref(), Some(name));
    }
    assert_eq!(frames[3].flags, flags::DONE);
}

#[tokio::test]
async fn getdir_honors_offset_and_limit() {
    init_tracing();
    let (mut client, store) = writable_client();
    for name in ["a", "b", "c", "d"] {
        store.set(&format!("/d/{name}"), "x", store::CLOBBER);
    }

    client
        .send(Request {
            path: Some("/d".to_owned()),
            offset: Some(1),
            limit: Some(2),
            ..Request::new(1, Verb::Getdir)
        })
        .await;
    let frames = client.collect(1).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].path.as_deref(), Some("b"));
    assert_eq!(frames[1].path.as_deref(), Some("c"));

    // an offset past the end yields a bare terminal frame
    client
        .send(Request {
            path: Some("/d".to_owned()),
            offset: Some(10),
            ..Request::new(2, Verb::Getdir)
        })
        .await;
    let frames = client.collect(2).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].flags, flags::DONE);

    // a non-positive limit means no limit
    client
        .send(Request {
            path: Some("/d".to_owned()),
            limit: Some(-1),
            ..Request::new(3, Verb::Getdir)
        })
        .await;
    assert_eq!(client.collect(3).await.len(), 5);
}

#[tokio::test]
async fn getdir_distinguishes_missing_from_not_a_directory() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/file", "x", store::CLOBBER);

    let resp = client
        .request(Request {
            path: Some("/nope".to_owned()),
            ..Request::new(1, Verb::Getdir)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::NoEnt));

    let resp = client
        .request(Request {
            path: Some("/file".to_owned()),
            ..Request::new(2, Verb::Getdir)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::NotDir));
}

#[tokio::test]
async fn walk_streams_matching_files() {
    init_tracing();
    let (mut client, store) = writable_client();
    let rev_a = store.set("/w/a", "1", store::CLOBBER);
    let rev_b = store.set("/w/b", "2", store::CLOBBER);
    store.set("/x/c", "3", store::CLOBBER);

    client
        .send(Request {
            path: Some("/w/*".to_owned()),
            ..Request::new(1, Verb::Walk)
        })
        .await;
    let frames = client.collect(1).await;

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].flags, flags::VALID | flags::SET);
    assert_eq!(frames[0].path.as_deref(), Some("/w/a"));
    assert_eq!(frames[0].value, Some(Bytes::from_static(b"1")));
    assert_eq!(frames[0].rev, Some(rev_a));
    assert_eq!(frames[1].path.as_deref(), Some("/w/b"));
    assert_eq!(frames[1].rev, Some(rev_b));
    assert_eq!(frames[2].flags, flags::DONE);
}

#[tokio::test]
async fn walk_honors_offset_and_limit() {
    init_tracing();
    let (mut client, store) = writable_client();
    for name in ["a", "b", "c", "d"] {
        store.set(&format!("/w/{name}"), "x", store::CLOBBER);
    }

    client
        .send(Request {
            path: Some("/w/*".to_owned()),
            offset: Some(1),
            limit: Some(2),
            ..Request::new(1, Verb::Walk)
        })
        .await;
    let frames = client.collect(1).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].path.as_deref(), Some("/w/b"));
    assert_eq!(frames[1].path.as_deref(), Some("/w/c"));
}

#[tokio::test]
async fn walk_spans_components_with_double_star() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/w/a", "1", store::CLOBBER);
    store.set("/w/deep/b", "2", store::CLOBBER);

    client
        .send(Request {
            path: Some("/w/**".to_owned()),
            ..Request::new(1, Verb::Walk)
        })
        .await;
    let frames = client.collect(1).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].path.as_deref(), Some("/w/a"));
    assert_eq!(frames[1].path.as_deref(), Some("/w/deep/b"));
}

#[tokio::test]
async fn walk_streams_frames_while_the_traversal_is_still_running() {
    init_tracing();
    let mem = MemStore::new();
    mem.set("/w/a", "1", store::CLOBBER);
    mem.set("/w/b", "2", store::CLOBBER);

    let (release, gate) = std::sync::mpsc::channel();
    let gated = GatedWalkStore {
        inner: mem.clone(),
        gate: Arc::new(Mutex::new(gate)),
    };
    let server = Arc::new(Server::new(gated, LocalProposer::new(mem)));
    let mut client = connect(&server, true);

    client
        .send(Request {
            path: Some("/w/*".to_owned()),
            ..Request::new(1, Verb::Walk)
        })
        .await;

    // the first match arrives while the traversal is parked on the gate
    let first = client.recv().await;
    assert_eq!(first.flags, flags::VALID | flags::SET);
    assert_eq!(first.path.as_deref(), Some("/w/a"));

    release.send(()).expect("release the traversal");
    let second = client.recv().await;
    assert_eq!(second.path.as_deref(), Some("/w/b"));

    release.send(()).expect("release the traversal");
    let frames = client.collect(1).await;
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_done());
}

#[tokio::test]
async fn walk_rejects_a_malformed_pattern() {
    init_tracing();
    let (mut client, _store) = writable_client();

    let resp = client
        .request(Request {
            path: Some("/w//x".to_owned()),
            ..Request::new(1, Verb::Walk)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::BadPath));
}

#[tokio::test]
async fn watch_streams_matching_events() {
    init_tracing();
    let (mut client, store) = writable_client();

    client
        .send(Request {
            path: Some("/w/**".to_owned()),
            rev: Some(1),
            ..Request::new(1, Verb::Watch)
        })
        .await;

    store.set("/w/a", "1", store::CLOBBER);
    store.set("/other", "x", store::CLOBBER);
    store.del("/w/a", store::CLOBBER);

    let resp = client.recv().await;
    assert_eq!(resp.flags, flags::VALID | flags::SET);
    assert_eq!(resp.path.as_deref(), Some("/w/a"));
    assert_eq!(resp.value, Some(Bytes::from_static(b"1")));
    assert_eq!(resp.rev, Some(1));

    let resp = client.recv().await;
    assert_eq!(resp.flags, flags::VALID | flags::DEL);
    assert_eq!(resp.path.as_deref(), Some("/w/a"));
    assert_eq!(resp.rev, Some(3));
}

#[tokio::test]
async fn watch_from_a_revision_replays_history() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/w/a", "1", store::CLOBBER);
    store.set("/w/b", "2", store::CLOBBER);

    client
        .send(Request {
            path: Some("/w/*".to_owned()),
            rev: Some(1),
            ..Request::new(1, Verb::Watch)
        })
        .await;

    let resp = client.recv().await;
    assert_eq!(resp.path.as_deref(), Some("/w/a"));
    let resp = client.recv().await;
    assert_eq!(resp.path.as_deref(), Some("/w/b"));

    // then live events
    store.set("/w/c", "3", store::CLOBBER);
    let resp = client.recv().await;
    assert_eq!(resp.path.as_deref(), Some("/w/c"));
    assert_eq!(resp.rev, Some(3));
}

#[tokio::test]
async fn watch_with_any_revision_resumes_from_history() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/w/a", "1", store::CLOBBER);

    // revision zero is within a fresh store's history, so it replays
    client
        .send(Request {
            path: Some("/w/*".to_owned()),
            rev: Some(0),
            ..Request::new(1, Verb::Watch)
        })
        .await;
    let resp = client.recv().await;
    assert_eq!(resp.path.as_deref(), Some("/w/a"));
    assert_eq!(resp.rev, Some(1));

    // an out-of-range revision is the store's verdict, not a live watch
    let resp = client
        .request(Request {
            path: Some("/w/*".to_owned()),
            rev: Some(-1),
            ..Request::new(2, Verb::Watch)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::TooLate));
}

#[tokio::test]
async fn watch_from_a_pruned_revision_is_too_late() {
    init_tracing();
    let (server, store) = new_server(2);
    let mut client = connect(&server, true);
    for _ in 0..5 {
        store.set("/w/a", "x", store::CLOBBER);
    }

    let resp = client
        .request(Request {
            path: Some("/w/*".to_owned()),
            rev: Some(1),
            ..Request::new(1, Verb::Watch)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::TooLate));
}

#[tokio::test]
async fn cancel_stops_a_watch_and_frees_its_tag() {
    init_tracing();
    let (mut client, store) = writable_client();

    client
        .send(Request {
            path: Some("/w/**".to_owned()),
            rev: Some(1),
            ..Request::new(1, Verb::Watch)
        })
        .await;
    store.set("/w/a", "1", store::CLOBBER);
    let first = client.recv().await;
    assert_eq!(first.tag, 1);

    let ack = client
        .request(Request {
            other_tag: Some(1),
            ..Request::new(2, Verb::Cancel)
        })
        .await;
    assert_eq!(ack.flags, flags::VALID | flags::DONE);
    assert!(ack.err_code.is_none());

    // the watch delivers nothing further
    store.set("/w/b", "2", store::CLOBBER);
    assert!(client.recv_quiet(Duration::from_millis(200)).await.is_none());

    // and its tag is free again
    let resp = client.request(get(1, "/w/a")).await;
    assert_eq!(resp.value, Some(Bytes::from_static(b"1")));
}

#[tokio::test]
async fn cancel_of_a_revision_waiting_read_keeps_the_connection_live() {
    init_tracing();
    let (mut client, _store) = writable_client();

    // a get pinned to a future revision parks in the store
    client
        .send(Request {
            rev: Some(5),
            ..get(1, "/k")
        })
        .await;
    assert!(client.recv_quiet(Duration::from_millis(100)).await.is_none());

    let ack = client
        .request(Request {
            other_tag: Some(1),
            ..Request::new(2, Verb::Cancel)
        })
        .await;
    assert!(ack.err_code.is_none());

    // the reader keeps serving other tags and the parked read stays silent
    let resp = client.request(Request::new(3, Verb::Rev)).await;
    assert_eq!(resp.rev, Some(0));
    assert!(client.recv_quiet(Duration::from_millis(100)).await.is_none());

    // the cancelled tag is free again
    let resp = client.request(get(1, "/k")).await;
    assert_eq!(resp.rev, Some(store::MISSING));
}

#[tokio::test]
async fn cancel_aborts_a_mutation_pending_in_consensus() {
    init_tracing();
    let mem = MemStore::new();
    let gate = Arc::new(Notify::new());
    let proposer = GatedProposer {
        inner: LocalProposer::new(mem.clone()),
        gate: Arc::clone(&gate),
    };
    let server = Arc::new(Server::new(mem.clone(), proposer));
    let mut client = connect(&server, true);

    // the set parks in the proposer
    client.send(set(1, "/k", b"v", store::CLOBBER)).await;
    assert!(client.recv_quiet(Duration::from_millis(100)).await.is_none());

    let ack = client
        .request(Request {
            other_tag: Some(1),
            ..Request::new(2, Verb::Cancel)
        })
        .await;
    assert_eq!(ack.flags, flags::VALID | flags::DONE);
    assert!(ack.err_code.is_none());

    // the aborted mutation sends no response body, never applies, and its
    // tag is free again
    assert!(client.recv_quiet(Duration::from_millis(200)).await.is_none());
    assert_eq!(mem.rev(), 0);
    let resp = client.request(get(1, "/k")).await;
    assert_eq!(resp.rev, Some(store::MISSING));

    // a later mutation still completes once the proposer answers
    gate.notify_one();
    let resp = client.request(set(3, "/k", b"v", store::CLOBBER)).await;
    assert_eq!(resp.rev, Some(1));
}

#[tokio::test]
async fn cancel_of_an_unknown_tag_reports_back() {
    init_tracing();
    let (mut client, _store) = writable_client();

    let ack = client
        .request(Request {
            other_tag: Some(9),
            ..Request::new(2, Verb::Cancel)
        })
        .await;
    assert_eq!(ack.err_code, Some(ErrCode::Other));
    assert_eq!(ack.err_detail.as_deref(), Some("unknown tag"));
}

#[tokio::test]
async fn cancel_cannot_target_itself() {
    init_tracing();
    let (mut client, _store) = writable_client();

    let ack = client
        .request(Request {
            other_tag: Some(2),
            ..Request::new(2, Verb::Cancel)
        })
        .await;
    assert_eq!(ack.err_detail.as_deref(), Some("unknown tag"));
}

#[tokio::test]
async fn an_in_flight_tag_cannot_be_reused() {
    init_tracing();
    let (mut client, store) = writable_client();

    client
        .send(Request {
            path: Some("/w/**".to_owned()),
            rev: Some(1),
            ..Request::new(1, Verb::Watch)
        })
        .await;

    // a second request on the same tag is refused...
    let resp = client.request(get(1, "/x")).await;
    assert_eq!(resp.err_code, Some(ErrCode::TagInUse));

    // ...and the original watch is still running
    store.set("/w/a", "1", store::CLOBBER);
    let event = client.recv().await;
    assert_eq!(event.tag, 1);
    assert_eq!(event.path.as_deref(), Some("/w/a"));
}

#[tokio::test]
async fn an_unknown_verb_reports_back() {
    init_tracing();
    let (mut client, _store) = writable_client();

    let resp = client
        .request(Request {
            verb: 42,
            ..Request::new(1, Verb::Nop)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::UnknownVerb));
    assert!(resp.is_done());
}

#[tokio::test]
async fn transactions_on_different_tags_are_independent() {
    init_tracing();
    let (mut client, store) = writable_client();
    store.set("/k", "v", store::CLOBBER);

    // a long-lived watch does not block other requests on the connection
    client
        .send(Request {
            path: Some("/w/**".to_owned()),
            rev: Some(10),
            ..Request::new(1, Verb::Watch)
        })
        .await;

    let resp = client.request(get(2, "/k")).await;
    assert_eq!(resp.value, Some(Bytes::from_static(b"v")));
}

#[tokio::test]
async fn mutations_redirect_on_a_readonly_connection() {
    init_tracing();
    let (server, store) = new_server(360);
    store.set("/ctl/cal/0", "n1", store::CLOBBER);
    store.set("/ctl/node/n1/addr", "10.0.0.1:8046", store::CLOBBER);
    let mut client = connect(&server, false);

    let resp = client.request(set(1, "/k", b"v", store::CLOBBER)).await;
    assert_eq!(resp.err_code, Some(ErrCode::Redirect));
    assert_eq!(resp.err_detail.as_deref(), Some("10.0.0.1:8046"));

    let resp = client
        .request(Request {
            path: Some("/k".to_owned()),
            rev: Some(store::CLOBBER),
            ..Request::new(2, Verb::Del)
        })
        .await;
    assert_eq!(resp.err_code, Some(ErrCode::Redirect));

    let resp = client.request(Request::new(3, Verb::Nop)).await;
    assert_eq!(resp.err_code, Some(ErrCode::Redirect));
}

#[tokio::test]
async fn readonly_without_writers_reports_no_addresses() {
    init_tracing();
    let (server, _store) = new_server(360);
    let mut client = connect(&server, false);

    let resp = client.request(Request::new(1, Verb::Nop)).await;
    assert_eq!(resp.err_code, Some(ErrCode::Other));
    assert_eq!(
        resp.err_detail.as_deref(),
        Some("no known writeable addresses")
    );
}

#[tokio::test]
async fn unclaimed_writer_slots_are_not_redirect_targets() {
    init_tracing();
    let (server, store) = new_server(360);
    // a claimed slot whose node never published an address, and an
    // unclaimed (empty) slot
    store.set("/ctl/cal/0", "n1", store::CLOBBER);
    store.set("/ctl/cal/1", "", store::CLOBBER);
    let mut client = connect(&server, false);

    for _ in 0..8 {
        let resp = client.request(Request::new(1, Verb::Nop)).await;
        assert_eq!(
            resp.err_detail.as_deref(),
            Some("no known writeable addresses")
        );
    }
}

#[tokio::test]
async fn reads_are_served_on_a_readonly_connection() {
    init_tracing();
    let (server, store) = new_server(360);
    store.set("/k", "v", store::CLOBBER);
    let mut client = connect(&server, false);

    let resp = client.request(get(1, "/k")).await;
    assert_eq!(resp.value, Some(Bytes::from_static(b"v")));
}

#[tokio::test]
async fn closing_the_connection_tears_down_cleanly() {
    init_tracing();
    let (mut client, store) = writable_client();

    client
        .send(Request {
            path: Some("/w/**".to_owned()),
            rev: Some(1),
            ..Request::new(1, Verb::Watch)
        })
        .await;
    store.set("/w/a", "1", store::CLOBBER);
    client.recv().await;

    client.close().await;
    // the watch task observes the teardown cancel and exits; nothing to
    // assert beyond not hanging
    tokio::time::sleep(Duration::from_millis(100)).await;
}
