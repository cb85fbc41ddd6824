//! Lifecycle and fault-handling behavior over a scripted transport.
//!
//! The mock listener/connection/exchange types below implement the
//! transport traits so accept failures, handler faults, and dead peers
//! can be injected deterministically.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use harbor::{
    CancellationToken, Connection, Exchange, HandlerError, Lifecycle, Listener, Request, Response,
    ResponseSink, Server, ServerConfig, ServerError, StatusCode,
};
use tokio::sync::mpsc;

// ── Scripted transport ────────────────────────────────────────────────────────

enum AcceptStep {
    Conn(MockConn),
    Fail(io::ErrorKind),
    // Close the server from inside accept, then fail: models a fatal
    // fault racing an in-progress shutdown.
    CloseThenFail(Server, io::ErrorKind),
}

struct MockListener {
    steps: VecDeque<AcceptStep>,
}

impl MockListener {
    fn new(steps: impl IntoIterator<Item = AcceptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    fn idle() -> Self {
        Self::new([])
    }
}

impl Listener for MockListener {
    type Conn = MockConn;

    async fn accept(&mut self) -> io::Result<MockConn> {
        match self.steps.pop_front() {
            Some(AcceptStep::Conn(conn)) => Ok(conn),
            Some(AcceptStep::Fail(kind)) => Err(kind.into()),
            Some(AcceptStep::CloseThenFail(server, kind)) => {
                let _ = server.close();
                Err(kind.into())
            }
            // Script exhausted: behave like a quiet socket.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:4242".parse().expect("static addr"))
    }
}

struct MockConn {
    exchanges: VecDeque<MockExchange>,
    pulls: Arc<AtomicUsize>,
    // Pend instead of reporting graceful end once drained.
    hold_open: bool,
}

impl Connection for MockConn {
    type Exchange = MockExchange;

    async fn next_exchange(&mut self) -> io::Result<Option<MockExchange>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        match self.exchanges.pop_front() {
            Some(exchange) => Ok(Some(exchange)),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }
}

struct MockExchange {
    request: Request,
    sent: mpsc::UnboundedSender<Response>,
    fail_send: bool,
}

impl Exchange for MockExchange {
    type Sink = MockSink;

    fn into_parts(self) -> (Request, MockSink) {
        (
            self.request,
            MockSink {
                sent: self.sent,
                fail_send: self.fail_send,
            },
        )
    }
}

struct MockSink {
    sent: mpsc::UnboundedSender<Response>,
    fail_send: bool,
}

impl ResponseSink for MockSink {
    async fn send(self, response: Response) -> io::Result<()> {
        if self.fail_send {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let _ = self.sent.send(response);
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// First caller wins; later calls are no-ops. `RUST_LOG` selects output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn exchange(path: &str, sent: &mpsc::UnboundedSender<Response>, fail_send: bool) -> MockExchange {
    let raw = format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n");
    let (request, _) = Request::parse(raw.as_bytes()).expect("well-formed request");
    MockExchange {
        request,
        sent: sent.clone(),
        fail_send,
    }
}

fn conn(exchanges: Vec<MockExchange>, pulls: &Arc<AtomicUsize>, hold_open: bool) -> MockConn {
    MockConn {
        exchanges: exchanges.into(),
        pulls: Arc::clone(pulls),
        hold_open,
    }
}

fn echo_server() -> Server {
    init_tracing();
    Server::new(ServerConfig::default(), |request| async move {
        Ok(Response::new(StatusCode::Ok).body(request.path().to_owned()))
    })
}

fn body_of(response: Response) -> String {
    let bytes = response.into_bytes();
    let text = String::from_utf8(bytes.to_vec()).expect("utf-8 response");
    let (_, body) = text.split_once("\r\n\r\n").expect("header terminator");
    body.to_owned()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_unblocks_pending_accept_and_drains_registry() {
    let server = echo_server();
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_on(MockListener::idle()).await }
    });

    wait_until(|| !server.addresses().is_empty()).await;
    assert_eq!(server.lifecycle(), Lifecycle::Serving);

    server.close().unwrap();
    assert!(task.await.unwrap().is_ok());
    assert!(server.addresses().is_empty());
}

#[tokio::test]
async fn close_twice_fails_with_server_closed() {
    let server = echo_server();
    server.close().unwrap();
    assert!(matches!(server.close(), Err(ServerError::Closed)));
}

#[tokio::test]
async fn serve_after_close_fails_with_server_closed() {
    let server = echo_server();
    server.close().unwrap();
    let result = server.serve_on(MockListener::idle()).await;
    assert!(matches!(result, Err(ServerError::Closed)));
}

#[tokio::test]
async fn cancellation_token_triggers_close_once() {
    init_tracing();
    let token = CancellationToken::new();
    let server = Server::builder(ServerConfig::default(), |_request| async {
        Ok(Response::new(StatusCode::Ok))
    })
    .cancellation(token.clone())
    .build();

    token.cancel();
    wait_until(|| server.is_closed()).await;
    // The watcher already consumed the close; misuse still surfaces.
    assert!(matches!(server.close(), Err(ServerError::Closed)));
}

#[tokio::test]
async fn handler_fault_sends_fallback_and_connection_survives() {
    init_tracing();
    let server = Server::new(ServerConfig::default(), |request| async move {
        if request.path() == "/boom" {
            return Err(HandlerError::from("handler exploded"));
        }
        Ok(Response::new(StatusCode::Ok).body("fine"))
    });

    let (sent, mut responses) = mpsc::unbounded_channel();
    let pulls = Arc::new(AtomicUsize::new(0));
    let listener = MockListener::new([AcceptStep::Conn(conn(
        vec![
            exchange("/boom", &sent, false),
            exchange("/ok", &sent, false),
        ],
        &pulls,
        true,
    ))]);
    drop(sent);

    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_on(listener).await }
    });

    let fallback = responses.recv().await.expect("fallback response");
    assert_eq!(fallback.status(), StatusCode::InternalServerError);

    let second = responses.recv().await.expect("second exchange answered");
    assert_eq!(second.status(), StatusCode::Ok);
    assert_eq!(body_of(second), "fine");

    server.close().unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn send_failure_drops_connection_without_further_pulls() {
    let server = echo_server();

    let (sent, mut responses) = mpsc::unbounded_channel();
    let pulls = Arc::new(AtomicUsize::new(0));
    let listener = MockListener::new([AcceptStep::Conn(conn(
        vec![
            exchange("/dead-peer", &sent, true),
            exchange("/never-pulled", &sent, false),
        ],
        &pulls,
        true,
    ))]);
    drop(sent);

    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_on(listener).await }
    });

    // The connection (and the unsent exchange's channel handle) is
    // dropped when the exchange loop bails out on the send failure.
    assert!(responses.recv().await.is_none());
    assert_eq!(pulls.load(Ordering::SeqCst), 1);

    server.close().unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn transient_accept_faults_are_retried_with_backoff() {
    let server = echo_server();

    let (sent, mut responses) = mpsc::unbounded_channel();
    let pulls = Arc::new(AtomicUsize::new(0));
    let listener = MockListener::new([
        AcceptStep::Fail(io::ErrorKind::ConnectionReset),
        AcceptStep::Fail(io::ErrorKind::UnexpectedEof),
        AcceptStep::Fail(io::ErrorKind::InvalidData),
        AcceptStep::Conn(conn(vec![exchange("/alive", &sent, false)], &pulls, false)),
    ]);
    drop(sent);

    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_on(listener).await }
    });

    // The loop survived three transient faults and still served.
    let response = responses.recv().await.expect("served after retries");
    assert_eq!(body_of(response), "/alive");

    server.close().unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn fatal_accept_fault_surfaces_and_stops_the_listener() {
    let server = echo_server();
    let listener = MockListener::new([AcceptStep::Fail(io::ErrorKind::PermissionDenied)]);

    let result = server.serve_on(listener).await;
    assert!(matches!(result, Err(ServerError::Accept(_))));
    // The listener is gone but the server itself was not closed.
    assert!(server.addresses().is_empty());
    assert_eq!(server.lifecycle(), Lifecycle::Serving);
}

#[tokio::test]
async fn fatal_accept_fault_during_shutdown_is_swallowed() {
    let server = echo_server();
    let listener = MockListener::new([AcceptStep::CloseThenFail(
        server.clone(),
        io::ErrorKind::PermissionDenied,
    )]);

    // Whether the loop observes the cancellation or the error first,
    // the fault never surfaces once shutdown is in progress.
    let result = server.serve_on(listener).await;
    assert!(result.is_ok());
    assert!(server.is_closed());
}

#[tokio::test]
async fn exchanges_are_answered_in_arrival_order() {
    let server = echo_server();

    let (sent, mut responses) = mpsc::unbounded_channel();
    let pulls = Arc::new(AtomicUsize::new(0));
    let listener = MockListener::new([AcceptStep::Conn(conn(
        vec![
            exchange("/1", &sent, false),
            exchange("/2", &sent, false),
            exchange("/3", &sent, false),
        ],
        &pulls,
        false,
    ))]);
    drop(sent);

    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_on(listener).await }
    });

    for expected in ["/1", "/2", "/3"] {
        let response = responses.recv().await.expect("in-order response");
        assert_eq!(body_of(response), expected);
    }

    server.close().unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn close_unblocks_held_open_connection() {
    let server = echo_server();

    let (sent, mut responses) = mpsc::unbounded_channel();
    let pulls = Arc::new(AtomicUsize::new(0));
    let listener = MockListener::new([AcceptStep::Conn(conn(
        vec![exchange("/first", &sent, false)],
        &pulls,
        true,
    ))]);
    drop(sent);

    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve_on(listener).await }
    });

    // One exchange served, then the connection idles in next_exchange.
    let response = responses.recv().await.expect("first response");
    assert_eq!(body_of(response), "/first");

    server.close().unwrap();
    // The suspended pull aborts; the connection is dropped.
    assert!(responses.recv().await.is_none());
    assert!(task.await.unwrap().is_ok());
}
