//! TCP (and TLS-wrapped) transport implementation.
//!
//! [`HttpConnection`] turns a raw byte stream into a pull-based sequence
//! of HTTP/1.1 exchanges: it buffers reads, parses one request at a
//! time with [`httparse`] via [`Request::parse`], frames the body by
//! `Content-Length`, and honors keep-alive. Responses go back through a
//! shared write half so the exchange's sink can outlive the read side
//! of the loop iteration that produced it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::http::{Request, Response, StatusCode, request::RequestError};
use crate::transport::{Connection, Exchange, Listener, ResponseSink};

/// Maximum size of a buffered request before it is rejected with 413 (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// A plaintext TCP listener yielding [`HttpConnection`]s.
pub struct HttpListener {
    inner: TcpListener,
}

impl HttpListener {
    /// Binds to `addr` (e.g. `"127.0.0.1:8080"`).
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    /// Wraps an already-bound Tokio listener.
    pub fn from_listener(inner: TcpListener) -> Self {
        Self { inner }
    }
}

impl Listener for HttpListener {
    type Conn = HttpConnection<TcpStream>;

    async fn accept(&mut self) -> io::Result<Self::Conn> {
        let (stream, peer) = self.inner.accept().await?;
        debug!(peer = %peer, "connection accepted");
        Ok(HttpConnection::new(stream, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// A TCP listener that completes a TLS handshake on every accepted
/// stream using a caller-supplied acceptor.
///
/// Certificate and key loading happen outside this crate; the acceptor
/// arrives fully configured. A failed handshake surfaces as an
/// `io::Error`, which the accept loop classifies like any other
/// accept-time fault.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Binds to `addr` and wraps accepted streams with `acceptor`.
    pub async fn bind(addr: &str, acceptor: TlsAcceptor) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner, acceptor })
    }
}

impl Listener for TlsListener {
    type Conn = HttpConnection<tokio_rustls::server::TlsStream<TcpStream>>;

    async fn accept(&mut self) -> io::Result<Self::Conn> {
        let (stream, peer) = self.inner.accept().await?;
        let tls = self.acceptor.accept(stream).await?;
        debug!(peer = %peer, "secure connection accepted");
        Ok(HttpConnection::new(tls, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// A duplex byte stream yielding sequential HTTP/1.1 exchanges.
pub struct HttpConnection<S> {
    reader: ReadHalf<S>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    buf: BytesMut,
    peer: SocketAddr,
    keep_alive: bool,
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    /// Wraps a connected stream.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: Arc::new(Mutex::new(writer)),
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            peer,
            keep_alive: true,
        }
    }

    /// The peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn write_early_response(&self, response: Response) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&response.into_bytes()).await?;
        writer.flush().await
    }

    /// Tries to cut one complete request out of the read buffer.
    ///
    /// `Ok(None)` means more bytes are needed. A malformed request is
    /// answered with 400 directly and reported as `RequestError::Parse`
    /// so the caller can end the connection.
    fn parse_buffered(&mut self) -> Result<Option<Request>, RequestError> {
        let (mut request, body_offset) = match Request::parse(&self.buf) {
            Ok(parsed) => parsed,
            Err(RequestError::Incomplete) => return Ok(None),
            Err(err) => return Err(err),
        };

        let content_length = request.content_length().unwrap_or(0);
        let total = body_offset + content_length;
        if self.buf.len() < total {
            // Headers done, body still in flight.
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total).freeze();
        let body = frame.split_off(body_offset);
        request.set_body(body);
        Ok(Some(request))
    }
}

impl<S> Connection for HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    type Exchange = HttpExchange<S>;

    async fn next_exchange(&mut self) -> io::Result<Option<HttpExchange<S>>> {
        if !self.keep_alive {
            return Ok(None);
        }

        loop {
            match self.parse_buffered() {
                Ok(Some(request)) => {
                    self.keep_alive = request.is_keep_alive();
                    let sink = HttpSink {
                        writer: Arc::clone(&self.writer),
                        keep_alive: self.keep_alive,
                    };
                    return Ok(Some(HttpExchange { request, sink }));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(peer = %self.peer, error = %err, "malformed request — sending 400");
                    self.write_early_response(
                        Response::new(StatusCode::BadRequest)
                            .body("Bad Request")
                            .keep_alive(false),
                    )
                    .await?;
                    return Ok(None);
                }
            }

            if self.buf.len() > MAX_REQUEST_SIZE {
                warn!(peer = %self.peer, "request too large — sending 413");
                self.write_early_response(
                    Response::new(StatusCode::PayloadTooLarge)
                        .body("Request entity too large")
                        .keep_alive(false),
                )
                .await?;
                return Ok(None);
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    debug!(peer = %self.peer, "connection closed by peer");
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-request",
                ));
            }
        }
    }
}

/// One parsed request plus the sink that answers it.
pub struct HttpExchange<S> {
    request: Request,
    sink: HttpSink<S>,
}

impl<S> Exchange for HttpExchange<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    type Sink = HttpSink<S>;

    fn into_parts(self) -> (Request, HttpSink<S>) {
        (self.request, self.sink)
    }
}

/// Writes exactly one serialized response through the shared write half.
pub struct HttpSink<S> {
    writer: Arc<Mutex<WriteHalf<S>>>,
    keep_alive: bool,
}

impl<S> ResponseSink for HttpSink<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    async fn send(self, mut response: Response) -> io::Result<()> {
        // The request's keep-alive decision wins over the handler's default.
        if !self.keep_alive {
            response = response.keep_alive(false);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&response.into_bytes()).await?;
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn peer() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[tokio::test]
    async fn yields_one_exchange_per_request() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        let exchange = conn.next_exchange().await.unwrap().unwrap();
        let (request, sink) = exchange.into_parts();
        assert_eq!(request.path(), "/a");

        sink.send(Response::new(StatusCode::Ok).body("hi")).await.unwrap();
        let mut out = vec![0u8; 256];
        let n = rx.read(&mut out).await.unwrap();
        let text = std::str::from_utf8(&out[..n]).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hi"));
    }

    #[tokio::test]
    async fn body_framed_by_content_length() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());

        let (_rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nwxyz")
            .await
            .unwrap();

        let (request, _sink) = conn.next_exchange().await.unwrap().unwrap().into_parts();
        assert_eq!(request.body().as_ref(), b"wxyz");
    }

    #[tokio::test]
    async fn pipelined_requests_come_in_order() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());

        let (_rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"GET /1 HTTP/1.1\r\nHost: x\r\n\r\nGET /2 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let (first, _) = conn.next_exchange().await.unwrap().unwrap().into_parts();
        assert_eq!(first.path(), "/1");
        let (second, _) = conn.next_exchange().await.unwrap().unwrap().into_parts();
        assert_eq!(second.path(), "/2");
    }

    #[tokio::test]
    async fn clean_eof_is_graceful_end() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());
        drop(client);
        assert!(conn.next_exchange().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_request_is_an_error() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());

        let (rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"GET / HTTP/1.1\r\nHost:").await.unwrap();
        drop(tx);
        drop(rx);

        let err = match conn.next_exchange().await {
            Err(err) => err,
            Ok(_) => panic!("truncated request must not yield an exchange"),
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn malformed_request_answered_with_400() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"garbage garbage garbage\r\n\r\n").await.unwrap();

        assert!(conn.next_exchange().await.unwrap().is_none());
        let mut out = vec![0u8; 256];
        let n = rx.read(&mut out).await.unwrap();
        let text = std::str::from_utf8(&out[..n]).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn exchange_pull_runs_on_a_spawned_task() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());

        let (_rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"GET /spawned HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        // spawn requires the pull future to be Send across threads.
        let handle = tokio::spawn(async move {
            let (request, _sink) = conn.next_exchange().await.unwrap().unwrap().into_parts();
            request.path().to_owned()
        });
        assert_eq!(handle.await.unwrap(), "/spawned");
    }

    #[tokio::test]
    async fn connection_close_ends_exchange_sequence() {
        let (client, server) = duplex(1024);
        let mut conn = HttpConnection::new(server, peer());

        let (_rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        assert!(conn.next_exchange().await.unwrap().is_some());
        // The previous request asked to close; no further exchange is pulled.
        assert!(conn.next_exchange().await.unwrap().is_none());
    }
}
