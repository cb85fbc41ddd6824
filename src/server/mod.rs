//! The serving runtime: lifecycle, accept loops, exchange loops.
//!
//! A [`Server`] owns one or more transport listeners. Each listener runs
//! an accept loop that classifies accept-time faults — transient faults
//! are retried with exponential backoff, anything else stops the loop —
//! and spawns a fire-and-forget exchange loop per accepted connection.
//! Every live listener and connection is tracked in a [`Registry`]
//! (one cancellation token per resource), so [`Server::close`] can
//! unblock every suspended loop at once and shutdown latency stays
//! bounded by I/O teardown rather than by a pending backoff wait.
//!
//! Within one connection, exchanges are handled strictly in arrival
//! order: the loop never pulls the next exchange before the current one
//! has been answered or has failed. Loops of different connections
//! interleave freely.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::BackoffPolicy;
use crate::http::{Request, Response};
use crate::timer::Delay;
use crate::transport::{Connection, Exchange, HttpListener, Listener, ResponseSink, TlsListener};

mod registry;

use registry::Registry;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The operation was attempted on an already-closed server.
    #[error("server closed")]
    Closed,

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A fatal (non-transient) accept failure stopped an accept loop.
    #[error("listener accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// A fault raised by a handler while producing a response.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type HandlerFn = Arc<dyn Fn(Request) -> BoxFuture<Result<Response, HandlerError>> + Send + Sync>;

type ErrorHandlerFn = Arc<dyn Fn(HandlerError) -> BoxFuture<Response> + Send + Sync>;

/// Where a server is in its life. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Serving,
    Closed,
}

/// Recognized configuration options, with defaults resolved explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind. Defaults to 8000.
    pub port: u16,
    /// Hostname to bind. Defaults to `0.0.0.0`.
    pub hostname: String,
}

impl ServerConfig {
    /// A configuration with an explicit hostname and port.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            hostname: "0.0.0.0".to_owned(),
        }
    }
}

/// Configures a [`Server`] before any serving starts.
pub struct ServerBuilder {
    config: ServerConfig,
    handler: HandlerFn,
    on_error: ErrorHandlerFn,
    token: Option<CancellationToken>,
}

impl ServerBuilder {
    /// Replaces the default error handler.
    ///
    /// The error handler turns a handler fault into the fallback
    /// response for that exchange. The default logs the fault and
    /// answers 500 `Internal Server Error`.
    #[must_use]
    pub fn on_error<E, F>(mut self, on_error: E) -> Self
    where
        E: Fn(HandlerError) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.on_error = Arc::new(move |err| Box::pin(on_error(err)));
        self
    }

    /// Ties the server to a cancellation token: its signal triggers
    /// [`Server::close`] exactly once (a duplicate close is swallowed).
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Builds the server. Must run inside a Tokio runtime when a
    /// cancellation token is attached, since the watcher is spawned here.
    pub fn build(self) -> Server {
        let server = Server {
            inner: Arc::new(Inner {
                config: self.config,
                handler: self.handler,
                on_error: self.on_error,
                lifecycle: Mutex::new(Lifecycle::Created),
                registry: Mutex::new(Registry::new()),
            }),
        };
        if let Some(token) = self.token {
            let watcher = server.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                let _ = watcher.close();
            });
        }
        server
    }
}

/// An embedded HTTP server runtime.
///
/// Cheap to clone; clones share lifecycle, registry, and handlers.
///
/// # Examples
///
/// ```rust,no_run
/// use harbor::{Response, Server, ServerConfig, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::new(ServerConfig::new("127.0.0.1", 8080), |request| async move {
///         let agent = request
///             .headers()
///             .get("user-agent")
///             .unwrap_or("Unknown")
///             .to_owned();
///         Ok(Response::new(StatusCode::Ok).body(format!("Your user-agent is: {agent}")))
///     });
///     server.listen_and_serve().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    handler: HandlerFn,
    on_error: ErrorHandlerFn,
    lifecycle: Mutex<Lifecycle>,
    registry: Mutex<Registry>,
}

impl Server {
    /// Starts configuring a server around an async handler.
    ///
    /// The handler maps one [`Request`] to one [`Response`] and may
    /// fail; it is invoked once per exchange.
    pub fn builder<H, F>(config: ServerConfig, handler: H) -> ServerBuilder
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        ServerBuilder {
            config,
            handler: Arc::new(move |request| Box::pin(handler(request))),
            on_error: default_error_handler(),
            token: None,
        }
    }

    /// A server with the default error handler and no cancellation token.
    pub fn new<H, F>(config: ServerConfig, handler: H) -> Self
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        Self::builder(config, handler).build()
    }

    /// Runs an accept loop over `listener` until the server closes or
    /// the loop stops on a fatal fault.
    ///
    /// On exit for any reason the listener is untracked and closed.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Closed`] if the server is already closed.
    /// - [`ServerError::Accept`] on a fatal accept failure before
    ///   shutdown began.
    pub async fn serve_on<L: Listener>(&self, mut listener: L) -> Result<(), ServerError> {
        self.inner.begin_serving()?;

        let addr = listener.local_addr().ok();
        let (id, token) = self.inner.registry().track_listener(addr);
        if let Some(addr) = addr {
            info!(address = %addr, "listening");
        }

        let result = self.inner.accept_loop(&mut listener, &token).await;
        self.inner.registry().untrack_listener(id);
        drop(listener);
        result
    }

    /// Binds a plaintext TCP listener per the configuration and serves
    /// on it.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be bound, plus
    /// everything [`serve_on`](Self::serve_on) can return.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::Closed);
        }
        let addr = self.inner.config.bind_addr();
        let listener = HttpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.serve_on(listener).await
    }

    /// Binds a TCP listener per the configuration, wraps every accepted
    /// stream with the supplied TLS acceptor, and serves on it.
    ///
    /// Certificate and key material live inside `acceptor`; this crate
    /// performs no credential loading of its own.
    pub async fn listen_and_serve_secure(&self, acceptor: TlsAcceptor) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::Closed);
        }
        let addr = self.inner.config.bind_addr();
        let listener = TlsListener::bind(&addr, acceptor)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.serve_on(listener).await
    }

    /// Closes the server: marks it `Closed` and force-closes every
    /// tracked listener and connection. In-flight exchanges are not
    /// awaited; their loops unwind through their own exit paths.
    ///
    /// # Errors
    ///
    /// [`ServerError::Closed`] if the server was already closed.
    pub fn close(&self) -> Result<(), ServerError> {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if *lifecycle == Lifecycle::Closed {
                return Err(ServerError::Closed);
            }
            *lifecycle = Lifecycle::Closed;
        }
        info!("server closing — draining tracked resources");
        self.inner.registry().close_all();
        Ok(())
    }

    /// The current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.inner.lifecycle)
    }

    /// Whether the server has been closed.
    pub fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    /// Bound addresses of all tracked listeners.
    pub fn addresses(&self) -> Vec<std::net::SocketAddr> {
        self.inner.registry().addresses()
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    fn is_closed(&self) -> bool {
        *lock(&self.lifecycle) == Lifecycle::Closed
    }

    fn begin_serving(&self) -> Result<(), ServerError> {
        let mut lifecycle = lock(&self.lifecycle);
        match *lifecycle {
            Lifecycle::Closed => Err(ServerError::Closed),
            Lifecycle::Created => {
                *lifecycle = Lifecycle::Serving;
                Ok(())
            }
            Lifecycle::Serving => Ok(()),
        }
    }

    /// Per-listener accept loop.
    ///
    /// Transient faults back off exponentially and never stop the loop;
    /// any other fault stops it and is surfaced unless shutdown is
    /// already in progress. A successful accept resets the backoff.
    async fn accept_loop<L: Listener>(
        self: &Arc<Self>,
        listener: &mut L,
        token: &CancellationToken,
    ) -> Result<(), ServerError> {
        let policy = BackoffPolicy::default();
        let mut previous: Option<Duration> = None;

        loop {
            if self.is_closed() {
                return Ok(());
            }

            let accepted = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    previous = None;
                    let (id, conn_token) = self.registry().track_connection();
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        inner.exchange_loop(conn, id, conn_token).await;
                    });
                }
                Err(err) if is_transient(&err) => {
                    let delay = policy.next(previous);
                    previous = Some(delay);
                    debug!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient accept failure — backing off"
                    );
                    // An abort here means the server closed; the loop
                    // re-checks the lifecycle at the top.
                    let _ = Delay::resolve(delay).with_token(token.clone()).wait().await;
                }
                Err(err) => {
                    if self.is_closed() {
                        debug!(error = %err, "accept failed during shutdown — swallowed");
                        return Ok(());
                    }
                    error!(error = %err, "fatal accept failure — stopping listener");
                    return Err(ServerError::Accept(err));
                }
            }
        }
    }

    /// Per-connection exchange loop. Runs as its own task; the accept
    /// loop never waits for it.
    async fn exchange_loop<C: Connection>(
        self: Arc<Self>,
        mut conn: C,
        id: u64,
        token: CancellationToken,
    ) {
        loop {
            if self.is_closed() {
                break;
            }

            let pulled = tokio::select! {
                _ = token.cancelled() => break,
                pulled = conn.next_exchange() => pulled,
            };

            let exchange = match pulled {
                Ok(Some(exchange)) => exchange,
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "connection read failed");
                    break;
                }
            };

            let (request, sink) = exchange.into_parts();
            let response = match (self.handler)(request).await {
                Ok(response) => response,
                Err(err) => (self.on_error)(err).await,
            };

            if let Err(err) = sink.send(response).await {
                debug!(error = %err, "response send failed — dropping connection");
                break;
            }
        }

        self.registry().untrack_connection(id);
        // The connection drops here, closing the transport.
    }
}

fn default_error_handler() -> ErrorHandlerFn {
    Arc::new(|err| {
        Box::pin(async move {
            error!(error = %err, "handler failed — sending fallback response");
            Response::internal_server_error()
        })
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accept-time faults expected to resolve themselves shortly: resource
/// pressure, malformed handshakes, peers vanishing between the kernel
/// queue and our accept.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::InvalidData
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::OutOfMemory
    )
}
