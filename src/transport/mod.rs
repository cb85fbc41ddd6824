//! Transport collaborator seam.
//!
//! The server core is written against these traits rather than concrete
//! sockets: a [`Listener`] yields [`Connection`]s, a connection yields
//! sequential [`Exchange`]s, and each exchange is one request paired
//! with a single-use [`ResponseSink`]. The consuming signatures encode
//! the runtime's invariants in the types — a sink can send at most one
//! response, and an exchange cannot be responded to twice.
//!
//! [`tcp`] holds the production implementation over Tokio sockets;
//! tests substitute scripted fakes to inject transport faults.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use crate::http::{Request, Response};

pub mod tcp;

pub use tcp::{HttpConnection, HttpExchange, HttpListener, HttpSink, TlsListener};

/// A bound endpoint producing incoming connections.
pub trait Listener: Send + 'static {
    /// Connection type this listener yields.
    type Conn: Connection;

    /// Accepts the next incoming connection. Suspension point.
    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// The locally bound address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// An established duplex transport yielding sequential exchanges.
pub trait Connection: Send + 'static {
    /// Exchange type this connection yields.
    type Exchange: Exchange;

    /// Pulls the next request/response exchange. Suspension point.
    ///
    /// `Ok(None)` is graceful end of the connection; `Err` is a read
    /// failure, after which the connection must be discarded.
    fn next_exchange(&mut self) -> impl Future<Output = io::Result<Option<Self::Exchange>>> + Send;
}

/// One request paired with a single-use response sink.
pub trait Exchange: Send + 'static {
    /// Sink type completing this exchange.
    type Sink: ResponseSink;

    /// Splits the exchange into its request and response sink.
    fn into_parts(self) -> (Request, Self::Sink);
}

/// Sends exactly one response, consuming itself.
pub trait ResponseSink: Send + 'static {
    /// Delivers the response to the peer. Suspension point.
    ///
    /// An `Err` means the peer is gone; the owning connection must be
    /// dropped without pulling further exchanges.
    fn send(self, response: Response) -> impl Future<Output = io::Result<()>> + Send;
}
