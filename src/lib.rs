//! # harbor
//!
//! An embedded async HTTP/1.1 server runtime: it owns transport
//! listeners, accepts connections, multiplexes sequential
//! request/response exchanges per connection, tracks every live
//! resource for coordinated shutdown, and survives transient transport
//! faults via exponential backoff. Routing, TLS credential loading, and
//! everything above the handler function are the caller's business.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use harbor::{Response, Server, ServerConfig, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::new("127.0.0.1", 8080), |request| async move {
//!         let agent = request
//!             .headers()
//!             .get("user-agent")
//!             .unwrap_or("Unknown")
//!             .to_owned();
//!         Ok(Response::new(StatusCode::Ok).body(format!("Your user-agent is: {agent}")))
//!     });
//!     server.listen_and_serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Shutdown
//!
//! [`Server::close`] force-closes every tracked listener and connection;
//! loops suspended on those resources unwind immediately, including any
//! pending backoff wait. Alternatively attach a [`CancellationToken`]
//! through [`Server::builder`] and signal it.

pub mod backoff;
pub mod http;
pub mod server;
pub mod timer;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{HandlerError, Lifecycle, Server, ServerBuilder, ServerConfig, ServerError};
pub use timer::{Delay, DelayError, DelayMode};
pub use transport::{Connection, Exchange, Listener, ResponseSink};

// Re-exported so callers do not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
