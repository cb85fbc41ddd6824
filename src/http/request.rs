//! HTTP/1.1 request parsing via the [`httparse`] push parser.

use std::str;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors from [`Request::parse`].
#[derive(Debug, Error)]
pub enum RequestError {
    /// The header section is not complete yet; read more bytes and retry.
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A parsed HTTP/1.1 request.
///
/// [`Request::parse`] consumes only the header section; the connection
/// layer attaches the exact `Content-Length` body afterwards with
/// [`Request::set_body`], once enough bytes have arrived.
///
/// # Examples
///
/// ```
/// use harbor::http::Request;
///
/// let raw = b"GET /status?verbose=1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, offset) = Request::parse(raw).unwrap();
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/status");
/// assert_eq!(request.query_string(), Some("verbose=1"));
/// assert_eq!(offset, raw.len());
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers accepted per request.
    const MAX_HEADERS: usize = 64;

    /// Parses the header section of a request from a byte buffer.
    ///
    /// Returns the request (with an empty body) and the offset at which
    /// the body begins, immediately after the `\r\n\r\n` terminator.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — the headers are not fully buffered.
    /// - [`RequestError::Parse`] — the bytes are not a valid request.
    /// - [`RequestError::MissingField`] — method, path, or version absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = raw
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
            .unwrap(); // Infallible

        let raw_path = raw
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let (path, query) = match raw_path.split_once('?') {
            Some((p, q)) => (p.to_owned(), Some(q.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body: Bytes::new(),
            },
            body_offset,
        ))
    }

    /// Attaches the request body once it is fully buffered.
    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP minor version (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw query string, without the leading `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether the connection should stay open after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 defaults to close
    /// unless `Connection: keep-alive` is set explicitly.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// The `Content-Length` header parsed as `usize`, if present and valid.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }
}
