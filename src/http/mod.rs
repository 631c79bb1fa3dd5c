//! HTTP request/response layer
//!
//! This module holds the protocol-independent request and response types
//! used by the HTTP/2 transport, along with the session abstraction that
//! hides whether a connection is plain TCP or TLS.
//!
//! # Architecture
//!
//! - `SessionOps` trait defines transport operations (poll, read, write, close)
//! - `FdSessionOps` implements them for plain TCP, `tls::TlsSessionOps` for TLS
//! - `h2` drives HTTP/2 framing on top of any `SessionOps`
//!
//! # Examples
//!
//! ```no_run
//! use h2fetch::http::{Method, Request};
//! use h2fetch::Transport;
//!
//! let transport = Transport::builder().build().unwrap();
//! let request = Request::builder()
//!     .method(Method::Get)
//!     .url("https://example.com/")
//!     .header("accept", "text/html")
//!     .build()
//!     .unwrap();
//!
//! let mut response = transport.round_trip(request).unwrap();
//! assert_eq!(response.status().code(), 200);
//! let body = response.bytes().unwrap();
//! println!("{} bytes", body.len());
//! ```

pub mod body;
pub mod cancel;
pub mod h2;
pub mod headers;
pub mod message;
pub mod session;
pub mod tls;

pub use body::RequestBody;
pub use cancel::CancelToken;
pub use headers::Headers;
pub use message::{Body, Method, Request, RequestBuilder, Response, Scheme, Status, Version};
pub use session::{FdSessionOps, PollEvents, SessionOps};

use std::sync::Arc;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;
