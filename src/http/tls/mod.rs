//! TLS support for HTTP/2 connections
//!
//! The TLS layer uses the session operations abstraction:
//!
//! 1. `TlsConfig` defines client TLS settings (versions, ciphers, ALPN, trust)
//! 2. A `HelloFingerprint` optionally shapes the ClientHello
//! 3. `TlsSessionOps` implements `SessionOps` for encrypted I/O, so the
//!    HTTP/2 connection code is the same over TLS and cleartext
//!
//! # Examples
//!
//! ```no_run
//! use h2fetch::http::tls::{ClientHelloSpec, TlsConfig, TlsVersion};
//! use std::net::TcpStream;
//!
//! let tls_config = TlsConfig::client()
//!     .fingerprint(ClientHelloSpec::chrome())
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .verify_peer(true)
//!     .build()
//!     .unwrap();
//!
//! let tcp_stream = TcpStream::connect("example.com:443").unwrap();
//! let session = tls_config.connect_to(tcp_stream, "example.com").unwrap();
//! assert_eq!(session.vars().alpn.as_deref(), Some("h2"));
//! ```

pub mod config;
pub mod fingerprint;
pub mod session;
pub mod vars;

pub use config::{alpn_wire, ClientConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use fingerprint::{ClientHelloSpec, HelloFingerprint};
pub use session::TlsSessionOps;
pub use vars::TlsVars;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
