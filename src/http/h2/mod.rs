//! HTTP/2 client protocol implementation
//!
//! A blocking HTTP/2 client (RFC 7540) built on any [`SessionOps`]
//! transport, plain TCP or TLS.
//!
//! # Architecture
//!
//! - `frames`, `codec`, `hpack`, `header_block`: wire format. `FrameReader`
//!   turns a byte stream into typed frames (CONTINUATION folded in, HPACK
//!   decoded); `FrameCodec` serializes outbound frames.
//! - `settings`, `flow_control`: SETTINGS parameters and window accounting.
//! - `client`: `ClientConn`, one connection with its stream table, the write
//!   path and a background read loop that demultiplexes frames by stream ID.
//! - `stream`: per-request rendezvous between a caller and the read loop.
//! - `pool`, `transport`: connection reuse, dialing, ALPN negotiation and
//!   retries.
//!
//! ## Wire fingerprint
//!
//! The initial SETTINGS (order included), the connection WINDOW_UPDATE, the
//! pseudo-header order and the default header order can be set through an
//! [`H2Fingerprint`]; the TLS ClientHello is shaped separately through
//! [`crate::http::tls::ClientHelloSpec`].
//!
//! # Examples
//!
//! ```no_run
//! use h2fetch::http::h2::{H2Fingerprint, Transport};
//! use h2fetch::http::tls::ClientHelloSpec;
//! use h2fetch::http::{Method, Request};
//! use std::io::Read;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Transport::builder()
//!     .h2_fingerprint(H2Fingerprint::chrome())
//!     .hello_fingerprint(ClientHelloSpec::chrome())
//!     .read_idle_timeout(Duration::from_secs(30))
//!     .build()?;
//!
//! let request = Request::builder()
//!     .method(Method::Get)
//!     .url("https://example.com/")
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//!
//! let mut response = transport.round_trip(request)?;
//! let mut body = String::new();
//! response.body_mut().read_to_string(&mut body)?;
//! println!("{} {}", response.status(), body.len());
//! # Ok(())
//! # }
//! ```
//!
//! [`SessionOps`]: crate::http::SessionOps

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod header_block;
pub mod hpack;
pub mod pool;
mod read_loop;
pub mod settings;
pub mod stream;
pub mod transport;

pub use client::{ClientConn, ClientConnState, Reservation};
pub use config::{ConnConfig, H2Fingerprint};
pub use error::{Error, ErrorCode, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use header_block::{PseudoHeader, PseudoHeaderOrder};
pub use pool::{ConnKey, ConnPool};
pub use settings::{Settings, SettingsBuilder, SettingsParameter};
pub use stream::{ResponseBody, StreamId, StreamState};
pub use transport::{Http1Fallback, Transport, TransportBuilder};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;
