//! h2fetch - HTTP/2 client transport
//!
//! This crate provides a blocking HTTP/2 client transport (RFC 7540) with
//! connection pooling, flow control, GOAWAY/PING liveness handling and TLS
//! negotiation with a configurable ClientHello fingerprint.

pub mod http;
pub mod net;

pub use crate::http::h2::{Transport, TransportBuilder};
pub use crate::http::{CancelToken, Headers, Method, Request, RequestBody, Response, Status};
