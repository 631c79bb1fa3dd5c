//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 7540 Section 7.
//!
//! Errors fall into four groups:
//!
//! - connection-fatal (`Connection`, `ConnectionLost`, `GoAwayClosed`, write
//!   failures): the connection is closed and every stream on it fails
//! - stream-fatal (`Stream`, `StreamReset`, `HeaderListTooLarge`,
//!   `BodyTooLong`, `BodyTooShort`, `InvalidHeader`): only one stream fails
//! - retryable (`GoAway`, `ClientConnUnusable`, refused streams): the request
//!   never reached the server's application and may be replayed elsewhere
//! - caller-cancelled (`Cancelled`, `Timeout`)

use crate::http::cancel::Cancelled;
use std::fmt;
use std::io;
use std::sync::Arc;

/// HTTP/2 errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// I/O error on the connection
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// HTTP error from the session, TLS or request layer
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    /// Connection-level protocol violation
    #[error("connection error {code}: {reason}")]
    Connection { code: ErrorCode, reason: String },

    /// Stream-level protocol violation detected locally
    #[error("stream {stream_id} error {code}: {reason}")]
    Stream {
        stream_id: u32,
        code: ErrorCode,
        reason: String,
    },

    /// Stream reset, by the peer (`remote`) or locally
    #[error("stream {stream_id} reset by {}: {code}", reset_by(.remote))]
    StreamReset {
        stream_id: u32,
        code: ErrorCode,
        remote: bool,
    },

    /// Server sent GOAWAY before processing the stream
    #[error("server sent GOAWAY (last stream {last_stream_id}, {code}){}", fmt_debug(.debug_data))]
    GoAway {
        code: ErrorCode,
        last_stream_id: u32,
        debug_data: String,
    },

    /// Connection dropped after a GOAWAY that covered the stream
    ///
    /// The server may have processed the request, so it is not replayed.
    #[error("connection closed after GOAWAY (last stream {last_stream_id}, {code}){}", fmt_debug(.debug_data))]
    GoAwayClosed {
        code: ErrorCode,
        last_stream_id: u32,
        debug_data: String,
    },

    /// Connection cannot take new requests
    #[error("client connection unusable")]
    ClientConnUnusable,

    /// Connection was closed locally
    #[error("client connection closed")]
    ClientConnClosed,

    /// Health check failed
    #[error("client connection lost")]
    ConnectionLost,

    /// Request headers exceed the peer's SETTINGS_MAX_HEADER_LIST_SIZE
    #[error("request header list larger than peer's advertised limit ({size} > {limit})")]
    HeaderListTooLarge { size: u64, limit: u64 },

    /// Request body longer than the declared content-length
    #[error("request body larger than specified content length")]
    BodyTooLong,

    /// Request body ended before the declared content-length
    #[error("request body shorter than specified content length ({sent} < {declared})")]
    BodyTooShort { sent: u64, declared: u64 },

    /// Request carries a header HTTP/2 forbids
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Response body ended early
    #[error("unexpected EOF reading response body")]
    UnexpectedEof,

    /// Request was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,

    /// Caller's deadline passed
    #[error("request deadline exceeded")]
    Timeout,

    /// A retryable failure after request body bytes were written
    #[error("{0} (after writing request body)")]
    AfterRequestBody(Box<Error>),

    /// ALPN did not select h2 and no HTTP/1 fallback is configured
    #[error("HTTP/2 not negotiated (ALPN: {})", .0.as_deref().unwrap_or("none"))]
    Http2NotNegotiated(Option<String>),

    /// Unsupported URL scheme
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn reset_by(remote: &bool) -> &'static str {
    if *remote {
        "peer"
    } else {
        "client"
    }
}

fn fmt_debug(data: &str) -> String {
    if data.is_empty() {
        String::new()
    } else {
        format!(": {:?}", data)
    }
}

impl Error {
    /// Connection-level protocol error
    pub fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Connection {
            code,
            reason: reason.into(),
        }
    }

    /// Stream-level protocol error
    pub fn stream(stream_id: u32, code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Stream {
            stream_id,
            code,
            reason: reason.into(),
        }
    }

    /// Whether the request can be replayed on a new connection
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::GoAway { .. } | Error::ClientConnUnusable => true,
            Error::StreamReset { code, .. } => *code == ErrorCode::RefusedStream,
            _ => false,
        }
    }

    /// Whether the error is scoped to the connection rather than one stream
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Connection { .. }
                | Error::ConnectionLost
                | Error::ClientConnClosed
                | Error::GoAwayClosed { .. }
        )
    }

    /// RFC 7540 error code carried by the error, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Connection { code, .. }
            | Error::Stream { code, .. }
            | Error::StreamReset { code, .. }
            | Error::GoAway { code, .. }
            | Error::GoAwayClosed { code, .. } => Some(*code),
            Error::AfterRequestBody(inner) => inner.code(),
            _ => None,
        }
    }

    /// Strip the `AfterRequestBody` wrapper
    pub fn into_inner(self) -> Error {
        match self {
            Error::AfterRequestBody(inner) => *inner,
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        match err {
            Cancelled::Cancelled => Error::Cancelled,
            Cancelled::DeadlineExceeded => Error::Timeout,
        }
    }
}

impl From<crate::net::Error> for Error {
    fn from(err: crate::net::Error) -> Self {
        Error::Http(crate::http::Error::Network(err))
    }
}

impl From<crate::http::tls::TlsError> for Error {
    fn from(err: crate::http::tls::TlsError) -> Self {
        Error::Http(crate::http::Error::Tls(err))
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Decode a code from the wire; unknown codes are treated as INTERNAL_ERROR
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
