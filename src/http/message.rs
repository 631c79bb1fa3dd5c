//! HTTP message types
//!
//! This module defines the core types for HTTP requests and responses.

use super::body::RequestBody;
use super::cancel::CancelToken;
use super::h2::header_block::PseudoHeaderOrder;
use super::h2::stream::ResponseBody;
use super::tls::TlsVars;
use super::{Error, Headers, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use std::fmt;
use std::io::{self, Read};
use std::time::Duration;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse method from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }

    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Whether a request with this method normally carries a body
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    Http11,
    #[default]
    Http2,
}

impl Version {
    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2.0",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Scheme as it appears in the `:scheme` pseudo-header
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Port implied when the URL has none
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => DEFAULT_HTTP_PORT,
            Scheme::Https => DEFAULT_HTTPS_PORT,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Parse a `:status` pseudo-header value (exactly three digits)
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != 3 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidStatus(value.to_string()));
        }
        let code = value
            .parse::<u16>()
            .map_err(|_| Error::InvalidStatus(value.to_string()))?;
        Self::new(code)
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            421 => "Misdirected Request",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is a redirection status (3xx)
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    // Common status codes as constants
    pub const OK: Status = Status { code: 200 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// HTTP request
#[derive(Debug)]
pub struct Request {
    method: Method,
    scheme: Scheme,
    authority: String,
    host: String,
    port: u16,
    path: String,
    headers: Headers,
    trailers: Option<Headers>,
    body: RequestBody,
    header_order: Option<Vec<String>>,
    pseudo_order: Option<PseudoHeaderOrder>,
    cancel: CancelToken,
}

impl Request {
    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Get the request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// Get the URL scheme
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Authority as written in the URL, without userinfo
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Host part of the authority
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port from the URL or the scheme default
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` used to dial and to key pooled connections
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Path and query
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full URL
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.path)
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Trailers sent after the body
    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    /// Get the body
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Get the mutable body
    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Regular header order override (lowercase names)
    pub fn header_order(&self) -> Option<&[String]> {
        self.header_order.as_deref()
    }

    /// Pseudo-header order override
    pub fn pseudo_order(&self) -> Option<&PseudoHeaderOrder> {
        self.pseudo_order.as_ref()
    }

    /// Cancellation token guarding this request
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether the caller asked for the connection to close after this request
    pub fn wants_close(&self) -> bool {
        self.headers
            .get_all("connection")
            .iter()
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    url: Option<String>,
    headers: Headers,
    trailers: Option<Headers>,
    body: Option<RequestBody>,
    header_order: Option<Vec<String>>,
    pseudo_order: Option<PseudoHeaderOrder>,
    cancel: Option<CancelToken>,
    timeout: Option<Duration>,
}

impl RequestBuilder {
    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the absolute URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a trailer field sent after the body
    pub fn trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.get_or_insert_with(Headers::new).insert(name, value);
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Emit regular headers in this order; unlisted names follow sorted
    pub fn header_order<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.header_order = Some(names.into_iter().map(|s| s.as_ref().to_ascii_lowercase()).collect());
        self
    }

    /// Emit pseudo-headers in this order
    pub fn pseudo_order(mut self, order: PseudoHeaderOrder) -> Self {
        self.pseudo_order = Some(order);
        self
    }

    /// Guard the request with a cancellation token
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fail the request if it has not completed its round trip within `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the request
    pub fn build(self) -> Result<Request> {
        let url = self.url.ok_or_else(|| Error::InvalidUrl("missing URL".to_string()))?;
        let uri: http::Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::InvalidUrl(format!("{}: {}", url, e)))?;

        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(s) => return Err(Error::InvalidUrl(format!("unsupported scheme {}", s))),
            None => return Err(Error::InvalidUrl(format!("{} is not absolute", url))),
        };

        let authority = uri
            .authority()
            .ok_or_else(|| Error::InvalidUrl(format!("{} has no host", url)))?;
        let authority_str = match authority.as_str().rsplit_once('@') {
            Some((_, hostport)) => hostport.to_string(),
            None => authority.as_str().to_string(),
        };
        let host = authority.host().trim_start_matches('[').trim_end_matches(']').to_string();
        if host.is_empty() {
            return Err(Error::InvalidUrl(format!("{} has no host", url)));
        }
        let port = authority.port_u16().unwrap_or_else(|| scheme.default_port());

        let path = match uri.path_and_query() {
            Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
            _ => "/".to_string(),
        };

        let cancel = match (self.cancel, self.timeout) {
            (Some(token), _) => token,
            (None, Some(timeout)) => CancelToken::with_timeout(timeout),
            (None, None) => CancelToken::new(),
        };

        Ok(Request {
            method: self.method.unwrap_or(Method::Get),
            scheme,
            authority: authority_str,
            host,
            port,
            path,
            headers: self.headers,
            trailers: self.trailers,
            body: self.body.unwrap_or_default(),
            header_order: self.header_order,
            pseudo_order: self.pseudo_order,
            cancel,
        })
    }
}

/// Response body: a lazy, forward-only byte stream
pub enum Body {
    /// No content
    Empty,
    /// Payload streamed from an HTTP/2 stream
    H2(ResponseBody),
    /// Payload from any other reader (HTTP/1 fallback)
    Reader(Box<dyn Read + Send>),
}

impl Body {
    /// Wrap an arbitrary reader
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Body::Reader(Box::new(reader))
    }

    /// Trailers, available once the body has been read to the end
    pub fn trailers(&self) -> Option<Headers> {
        match self {
            Body::H2(body) => body.trailers(),
            _ => None,
        }
    }

    /// Stop reading; an unfinished HTTP/2 stream is reset
    pub fn close(&mut self) {
        if let Body::H2(body) = self {
            body.close();
        }
        *self = Body::Empty;
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Body::Empty => Ok(0),
            Body::H2(body) => body.read(buf),
            Body::Reader(reader) => reader.read(buf),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::H2(body) => write!(f, "Body::H2(stream {})", body.stream_id()),
            Body::Reader(_) => write!(f, "Body::Reader"),
        }
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    version: Version,
    status: Status,
    headers: Headers,
    body: Body,
    tls: Option<TlsVars>,
}

impl Response {
    /// Create a new HTTP response
    pub fn new(status: Status, headers: Headers, body: Body) -> Self {
        Response {
            version: Version::default(),
            status,
            headers,
            body,
            tls: None,
        }
    }

    /// Set the protocol version
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Attach the TLS state of the connection that carried the response
    pub fn with_tls(mut self, tls: Option<TlsVars>) -> Self {
        self.tls = tls;
        self
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the status code
    pub fn status(&self) -> Status {
        self.status
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// TLS state, if the connection was encrypted
    pub fn tls(&self) -> Option<&TlsVars> {
        self.tls.as_ref()
    }

    /// Declared content length
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Get the body
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Take the body
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Trailers received after the body
    pub fn trailers(&self) -> Option<Headers> {
        self.body.trailers()
    }

    /// Read the remaining body into memory
    pub fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.body.read_to_end(&mut out)?;
        Ok(out)
    }
}
