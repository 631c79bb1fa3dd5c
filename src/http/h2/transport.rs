//! HTTP/2 transport
//!
//! The public entry point: resolves a request to a pooled connection,
//! dials and negotiates new ones, and replays requests that failed in a
//! way that is safe to retry.

use super::client::ClientConn;
use super::config::{ConnConfig, H2Fingerprint};
use super::error::{Error, Result};
use super::pool::{ConnKey, ConnPool, Dialed, PoolConn};
use super::settings::MAX_WINDOW_SIZE;
use super::{DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::http::session::{FdSessionOps, SessionOps};
use crate::http::tls::{HelloFingerprint, TlsConfig};
use crate::http::{Request, Response, Scheme};
use crate::net::{self, DialOptions};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Largest SETTINGS_MAX_FRAME_SIZE (2^24 - 1)
const MAX_FRAME_SIZE_LIMIT: u32 = (1 << 24) - 1;

const DEFAULT_MAX_RETRIES: u32 = 6;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Handles requests whose TLS handshake did not select `h2`
pub trait Http1Fallback: Send + Sync {
    /// Perform `req` over `session`, which is already past the handshake
    fn round_trip(&self, session: Box<dyn SessionOps>, req: Request) -> Result<Response>;
}

/// HTTP/2 transport with connection pooling
pub struct Transport {
    pool: ConnPool,
    config: Arc<ConnConfig>,
    tls: TlsConfig,
    dial: DialOptions,
    allow_http: bool,
    max_retries: u32,
    retry_backoff: Duration,
    http1: Option<Arc<dyn Http1Fallback>>,
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    /// Send `req` and wait for the response head
    ///
    /// Retries on a new connection when the failure is retryable and the
    /// body, if already consumed, can be rewound.
    pub fn round_trip(&self, mut req: Request) -> Result<Response> {
        match req.scheme() {
            Scheme::Https => {}
            Scheme::Http if self.allow_http => {}
            scheme => return Err(Error::UnsupportedScheme(scheme.to_string())),
        }
        let key = ConnKey::for_request(&req);
        let host = req.host().to_string();
        let token = req.cancel_token().clone();

        let mut retry: u32 = 0;
        loop {
            let reservation = match self.pool.get(&key, &token, || self.dial(&key, &host))? {
                PoolConn::H2(reservation) => reservation,
                PoolConn::Http1(session) => return self.fallback(session, req),
            };
            let conn = reservation.conn().clone();

            let err = match reservation.round_trip(&mut req) {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };
            if retry >= self.max_retries || !prepare_retry(&err, &mut req) {
                return Err(err);
            }
            conn.set_do_not_reuse();

            let backoff = self.backoff(retry);
            debug!(key = %key, conn = conn.id(), retry = retry + 1, backoff = ?backoff, error = %err, "retrying request");
            if !backoff.is_zero() {
                token.sleep(backoff)?;
            }
            retry += 1;
        }
    }

    /// Delay before retry number `retry + 1`; the first retry is immediate
    fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.retry_backoff.saturating_mul(1 << (retry - 1).min(16));
        let jitter: f64 = rand::random::<f64>() * 0.1;
        base + base.mul_f64(jitter)
    }

    fn dial(&self, key: &ConnKey, host: &str) -> Result<Dialed> {
        let tcp = net::dial(&key.authority, &self.dial)?;
        match key.scheme {
            Scheme::Http => {
                let session: Arc<dyn SessionOps> = Arc::new(FdSessionOps::new(tcp));
                Ok(Dialed::H2(ClientConn::new(session, Arc::clone(&self.config))?))
            }
            Scheme::Https => {
                let session = self.tls.connect_to(tcp, host)?;
                let vars = session.vars().clone();
                debug!(
                    key = %key,
                    version = %vars.version,
                    cipher = %vars.cipher,
                    alpn = vars.alpn.as_deref().unwrap_or("none"),
                    fingerprint = self.tls.fingerprint_name().unwrap_or("default"),
                    "TLS handshake complete"
                );
                if vars.is_h2() {
                    let session: Arc<dyn SessionOps> = Arc::new(session);
                    return Ok(Dialed::H2(ClientConn::new(session, Arc::clone(&self.config))?));
                }
                if self.http1.is_some() {
                    return Ok(Dialed::Http1(Box::new(session)));
                }
                let _ = session.close();
                Err(Error::Http2NotNegotiated(vars.alpn))
            }
        }
    }

    fn fallback(&self, session: Box<dyn SessionOps>, req: Request) -> Result<Response> {
        match &self.http1 {
            Some(http1) => {
                debug!(authority = req.authority(), "ALPN did not select h2, using HTTP/1 fallback");
                http1.round_trip(session, req)
            }
            None => {
                let alpn = session.tls_vars().and_then(|v| v.alpn);
                let _ = session.close();
                Err(Error::Http2NotNegotiated(alpn))
            }
        }
    }

    /// Close pooled connections that have no requests in flight
    pub fn close_idle_connections(&self) {
        self.pool.close_idle_connections();
    }

    /// Close every connection; later requests fail
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Connection pool backing this transport
    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    /// Per-connection configuration
    pub fn conn_config(&self) -> &ConnConfig {
        &self.config
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("pool", &self.pool)
            .field("tls", &self.tls)
            .field("allow_http", &self.allow_http)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Decide whether `err` allows another attempt, rewinding the body if needed
fn prepare_retry(err: &Error, req: &mut Request) -> bool {
    let retryable = match err {
        Error::AfterRequestBody(inner) => inner.is_retryable() && req.body().can_rewind(),
        other => other.is_retryable(),
    };
    if !retryable {
        return false;
    }
    if req.body().is_spent() {
        return req.body().can_rewind() && req.body_mut().rewind().is_ok();
    }
    true
}

/// Builder for [`Transport`]
pub struct TransportBuilder {
    config: ConnConfig,
    tls: Option<TlsConfig>,
    hello: Option<Arc<dyn HelloFingerprint>>,
    dial: DialOptions,
    allow_http: bool,
    max_retries: u32,
    retry_backoff: Duration,
    http1: Option<Arc<dyn Http1Fallback>>,
}

impl TransportBuilder {
    pub fn new() -> Self {
        TransportBuilder {
            config: ConnConfig::default(),
            tls: None,
            hello: None,
            dial: DialOptions::default(),
            allow_http: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            http1: None,
        }
    }

    /// Announce SETTINGS_MAX_CONCURRENT_STREAMS to the server
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = Some(max);
        self
    }

    /// Never open more streams than the server allows, even when that
    /// means waiting instead of dialing
    pub fn strict_max_concurrent_streams(mut self, strict: bool) -> Self {
        self.config.strict_max_concurrent_streams = strict;
        self
    }

    /// Send a health-check PING after this long without frames
    pub fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_idle_timeout = Some(timeout);
        self
    }

    /// How long a health-check PING may go unanswered
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Fail a connection whose writes stall this long
    pub fn write_byte_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_byte_timeout = Some(timeout);
        self
    }

    /// Close connections idle for this long
    pub fn idle_conn_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn max_decoder_header_table_size(mut self, size: u32) -> Self {
        self.config.max_decoder_header_table_size = size;
        self
    }

    pub fn max_encoder_header_table_size(mut self, size: u32) -> Self {
        self.config.max_encoder_header_table_size = size;
        self
    }

    /// Largest frame accepted from the server, clamped to [16 KiB, 16 MiB)
    pub fn max_read_frame_size(mut self, size: u32) -> Self {
        self.config.max_read_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    /// Receive window for each stream
    pub fn stream_window_size(mut self, size: u32) -> Self {
        self.config.stream_window_size = size;
        self
    }

    /// Connection window increment sent right after SETTINGS
    pub fn conn_window_increment(mut self, increment: u32) -> Self {
        self.config.conn_window_increment = increment;
        self
    }

    /// Shape SETTINGS, WINDOW_UPDATE and header order like a given client
    pub fn h2_fingerprint(mut self, fingerprint: H2Fingerprint) -> Self {
        self.config.fingerprint = Some(fingerprint);
        self
    }

    /// Use this TLS configuration instead of the default one
    ///
    /// Its ALPN list must offer `h2`.
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Shape the ClientHello of the default TLS configuration
    pub fn hello_fingerprint<F: HelloFingerprint + 'static>(mut self, fingerprint: F) -> Self {
        self.hello = Some(Arc::new(fingerprint));
        self
    }

    /// Allow `http://` URLs, spoken as HTTP/2 with prior knowledge
    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Retries after the first attempt
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Base delay of the exponential retry backoff
    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.dial.connect_timeout = Some(timeout);
        self
    }

    /// Hand non-h2 TLS sessions to an HTTP/1 implementation
    pub fn http1_fallback<F: Http1Fallback + 'static>(mut self, fallback: F) -> Self {
        self.http1 = Some(Arc::new(fallback));
        self
    }

    pub fn build(self) -> Result<Transport> {
        let config = self.config;
        if config.stream_window_size > MAX_WINDOW_SIZE {
            return Err(Error::InvalidConfig(format!(
                "stream window size {} exceeds 2^31-1",
                config.stream_window_size
            )));
        }
        if config.conn_window_increment > MAX_WINDOW_SIZE - DEFAULT_INITIAL_WINDOW_SIZE {
            return Err(Error::InvalidConfig(format!(
                "connection window increment {} overflows the connection window",
                config.conn_window_increment
            )));
        }
        if config.ping_timeout.is_zero() {
            return Err(Error::InvalidConfig("ping timeout must be positive".to_string()));
        }

        let tls = match self.tls {
            Some(tls) => tls,
            None => {
                let mut builder = TlsConfig::client().verify_peer(true);
                if let Some(hello) = self.hello {
                    builder = builder.fingerprint_arc(hello);
                }
                if !builder.has_alpn() {
                    builder = if self.http1.is_some() {
                        builder.alpn(&["h2", "http/1.1"])
                    } else {
                        builder.alpn(&["h2"])
                    };
                }
                builder.build()?
            }
        };

        Ok(Transport {
            pool: ConnPool::new(),
            config: Arc::new(config),
            tls,
            dial: self.dial,
            allow_http: self.allow_http,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
            http1: self.http1,
        })
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}
