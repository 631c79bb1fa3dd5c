//! TLS configuration
//!
//! This module provides the client TLS configuration builder. The builder
//! collects plain settings and turns them into an OpenSSL context in
//! `build`, applying a ClientHello fingerprint first so explicit builder
//! settings can override individual parts of it.

use super::fingerprint::HelloFingerprint;
use super::session::TlsSessionOps;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use std::fmt;
use std::net::{IpAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

impl From<std::io::Error> for TlsError {
    fn from(err: std::io::Error) -> Self {
        TlsError::Io(Arc::new(err))
    }
}

/// Encode protocol names in ALPN wire format (length-prefixed)
pub fn alpn_wire<S: AsRef<str>>(protocols: &[S]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let proto = proto.as_ref();
        if proto.is_empty() || proto.len() > 255 {
            return Err(TlsError::InvalidConfig(format!("invalid ALPN protocol {:?}", proto)));
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
    pub(crate) fingerprint: Option<Arc<dyn HelloFingerprint>>,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Connect using the configured SNI servername
    pub fn connect(&self, stream: TcpStream) -> Result<TlsSessionOps, TlsError> {
        TlsSessionOps::connect(stream, self, self.servername.as_deref())
    }

    /// Connect to `host`, used for SNI and certificate checks unless a
    /// servername was configured explicitly
    pub fn connect_to(&self, stream: TcpStream, host: &str) -> Result<TlsSessionOps, TlsError> {
        let name = match &self.servername {
            Some(name) => Some(name.as_str()),
            // SNI carries DNS names only
            None if host.parse::<IpAddr>().is_ok() => None,
            None => Some(host),
        };
        TlsSessionOps::connect(stream, self, name)
    }

    /// Name of the ClientHello fingerprint in use
    pub fn fingerprint_name(&self) -> Option<&str> {
        self.fingerprint.as_ref().map(|f| f.name())
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("servername", &self.servername)
            .field("verify_peer", &self.verify_peer)
            .field("fingerprint", &self.fingerprint_name())
            .finish()
    }
}

/// Client configuration builder
#[derive(Default)]
pub struct ClientConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    cipher_list: Option<String>,
    ciphersuites: Option<String>,
    alpn: Option<Vec<String>>,
    servername: Option<String>,
    verify_peer: bool,
    ca_file: Option<PathBuf>,
    cert_status: bool,
    fingerprint: Option<Arc<dyn HelloFingerprint>>,
}

impl ClientConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self.max_version = Some(version);
        self
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphersuites = Some(ciphers.into());
        self
    }

    /// Set ALPN protocols in preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = Some(protocols.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Trust the CA certificates in a PEM file (implies nothing about verify_peer)
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Request OCSP staple from server
    pub fn cert_status(mut self, request: bool) -> Self {
        self.cert_status = request;
        self
    }

    /// Shape the ClientHello with a fingerprint
    pub fn fingerprint<F: HelloFingerprint + 'static>(mut self, fingerprint: F) -> Self {
        self.fingerprint = Some(Arc::new(fingerprint));
        self
    }

    /// Shape the ClientHello with a shared fingerprint
    pub fn fingerprint_arc(mut self, fingerprint: Arc<dyn HelloFingerprint>) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Whether ALPN protocols were set explicitly or by the fingerprint
    pub(crate) fn has_alpn(&self) -> bool {
        self.alpn.is_some() || self.fingerprint.as_ref().is_some_and(|f| f.alpn().is_some())
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;

        if let Some(fingerprint) = &self.fingerprint {
            fingerprint.apply_context(&mut ctx)?;
        }

        if let Some(min) = self.min_version {
            ctx.set_min_proto_version(Some(min.to_openssl_version()))?;
        }
        if let Some(max) = self.max_version {
            ctx.set_max_proto_version(Some(max.to_openssl_version()))?;
        }
        if let Some(ciphers) = &self.cipher_list {
            ctx.set_cipher_list(ciphers)?;
        }
        if let Some(suites) = &self.ciphersuites {
            ctx.set_ciphersuites(suites)?;
        }
        if let Some(protocols) = &self.alpn {
            ctx.set_alpn_protos(&alpn_wire(protocols)?)?;
        }

        if self.verify_peer {
            ctx.set_verify(SslVerifyMode::PEER);
            match &self.ca_file {
                Some(path) => ctx.set_ca_file(path)?,
                None => ctx.set_default_verify_paths()?,
            }
        } else {
            ctx.set_verify(SslVerifyMode::NONE);
        }

        let mut fingerprint = self.fingerprint;
        if self.cert_status && fingerprint.is_none() {
            fingerprint = Some(Arc::new(super::fingerprint::ClientHelloSpec::openssl_default().with_status_request(true)));
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            servername: self.servername,
            verify_peer: self.verify_peer,
            fingerprint,
        })
    }
}
