//! ClientHello fingerprints
//!
//! Servers can identify a TLS client by the shape of its ClientHello: the
//! cipher suites it offers and in what order, its supported groups,
//! signature algorithms, ALPN list and which optional extensions are
//! present. A `HelloFingerprint` shapes those parameters so the handshake
//! resembles a particular client.
//!
//! OpenSSL decides the order of the extensions itself, so a fingerprint
//! controls which optional extensions appear and the order of every list
//! OpenSSL exposes, but not the extension order.

use super::config::{alpn_wire, TlsError, TlsVersion};
use openssl::ssl::{SslContextBuilder, SslOptions, SslRef, StatusType};
use std::fmt;

/// Hook that shapes the ClientHello
pub trait HelloFingerprint: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &str;

    /// ALPN protocols offered, if the fingerprint fixes them
    fn alpn(&self) -> Option<&[String]> {
        None
    }

    /// Apply context-wide settings (ciphers, groups, versions, ALPN)
    fn apply_context(&self, ctx: &mut SslContextBuilder) -> Result<(), TlsError>;

    /// Apply per-connection settings before the handshake
    fn apply_ssl(&self, ssl: &mut SslRef) -> Result<(), TlsError> {
        let _ = ssl;
        Ok(())
    }
}

/// Declarative ClientHello description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    /// Name for logging
    pub name: String,
    /// TLS 1.2 and below cipher list, in offer order (OpenSSL syntax)
    pub cipher_list: Option<String>,
    /// TLS 1.3 cipher suites, in offer order
    pub ciphersuites: Option<String>,
    /// supported_groups, in offer order (e.g. "X25519:P-256")
    pub groups: Option<String>,
    /// signature_algorithms, in offer order (e.g. "ECDSA+SHA256:RSA+SHA256")
    pub sigalgs: Option<String>,
    /// Lowest version offered
    pub min_version: Option<TlsVersion>,
    /// Highest version offered
    pub max_version: Option<TlsVersion>,
    /// ALPN protocols, in preference order
    pub alpn: Option<Vec<String>>,
    /// Offer the session_ticket extension
    pub session_ticket: bool,
    /// Offer the status_request (OCSP) extension
    pub status_request: bool,
}

impl ClientHelloSpec {
    /// The TLS library's own ClientHello
    pub fn openssl_default() -> Self {
        ClientHelloSpec {
            name: "openssl".to_string(),
            cipher_list: None,
            ciphersuites: None,
            groups: None,
            sigalgs: None,
            min_version: None,
            max_version: None,
            alpn: None,
            session_ticket: true,
            status_request: false,
        }
    }

    /// Chrome-like ClientHello
    pub fn chrome() -> Self {
        ClientHelloSpec {
            name: "chrome".to_string(),
            cipher_list: Some(
                [
                    "ECDHE-ECDSA-AES128-GCM-SHA256",
                    "ECDHE-RSA-AES128-GCM-SHA256",
                    "ECDHE-ECDSA-AES256-GCM-SHA384",
                    "ECDHE-RSA-AES256-GCM-SHA384",
                    "ECDHE-ECDSA-CHACHA20-POLY1305",
                    "ECDHE-RSA-CHACHA20-POLY1305",
                    "ECDHE-RSA-AES128-SHA",
                    "ECDHE-RSA-AES256-SHA",
                    "AES128-GCM-SHA256",
                    "AES256-GCM-SHA384",
                    "AES128-SHA",
                    "AES256-SHA",
                ]
                .join(":"),
            ),
            ciphersuites: Some("TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256".to_string()),
            groups: Some("X25519:P-256:P-384".to_string()),
            sigalgs: Some(
                "ECDSA+SHA256:RSA-PSS+SHA256:RSA+SHA256:ECDSA+SHA384:RSA-PSS+SHA384:RSA+SHA384:RSA-PSS+SHA512:RSA+SHA512"
                    .to_string(),
            ),
            min_version: Some(TlsVersion::Tls12),
            max_version: Some(TlsVersion::Tls13),
            alpn: Some(vec!["h2".to_string(), "http/1.1".to_string()]),
            session_ticket: true,
            status_request: true,
        }
    }

    /// Firefox-like ClientHello
    pub fn firefox() -> Self {
        ClientHelloSpec {
            name: "firefox".to_string(),
            cipher_list: Some(
                [
                    "ECDHE-ECDSA-AES128-GCM-SHA256",
                    "ECDHE-RSA-AES128-GCM-SHA256",
                    "ECDHE-ECDSA-CHACHA20-POLY1305",
                    "ECDHE-RSA-CHACHA20-POLY1305",
                    "ECDHE-ECDSA-AES256-GCM-SHA384",
                    "ECDHE-RSA-AES256-GCM-SHA384",
                    "ECDHE-ECDSA-AES256-SHA",
                    "ECDHE-ECDSA-AES128-SHA",
                    "ECDHE-RSA-AES128-SHA",
                    "ECDHE-RSA-AES256-SHA",
                    "AES128-GCM-SHA256",
                    "AES256-GCM-SHA384",
                    "AES128-SHA",
                    "AES256-SHA",
                ]
                .join(":"),
            ),
            ciphersuites: Some("TLS_AES_128_GCM_SHA256:TLS_CHACHA20_POLY1305_SHA256:TLS_AES_256_GCM_SHA384".to_string()),
            groups: Some("X25519:P-256:P-384:P-521".to_string()),
            sigalgs: Some(
                "ECDSA+SHA256:ECDSA+SHA384:ECDSA+SHA512:RSA-PSS+SHA256:RSA-PSS+SHA384:RSA-PSS+SHA512:RSA+SHA256:RSA+SHA384:RSA+SHA512"
                    .to_string(),
            ),
            min_version: Some(TlsVersion::Tls12),
            max_version: Some(TlsVersion::Tls13),
            alpn: Some(vec!["h2".to_string(), "http/1.1".to_string()]),
            session_ticket: true,
            status_request: true,
        }
    }

    /// ClientHello of Go's crypto/tls defaults
    pub fn golang() -> Self {
        ClientHelloSpec {
            name: "golang".to_string(),
            cipher_list: Some(
                [
                    "ECDHE-ECDSA-AES128-GCM-SHA256",
                    "ECDHE-RSA-AES128-GCM-SHA256",
                    "ECDHE-ECDSA-AES256-GCM-SHA384",
                    "ECDHE-RSA-AES256-GCM-SHA384",
                    "ECDHE-ECDSA-CHACHA20-POLY1305",
                    "ECDHE-RSA-CHACHA20-POLY1305",
                ]
                .join(":"),
            ),
            ciphersuites: Some("TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256".to_string()),
            groups: Some("X25519:P-256:P-384:P-521".to_string()),
            sigalgs: None,
            min_version: Some(TlsVersion::Tls12),
            max_version: Some(TlsVersion::Tls13),
            alpn: Some(vec!["h2".to_string(), "http/1.1".to_string()]),
            session_ticket: true,
            status_request: true,
        }
    }

    /// Replace the ALPN list
    pub fn with_alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = Some(protocols.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Toggle the status_request extension
    pub fn with_status_request(mut self, enabled: bool) -> Self {
        self.status_request = enabled;
        self
    }

    /// Toggle the session_ticket extension
    pub fn with_session_ticket(mut self, enabled: bool) -> Self {
        self.session_ticket = enabled;
        self
    }
}

impl HelloFingerprint for ClientHelloSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn alpn(&self) -> Option<&[String]> {
        self.alpn.as_deref()
    }

    fn apply_context(&self, ctx: &mut SslContextBuilder) -> Result<(), TlsError> {
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
        if let Some(groups) = &self.groups {
            ctx.set_groups_list(groups)?;
        }
        if let Some(sigalgs) = &self.sigalgs {
            ctx.set_sigalgs_list(sigalgs)?;
        }
        if let Some(protocols) = &self.alpn {
            ctx.set_alpn_protos(&alpn_wire(protocols)?)?;
        }
        if !self.session_ticket {
            ctx.set_options(SslOptions::NO_TICKET);
        }
        Ok(())
    }

    fn apply_ssl(&self, ssl: &mut SslRef) -> Result<(), TlsError> {
        if self.status_request {
            ssl.set_status_type(StatusType::OCSP)?;
        }
        Ok(())
    }
}

impl fmt::Display for ClientHelloSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
