//! Negotiated TLS parameters
//!
//! Captured once after the handshake and attached to every response read
//! over the session.

use openssl::nid::Nid;
use openssl::ssl::{NameType, SslRef};

/// TLS state negotiated by a handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsVars {
    /// Negotiated TLS version (e.g., "TLSv1.3")
    pub version: String,

    /// Negotiated cipher suite
    pub cipher: String,

    /// SNI servername sent in the ClientHello
    pub servername: Option<String>,

    /// Negotiated ALPN protocol
    pub alpn: Option<String>,

    /// Whether the session was resumed
    pub sess_reused: bool,

    /// Common name of the peer certificate subject
    pub peer_common_name: Option<String>,
}

impl TlsVars {
    /// Capture the negotiated state of an SSL connection
    pub fn from_ssl(ssl: &SslRef) -> Self {
        let peer_common_name = ssl.peer_certificate().and_then(|cert| {
            cert.subject_name()
                .entries_by_nid(Nid::COMMONNAME)
                .next()
                .and_then(|entry| entry.data().as_utf8().ok())
                .map(|cn| cn.to_string())
        });

        TlsVars {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()).unwrap_or_default(),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            sess_reused: ssl.session_reused(),
            peer_common_name,
        }
    }

    /// Whether ALPN selected HTTP/2
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some("h2")
    }
}
