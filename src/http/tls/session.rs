//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections.
//!
//! The handshake runs in blocking mode. Afterwards the socket switches to
//! non-blocking so a reader thread and a writer thread can share one
//! `SslStream`: each OpenSSL call runs under a short lock, and a call that
//! wants more I/O releases the lock and polls the socket before retrying.

use super::config::{TlsConfig, TlsError};
use super::vars::TlsVars;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{ErrorCode, HandshakeError, Ssl, SslStream};
use std::io;
use std::net::{IpAddr, Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// TLS session operations
///
/// Implements SessionOps for TLS-encrypted connections. Safe to share
/// between one reading and one writing thread.
pub struct TlsSessionOps {
    stream: Mutex<SslStream<TcpStream>>,
    fd: RawFd,
    vars: TlsVars,
    write_timeout: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

/// Outcome of one non-blocking OpenSSL call
enum Step<T> {
    Done(T),
    Wait(PollEvents),
}

impl TlsSessionOps {
    /// Perform a client handshake over `tcp_stream`
    ///
    /// `servername` is sent as SNI and, when peer verification is on,
    /// checked against the certificate.
    pub fn connect(
        tcp_stream: TcpStream,
        config: &TlsConfig,
        servername: Option<&str>,
    ) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;

        if let Some(fingerprint) = &config.fingerprint {
            fingerprint.apply_ssl(&mut ssl)?;
        }

        if let Some(name) = servername {
            ssl.set_hostname(name)?;
            if config.verify_peer {
                match name.parse::<IpAddr>() {
                    Ok(ip) => ssl.param_mut().set_ip(ip)?,
                    Err(_) => ssl.param_mut().set_host(name)?,
                }
            }
        }

        let stream = match ssl.connect(tcp_stream) {
            Ok(stream) => stream,
            Err(HandshakeError::SetupFailure(e)) => return Err(TlsError::OpenSsl(e)),
            Err(HandshakeError::Failure(mid)) => {
                return Err(TlsError::HandshakeFailed(mid.error().to_string()));
            }
            Err(HandshakeError::WouldBlock(_)) => {
                return Err(TlsError::HandshakeFailed("handshake timed out".to_string()));
            }
        };

        // Handshake deadlines set by the dialer no longer apply
        let tcp = stream.get_ref();
        tcp.set_read_timeout(None)?;
        tcp.set_write_timeout(None)?;
        tcp.set_nonblocking(true)?;

        let vars = TlsVars::from_ssl(stream.ssl());
        debug!(
            version = %vars.version,
            cipher = %vars.cipher,
            alpn = ?vars.alpn,
            fingerprint = ?config.fingerprint_name(),
            "TLS handshake complete"
        );

        Ok(TlsSessionOps {
            fd: tcp.as_raw_fd(),
            stream: Mutex::new(stream),
            vars,
            write_timeout: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Negotiated TLS state
    pub fn vars(&self) -> &TlsVars {
        &self.vars
    }

    fn lock(&self) -> MutexGuard<'_, SslStream<TcpStream>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Classify an OpenSSL error from a non-blocking call
    fn step<T>(err: openssl::ssl::Error, eof: T) -> HttpResult<Step<T>> {
        match err.code() {
            ErrorCode::WANT_READ => Ok(Step::Wait(PollEvents::Read)),
            ErrorCode::WANT_WRITE => Ok(Step::Wait(PollEvents::Write)),
            ErrorCode::ZERO_RETURN => Ok(Step::Done(eof)),
            ErrorCode::SYSCALL => match err.io_error().map(|e| e.kind()) {
                Some(io::ErrorKind::WouldBlock) => Ok(Step::Wait(PollEvents::Read)),
                Some(_) => match err.into_io_error() {
                    Ok(e) => Err(Error::from(e)),
                    Err(e) => Err(Error::from(io::Error::other(e))),
                },
                // Peer closed without close_notify
                None => Ok(Step::Done(eof)),
            },
            _ => Err(Error::from(io::Error::other(err))),
        }
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        if matches!(events, PollEvents::Read | PollEvents::Both) && self.lock().ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.fd, events, timeout)
    }

    fn read(&self, buf: &mut [u8]) -> HttpResult<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            let result = self.lock().ssl_read(buf);
            let wait = match result {
                Ok(n) => return Ok(n),
                Err(e) => match Self::step(e, 0)? {
                    Step::Done(n) => return Ok(n),
                    Step::Wait(events) => events,
                },
            };
            poll_fd(self.fd, wait, None)?;
        }
    }

    fn write(&self, buf: &[u8]) -> HttpResult<usize> {
        let deadline = self
            .write_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| Instant::now() + t);

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            let result = self.lock().ssl_write(buf);
            let wait = match result {
                Ok(n) => return Ok(n),
                Err(e) => match Self::step(e, 0)? {
                    Step::Done(_) => return Err(Error::ConnectionClosed),
                    Step::Wait(events) => events,
                },
            };
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(rem) if !rem.is_zero() => Some(rem),
                    _ => return Err(Error::Timeout),
                },
                None => None,
            };
            if !poll_fd(self.fd, wait, remaining)? {
                return Err(Error::Timeout);
            }
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> HttpResult<()> {
        *self.write_timeout.lock().unwrap_or_else(|e| e.into_inner()) = timeout;
        Ok(())
    }

    fn close(&self) -> HttpResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut stream = self.lock();
            // Best effort close_notify; the socket is non-blocking
            let _ = stream.shutdown();
        }
        match self.lock().get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.vars.alpn.as_ref().map(|p| p.as_bytes().to_vec())
    }

    fn tls_vars(&self) -> Option<TlsVars> {
        Some(self.vars.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tls::TlsVersion;
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, Private};
    use openssl::ssl::{select_next_proto, AlpnError, SslAcceptor, SslMethod};
    use openssl::x509::{X509NameBuilder, X509};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn self_signed() -> (PKey<Private>, X509) {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (key, builder.build())
    }

    fn acceptor() -> SslAcceptor {
        let (key, cert) = self_signed();
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        builder.set_private_key(&key).unwrap();
        builder.set_certificate(&cert).unwrap();
        builder.set_alpn_select_callback(|_, client| {
            select_next_proto(b"\x02h2", client).ok_or(AlpnError::NOACK)
        });
        builder.build()
    }

    #[test]
    fn test_tls_handshake_and_duplex_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let mut tls = acceptor.accept(tcp).unwrap();
            let mut buf = [0u8; 5];
            io::Read::read_exact(&mut tls, &mut buf).unwrap();
            assert_eq!(&buf, b"Hello");
            io::Write::write_all(&mut tls, b"World").unwrap();
        });

        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .alpn(&["h2", "http/1.1"])
            .build()
            .unwrap();
        let session = Arc::new(config.connect_to(TcpStream::connect(addr).unwrap(), "localhost").unwrap());

        assert_eq!(session.alpn_protocol(), Some(b"h2".to_vec()));
        let vars = session.tls_vars().unwrap();
        assert_eq!(vars.version, "TLSv1.3");
        assert_eq!(vars.servername.as_deref(), Some("localhost"));
        assert_eq!(vars.peer_common_name.as_deref(), Some("localhost"));

        // Reader on another thread while this one writes
        let reader = Arc::clone(&session);
        let read = thread::spawn(move || {
            let mut out = Vec::new();
            let mut buf = [0u8; 16];
            while out.len() < 5 {
                let n = reader.read(&mut buf).unwrap();
                assert!(n > 0);
                out.extend_from_slice(&buf[..n]);
            }
            out
        });

        session.write_all(b"Hello").unwrap();
        assert_eq!(read.join().unwrap(), b"World");
        server.join().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn test_verify_peer_rejects_self_signed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let _ = acceptor.accept(tcp);
        });

        let config = TlsConfig::client().verify_peer(true).build().unwrap();
        let result = config.connect_to(TcpStream::connect(addr).unwrap(), "localhost");
        assert!(matches!(result, Err(TlsError::HandshakeFailed(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_close_unblocks_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let _tls = acceptor.accept(tcp).unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let config = TlsConfig::client().build().unwrap();
        let session = Arc::new(config.connect(TcpStream::connect(addr).unwrap()).unwrap());
        let reader = Arc::clone(&session);
        let read = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        session.close().unwrap();
        assert_eq!(read.join().unwrap().unwrap(), 0);
        server.join().unwrap();
    }
}
