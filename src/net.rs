//! TCP dialing
//!
//! Resolves an authority and opens a TCP connection to the first address
//! that accepts, with socket options suited to a multiplexed HTTP/2
//! connection (no Nagle delay, TCP keepalive).

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Connect to {0} timed out")]
    Timeout(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Socket options applied to dialed connections
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Connect timeout per resolved address (None = OS default)
    pub connect_timeout: Option<Duration>,
    /// TCP keepalive idle time (None = disabled)
    pub keepalive: Option<Duration>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        DialOptions {
            connect_timeout: Some(Duration::from_secs(30)),
            keepalive: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}

/// Resolve `host:port` into socket addresses
pub fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(addr.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Resolve(addr.to_string()));
    }
    Ok(addrs)
}

/// Dial `host:port`, trying each resolved address in order
pub fn dial(addr: &str, opts: &DialOptions) -> Result<TcpStream> {
    let mut last_err = None;

    for sa in resolve(addr)? {
        trace!(%addr, resolved = %sa, "dialing");
        match connect_one(&sa, opts) {
            Ok(stream) => {
                debug!(%addr, peer = %sa, "connected");
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(err) if err.kind() == io::ErrorKind::TimedOut => Err(Error::Timeout(addr.to_string())),
        Some(err) => Err(Error::Connect {
            addr: addr.to_string(),
            source: Arc::new(err),
        }),
        None => Err(Error::Resolve(addr.to_string())),
    }
}

fn connect_one(sa: &SocketAddr, opts: &DialOptions) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(*sa), Type::STREAM, Some(Protocol::TCP))?;
    let target = SockAddr::from(*sa);

    match opts.connect_timeout {
        Some(timeout) => socket.connect_timeout(&target, timeout)?,
        None => socket.connect(&target)?,
    }

    if opts.nodelay {
        socket.set_nodelay(true)?;
    }
    if let Some(idle) = opts.keepalive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_dial_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stream = dial(&addr, &DialOptions::default()).unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), addr);
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let err = dial(&addr, &DialOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
    }

    #[test]
    fn test_resolve_invalid() {
        assert!(matches!(resolve("no-port-here"), Err(Error::Resolve(_))));
    }
}
