//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! Sessions are shared between a connection's background reader and the
//! threads writing requests, so every operation takes `&self` and an
//! implementation must allow one reader and one writer at the same time.

use super::tls::TlsVars;
use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps: Send + Sync {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session; 0 means the peer closed
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Bound how long a single write may block
    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Close the session, unblocking any pending read
    fn close(&self) -> Result<()>;

    /// Protocol selected by ALPN, if any
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        None
    }

    /// TLS state for encrypted sessions
    fn tls_vars(&self) -> Option<TlsVars> {
        None
    }

    /// Write the whole buffer
    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(Error::ConnectionClosed),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Poll a raw descriptor, retrying on EINTR
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    // Round up so sub-millisecond waits do not turn into busy polls
    let timeout_ms = timeout
        .map(|d| d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    loop {
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::from(err));
        }
        return Ok(result > 0);
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.stream).read(buf).map_err(Error::from)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        (&self.stream).write(buf).map_err(map_write_error)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_write_timeout(timeout).map_err(Error::from)
    }

    fn close(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }
}

/// Writes that hit SO_SNDTIMEO surface as `Timeout`
pub(crate) fn map_write_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::from(err),
    }
}

/// Reader half of a shared session
///
/// Each read first polls with the configured timeout; an expired poll
/// surfaces as `io::ErrorKind::TimedOut` so the caller can run its idle
/// checks and resume reading.
pub struct SessionReader {
    session: Arc<dyn SessionOps>,
    timeout: Option<Duration>,
}

impl SessionReader {
    /// Create a reader over a shared session
    pub fn new(session: Arc<dyn SessionOps>) -> Self {
        SessionReader {
            session,
            timeout: None,
        }
    }

    /// Set the poll timeout for subsequent reads (None = wait forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

impl Read for SessionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout).map_err(to_io)? {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read idle timeout"));
        }
        self.session.read(buf).map_err(to_io)
    }
}

fn to_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => io::Error::new(e.kind(), e.to_string()),
        Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, "timeout"),
        Error::ConnectionClosed => io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
        other => io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_fd_session_ops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"Hello").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let session = FdSessionOps::new(stream);

        // Poll for read
        assert!(session.poll(PollEvents::Read, Some(Duration::from_secs(1))).unwrap());

        // Read data
        let mut buf = [0u8; 5];
        let n = session.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"Hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_session_reader_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Don't send anything - test timeout
        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let session: Arc<dyn SessionOps> = Arc::new(FdSessionOps::new(stream));
        let mut reader = SessionReader::new(session);
        reader.set_timeout(Some(Duration::from_millis(100)));

        let mut buf = [0u8; 10];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_close_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let session: Arc<dyn SessionOps> = Arc::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let reader_session = Arc::clone(&session);
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 4];
            SessionReader::new(reader_session).read(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        session.close().unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }
}
