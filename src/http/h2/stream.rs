//! HTTP/2 client streams
//!
//! A `ClientStream` is the per-request rendezvous between the caller and
//! the connection's read loop. The read loop delivers the response head,
//! body bytes, trailers or a terminal error; the caller waits for the head
//! and then drains the body through `ResponseBody`.
//!
//! Protocol bookkeeping for a stream (flow-control windows, END_STREAM
//! flags, content-length accounting) lives in the connection's state table.
//! Only what the caller consumes is kept here, behind the stream's own lock,
//! which is always taken after the connection locks.

use super::client::ClientConn;
use super::error::{Error, Result};
use crate::http::cancel::{CancelGuard, CancelToken};
use crate::http::{Headers, Status};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Stream identifier type
pub type StreamId = u32;

/// Client stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// HEADERS written, waiting for the response head
    AwaitingHeaders,
    /// Final response head received, body still arriving
    Streaming,
    /// Peer sent END_STREAM
    Ended,
    /// Stream failed or was reset
    Aborted,
    /// Caller closed the body
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::AwaitingHeaders => "awaiting-headers",
            StreamState::Streaming => "streaming",
            StreamState::Ended => "ended",
            StreamState::Aborted => "aborted",
            StreamState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Final response head
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: Status,
    pub headers: Headers,
    /// END_STREAM arrived with the head and no body follows
    pub end_stream: bool,
}

struct Shared {
    state: StreamState,
    head: Option<ResponseHead>,
    chunks: VecDeque<Bytes>,
    buffered: usize,
    trailers: Option<Headers>,
    /// Delivered to the caller once buffered bytes are drained
    error: Option<Error>,
}

/// Caller-facing half of one HTTP/2 stream
pub struct ClientStream {
    id: StreamId,
    shared: Mutex<Shared>,
    cond: Condvar,
    body_written: AtomicBool,
}

impl ClientStream {
    pub(crate) fn new(id: StreamId) -> Self {
        ClientStream {
            id,
            shared: Mutex::new(Shared {
                state: StreamState::AwaitingHeaders,
                head: None,
                chunks: VecDeque::new(),
                buffered: 0,
                trailers: None,
                error: None,
            }),
            cond: Condvar::new(),
            body_written: AtomicBool::new(false),
        }
    }

    /// Stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wake anyone parked on this stream
    pub(crate) fn wake(&self) {
        let _shared = self.lock();
        self.cond.notify_all();
    }

    /// Request body bytes reached the wire
    pub(crate) fn mark_body_written(&self) {
        self.body_written.store(true, Ordering::Release);
    }

    pub(crate) fn body_written(&self) -> bool {
        self.body_written.load(Ordering::Acquire)
    }

    /// Deliver the final response head
    pub(crate) fn deliver_head(&self, status: Status, headers: Headers, end_stream: bool) {
        let mut shared = self.lock();
        if shared.state != StreamState::AwaitingHeaders {
            return;
        }
        shared.state = if end_stream {
            StreamState::Ended
        } else {
            StreamState::Streaming
        };
        shared.head = Some(ResponseHead {
            status,
            headers,
            end_stream,
        });
        self.cond.notify_all();
    }

    /// Append response body bytes
    ///
    /// Returns false when the caller already closed the body; the bytes
    /// are dropped and the caller of this function refunds them.
    pub(crate) fn push_data(&self, data: Bytes) -> bool {
        let mut shared = self.lock();
        if shared.state == StreamState::Closed {
            return false;
        }
        if !data.is_empty() {
            shared.buffered += data.len();
            shared.chunks.push_back(data);
            self.cond.notify_all();
        }
        true
    }

    /// Peer finished the response
    pub(crate) fn finish(&self, trailers: Option<Headers>) {
        let mut shared = self.lock();
        if shared.state == StreamState::Streaming {
            shared.state = StreamState::Ended;
            shared.trailers = trailers;
            self.cond.notify_all();
        }
    }

    /// Terminate the stream with an error
    ///
    /// Bytes already buffered are still readable before the error surfaces.
    /// A stream that already ended or failed is left alone.
    pub(crate) fn fail(&self, err: Error) {
        let mut shared = self.lock();
        match shared.state {
            StreamState::AwaitingHeaders | StreamState::Streaming => {
                shared.state = StreamState::Aborted;
                shared.error = Some(err);
                self.cond.notify_all();
            }
            _ => {}
        }
    }

    /// Caller stopped reading; returns how many unread bytes were discarded
    pub(crate) fn close_body(&self) -> usize {
        let mut shared = self.lock();
        let discarded = shared.buffered;
        shared.chunks.clear();
        shared.buffered = 0;
        if shared.state != StreamState::Ended || discarded > 0 {
            shared.state = StreamState::Closed;
        }
        self.cond.notify_all();
        discarded
    }

    /// Wait for the final response head
    pub(crate) fn wait_head(&self, token: &CancelToken) -> Result<ResponseHead> {
        let mut shared = self.lock();
        loop {
            if let Some(head) = shared.head.take() {
                return Ok(head);
            }
            if let Some(err) = &shared.error {
                return Err(err.clone());
            }
            token.check()?;
            shared = token.wait(&self.cond, shared);
        }
    }

    /// Read body bytes, blocking until some arrive or the stream ends
    ///
    /// Returns 0 at end of stream.
    pub(crate) fn read(&self, buf: &mut [u8], token: &CancelToken) -> Result<usize> {
        let mut shared = self.lock();
        loop {
            if let Some(front) = shared.chunks.front_mut() {
                let n = buf.len().min(front.len());
                buf[..n].copy_from_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    shared.chunks.pop_front();
                }
                shared.buffered -= n;
                return Ok(n);
            }
            match shared.state {
                StreamState::Ended | StreamState::Closed => return Ok(0),
                StreamState::Aborted => {
                    return Err(shared.error.clone().unwrap_or(Error::UnexpectedEof));
                }
                _ => {}
            }
            if buf.is_empty() {
                return Ok(0);
            }
            token.check()?;
            shared = token.wait(&self.cond, shared);
        }
    }

    /// Whether the peer's END_STREAM was seen and every byte consumed
    pub(crate) fn is_drained(&self) -> bool {
        let shared = self.lock();
        shared.state == StreamState::Ended && shared.buffered == 0
    }

    /// Trailers, once the stream has ended
    pub(crate) fn trailers(&self) -> Option<Headers> {
        let shared = self.lock();
        match shared.state {
            StreamState::Ended => shared.trailers.clone(),
            _ => None,
        }
    }
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn to_io(err: Error) -> io::Error {
    let kind = match &err {
        Error::UnexpectedEof => io::ErrorKind::UnexpectedEof,
        Error::Timeout => io::ErrorKind::TimedOut,
        Error::Cancelled => io::ErrorKind::Interrupted,
        Error::Io(e) => e.kind(),
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

/// Response body of an HTTP/2 stream
///
/// Each read returns flow-control credit to the server. Dropping or
/// closing the body before the end of the stream resets it.
pub struct ResponseBody {
    conn: ClientConn,
    stream: Arc<ClientStream>,
    token: CancelToken,
    _wake: CancelGuard,
    done: bool,
}

impl ResponseBody {
    pub(crate) fn new(conn: ClientConn, stream: Arc<ClientStream>, token: CancelToken) -> Self {
        let waker = Arc::downgrade(&stream);
        let wake = token.on_cancel(move || {
            if let Some(stream) = waker.upgrade() {
                stream.wake();
            }
        });
        ResponseBody {
            conn,
            stream,
            token,
            _wake: wake,
            done: false,
        }
    }

    /// Stream the body is read from
    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    /// Trailers, available once the body has been read to the end
    pub fn trailers(&self) -> Option<Headers> {
        self.stream.trailers()
    }

    /// Stop reading; resets the stream if the server is still sending
    pub fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if self.stream.is_drained() {
            return;
        }
        let discarded = self.stream.close_body();
        self.conn.cancel_stream(self.stream.id(), discarded);
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        match self.stream.read(buf, &self.token) {
            Ok(n) => {
                if n > 0 {
                    self.conn.release_inbound(self.stream.id(), n);
                }
                Ok(n)
            }
            Err(err) => {
                if matches!(err, Error::Cancelled | Error::Timeout) {
                    self.close();
                }
                Err(to_io(err))
            }
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.close();
    }
}
