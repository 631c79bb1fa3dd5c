//! HTTP/2 client connection
//!
//! A `ClientConn` owns one transport session. Callers issue requests with
//! `round_trip` from any thread; a dedicated read-loop thread decodes
//! inbound frames and hands them to the streams they belong to.
//!
//! # Locking
//!
//! Each connection has three locks, always taken in this order:
//!
//! 1. `admission`: one request at a time between reserving a stream slot
//!    and writing its HEADERS, so HEADERS go out in arrival order
//! 2. `write`: the outbound byte path, the HPACK encoder and the stream-ID
//!    counter
//! 3. `state`: the stream table, flow-control windows and peer settings
//!
//! A stream's own lock is only ever taken after these. Waiters park on the
//! condition variable paired with `state` (or `admission`), and cancellation
//! callbacks lock each mutex on its own before notifying.

use super::codec::{FrameCodec, FrameReader};
use super::config::{ConnConfig, LocalLimits};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::{sendable, ConnectionFlowControl, FlowControlWindow, InboundWindow};
use super::frames::*;
use super::header_block::{check_list_size, encode_fields, request_fields, trailer_fields};
use super::hpack::HpackEncoder;
use super::read_loop::ReadLoop;
use super::settings::{Settings, SettingsParameter};
use super::stream::{ClientStream, ResponseBody, StreamId};
use super::{CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_STREAM_ID};
use crate::http::cancel::{CancelGuard, CancelToken};
use crate::http::session::{SessionOps, SessionReader};
use crate::http::tls::TlsVars;
use crate::http::{Body, Method, Request, Response, Version};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;
use tracing::{debug, trace};

/// Largest request body chunk read at once
const MAX_BODY_CHUNK: usize = 512 << 10;

/// Informational responses tolerated before the final one
pub(crate) const MAX_1XX_RESPONSES: u8 = 5;

/// Peer limit on concurrent streams once SETTINGS arrived without one
const DEFAULT_MAX_CONCURRENT_AFTER_SETTINGS: u32 = 1000;

/// Peer limit on concurrent streams before its SETTINGS arrive
const INITIAL_MAX_CONCURRENT_STREAMS: u32 = 100;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Peer SETTINGS in effect
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerSettings {
    pub(crate) max_frame_size: u32,
    pub(crate) max_concurrent_streams: u32,
    pub(crate) header_table_size: u32,
    pub(crate) max_header_list_size: u64,
    pub(crate) initial_window_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        PeerSettings {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: INITIAL_MAX_CONCURRENT_STREAMS,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_header_list_size: u64::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
        }
    }
}

/// Protocol bookkeeping for one open stream
pub(crate) struct StreamEntry {
    pub(crate) stream: Arc<ClientStream>,
    pub(crate) outflow: FlowControlWindow,
    pub(crate) inflow: InboundWindow,
    pub(crate) sent_end: bool,
    pub(crate) recv_end: bool,
    pub(crate) got_headers: bool,
    pub(crate) num_1xx: u8,
    pub(crate) expected_len: Option<u64>,
    pub(crate) received: u64,
    pub(crate) is_head: bool,
}

impl StreamEntry {
    fn new(stream: Arc<ClientStream>, send_window: u32, recv_window: u32) -> Self {
        StreamEntry {
            stream,
            outflow: FlowControlWindow::with_initial_size(send_window),
            inflow: InboundWindow::new(recv_window),
            sent_end: false,
            recv_end: false,
            got_headers: false,
            num_1xx: 0,
            expected_len: None,
            received: 0,
            is_head: false,
        }
    }
}

/// Connection state guarded by the `state` lock
pub(crate) struct ConnState {
    pub(crate) streams: HashMap<StreamId, StreamEntry>,
    pub(crate) max_opened_id: StreamId,
    pub(crate) reserved: usize,
    pub(crate) pending_requests: usize,
    pub(crate) conn_flow: ConnectionFlowControl,
    pub(crate) peer: PeerSettings,
    pub(crate) seen_settings: bool,
    pub(crate) goaway: Option<GoawayFrame>,
    pub(crate) closed: bool,
    pub(crate) closing: bool,
    pub(crate) do_not_reuse: bool,
    pub(crate) last_active: Instant,
    pub(crate) last_idle: Option<Instant>,
    pub(crate) pending_pings: HashSet<[u8; 8]>,
    pub(crate) conn_err: Option<Error>,
}

impl ConnState {
    pub(crate) fn new(recv_window: u32) -> Self {
        let now = Instant::now();
        ConnState {
            streams: HashMap::new(),
            max_opened_id: 0,
            reserved: 0,
            pending_requests: 0,
            conn_flow: ConnectionFlowControl::with_initial_sizes(DEFAULT_INITIAL_WINDOW_SIZE, recv_window),
            peer: PeerSettings::default(),
            seen_settings: false,
            goaway: None,
            closed: false,
            closing: false,
            do_not_reuse: false,
            last_active: now,
            last_idle: Some(now),
            pending_pings: HashSet::new(),
            conn_err: None,
        }
    }

    /// Apply a SETTINGS frame from the peer
    pub(crate) fn apply_settings(&mut self, settings: &Settings, encoder: &mut HpackEncoder) -> Result<()> {
        settings.validate()?;
        for setting in settings.iter() {
            match setting.parameter() {
                Some(SettingsParameter::MaxFrameSize) => self.peer.max_frame_size = setting.value,
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    self.peer.max_concurrent_streams = setting.value;
                }
                Some(SettingsParameter::MaxHeaderListSize) => {
                    self.peer.max_header_list_size = setting.value as u64;
                }
                Some(SettingsParameter::HeaderTableSize) => {
                    self.peer.header_table_size = setting.value;
                    encoder.set_peer_table_size(setting.value);
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    let delta = setting.value as i64 - self.peer.initial_window_size as i64;
                    for entry in self.streams.values_mut() {
                        entry.outflow.apply_delta(delta)?;
                    }
                    self.peer.initial_window_size = setting.value;
                }
                _ => {}
            }
        }
        if !self.seen_settings {
            if settings.max_concurrent_streams().is_none() {
                self.peer.max_concurrent_streams = DEFAULT_MAX_CONCURRENT_AFTER_SETTINGS;
            }
            self.seen_settings = true;
        }
        Ok(())
    }

    /// Drop a stream from the table
    pub(crate) fn forget(&mut self, id: StreamId) -> Option<StreamEntry> {
        let entry = self.streams.remove(&id);
        if entry.is_some() && self.streams.is_empty() {
            self.last_idle = Some(Instant::now());
        }
        entry
    }

    /// Whether the connection has nothing left to do and should close
    pub(crate) fn should_close(&self) -> bool {
        !self.closed
            && self.streams.is_empty()
            && self.reserved == 0
            && self.pending_requests == 0
            && (self.do_not_reuse || self.closing || self.goaway.is_some())
    }

    fn accepts_new_requests(&self, strict: bool) -> bool {
        if self.closed || self.closing || self.do_not_reuse || self.goaway.is_some() {
            return false;
        }
        if strict {
            return true;
        }
        (self.streams.len() + self.reserved + self.pending_requests) < self.peer.max_concurrent_streams as usize
    }
}

/// Outbound half: everything that must be serialized onto the wire in order
pub(crate) struct WriteHalf {
    session: Arc<dyn SessionOps>,
    buf: BytesMut,
    pub(crate) encoder: HpackEncoder,
    next_stream_id: StreamId,
    err: Option<Error>,
}

impl WriteHalf {
    fn new(session: Arc<dyn SessionOps>, max_encoder_table_size: u32) -> Self {
        WriteHalf {
            session,
            buf: BytesMut::with_capacity(16 << 10),
            encoder: HpackEncoder::new(max_encoder_table_size),
            next_stream_id: 1,
            err: None,
        }
    }

    pub(crate) fn write_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        FrameCodec::encode_rst_stream(&RstStreamFrame::new(stream_id, code), &mut self.buf);
    }

    pub(crate) fn write_window_update(&mut self, stream_id: StreamId, increment: u32) {
        FrameCodec::encode_window_update(&WindowUpdateFrame::new(stream_id, increment), &mut self.buf);
    }

    pub(crate) fn write_ping(&mut self, frame: PingFrame) {
        FrameCodec::encode_ping(&frame, &mut self.buf);
    }

    pub(crate) fn write_settings_ack(&mut self) {
        FrameCodec::encode_settings(&SettingsFrame::ack(), &mut self.buf);
    }

    pub(crate) fn write_goaway(&mut self, last_stream_id: StreamId, code: ErrorCode) {
        FrameCodec::encode_goaway(&GoawayFrame::new(last_stream_id, code, Bytes::new()), &mut self.buf);
    }

    /// Write out everything queued
    ///
    /// The first failure sticks: the session is closed and every later
    /// flush returns the same error.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if let Some(err) = &self.err {
            self.buf.clear();
            return Err(err.clone());
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = self.session.write_all(&self.buf);
        self.buf.clear();
        if let Err(err) = result {
            let err = Error::from(err);
            self.err = Some(err.clone());
            let _ = self.session.close();
            return Err(err);
        }
        Ok(())
    }
}

pub(crate) struct ConnInner {
    pub(crate) id: u64,
    pub(crate) session: Arc<dyn SessionOps>,
    pub(crate) config: Arc<ConnConfig>,
    pub(crate) limits: LocalLimits,
    admission: Mutex<bool>,
    admission_cond: Condvar,
    pub(crate) write: Mutex<WriteHalf>,
    pub(crate) state: Mutex<ConnState>,
    pub(crate) cond: Condvar,
    tls: Option<TlsVars>,
    dead_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ConnInner {
    pub(crate) fn lock_write(&self) -> MutexGuard<'_, WriteHalf> {
        lock(&self.write)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        lock(&self.state)
    }

    /// Wake every thread parked on this connection
    fn wake_all(&self) {
        {
            let _busy = lock(&self.admission);
            self.admission_cond.notify_all();
        }
        let _state = self.lock_state();
        self.cond.notify_all();
    }
}

/// Releases the admission slot when dropped
struct Admission<'a> {
    inner: &'a ConnInner,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        *lock(&self.inner.admission) = false;
        self.inner.admission_cond.notify_one();
    }
}

/// A request between admission and its stream being opened
struct PendingRequest<'a> {
    conn: &'a ClientConn,
    armed: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = &self.conn.inner;
        let close = {
            let mut st = inner.lock_state();
            st.pending_requests = st.pending_requests.saturating_sub(1);
            inner.cond.notify_all();
            st.should_close()
        };
        if close {
            self.conn.close();
        }
    }
}

/// A stream slot held on a connection
///
/// Dropping it unused gives the slot back.
pub struct Reservation {
    conn: ClientConn,
    used: bool,
}

impl Reservation {
    /// Connection the slot is held on
    pub fn conn(&self) -> &ClientConn {
        &self.conn
    }

    /// Send `req` in the reserved slot
    pub fn round_trip(mut self, req: &mut Request) -> Result<Response> {
        self.used = true;
        self.conn.send_request(req, true)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.used {
            self.conn.release_reservation();
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("conn", &self.conn.id())
            .field("used", &self.used)
            .finish()
    }
}

/// Snapshot of a connection's load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnState {
    /// The connection is closed
    pub closed: bool,
    /// A graceful shutdown is in progress
    pub closing: bool,
    /// Streams currently open
    pub streams_active: usize,
    /// Slots reserved through `reserve_new_request` and not yet used
    pub streams_reserved: usize,
    /// Requests waiting for a stream slot
    pub streams_pending: usize,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS (or the working default)
    pub max_concurrent_streams: u32,
    /// When the connection last became idle, if it is idle now
    pub last_idle: Option<Instant>,
}

/// HTTP/2 client connection
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ClientConn {
    pub(crate) inner: Arc<ConnInner>,
}

impl ClientConn {
    /// Start HTTP/2 on an established session
    ///
    /// Writes the connection preface, the initial SETTINGS and the first
    /// connection WINDOW_UPDATE, then starts the read loop.
    pub fn new(session: Arc<dyn SessionOps>, config: Arc<ConnConfig>) -> Result<Self> {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let limits = config.local_limits();
        session.set_write_timeout(config.write_byte_timeout)?;

        let settings = config.initial_settings();
        let increment = config.initial_window_update();

        let mut write = WriteHalf::new(Arc::clone(&session), config.max_encoder_header_table_size);
        write.buf.extend_from_slice(CONNECTION_PREFACE);
        FrameCodec::encode_settings(&SettingsFrame::new(settings.clone()), &mut write.buf);
        let mut state = ConnState::new(DEFAULT_INITIAL_WINDOW_SIZE);
        if increment > 0 {
            write.write_window_update(0, increment);
            state.conn_flow.recv_window_mut().grow(increment);
        }
        write.flush()?;

        let conn = ClientConn {
            inner: Arc::new(ConnInner {
                id,
                tls: session.tls_vars(),
                session: Arc::clone(&session),
                config: Arc::clone(&config),
                limits,
                admission: Mutex::new(false),
                admission_cond: Condvar::new(),
                write: Mutex::new(write),
                state: Mutex::new(state),
                cond: Condvar::new(),
                dead_hook: Mutex::new(None),
            }),
        };

        let reader = FrameReader::new(
            SessionReader::new(session),
            limits.max_read_frame_size,
            limits.max_header_list_size,
            limits.header_table_size,
        );
        let read_loop = ReadLoop::new(conn.clone(), reader);
        thread::Builder::new()
            .name(format!("h2-conn-{}", id))
            .spawn(move || read_loop.run())
            .map_err(Error::from)?;

        debug!(
            conn = id,
            fingerprint = config.fingerprint_name(),
            settings = %settings,
            window_update = increment,
            "HTTP/2 connection started"
        );
        Ok(conn)
    }

    /// Connection identifier used in logs
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// TLS state of the session, if encrypted
    pub fn tls_vars(&self) -> Option<&TlsVars> {
        self.inner.tls.as_ref()
    }

    /// Whether the connection is closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Whether a new request could be started on this connection now
    pub fn can_take_new_request(&self) -> bool {
        let strict = self.inner.config.strict_max_concurrent_streams;
        self.inner.lock_state().accepts_new_requests(strict)
    }

    /// Reserve a stream slot for a request that will follow
    ///
    /// Returns None if the connection cannot take another request. The slot
    /// is used by [`Reservation::round_trip`] and given back if the
    /// reservation is dropped unused.
    pub fn reserve_new_request(&self) -> Option<Reservation> {
        let strict = self.inner.config.strict_max_concurrent_streams;
        let mut st = self.inner.lock_state();
        if !st.accepts_new_requests(strict) {
            return None;
        }
        st.reserved += 1;
        Some(Reservation {
            conn: self.clone(),
            used: false,
        })
    }

    fn release_reservation(&self) {
        let close = {
            let mut st = self.inner.lock_state();
            st.reserved = st.reserved.saturating_sub(1);
            self.inner.cond.notify_all();
            st.should_close()
        };
        if close {
            self.close();
        }
    }

    /// Stop handing this connection out for new requests
    pub fn set_do_not_reuse(&self) {
        let close = {
            let mut st = self.inner.lock_state();
            st.do_not_reuse = true;
            st.should_close()
        };
        if close {
            self.close();
        }
    }

    /// Current load and lifecycle flags
    pub fn state(&self) -> ClientConnState {
        let st = self.inner.lock_state();
        ClientConnState {
            closed: st.closed,
            closing: st.closing,
            streams_active: st.streams.len(),
            streams_reserved: st.reserved,
            streams_pending: st.pending_requests,
            max_concurrent_streams: st.peer.max_concurrent_streams,
            last_idle: if st.streams.is_empty() { st.last_idle } else { None },
        }
    }

    /// Call `hook` once when the connection dies
    pub(crate) fn on_dead<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = lock(&self.inner.dead_hook);
        if self.inner.lock_state().closed {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Send a request and wait for the response head
    ///
    /// The request body, if any, is sent from a separate thread while this
    /// call waits. The request's cancel token bounds the whole exchange,
    /// including reads of the response body.
    pub fn round_trip(&self, req: &mut Request) -> Result<Response> {
        self.send_request(req, false)
    }

    fn send_request(&self, req: &mut Request, reserved: bool) -> Result<Response> {
        let inner = &*self.inner;
        let token = req.cancel_token().clone();
        let mut pending = self.begin_request(reserved);
        token.check()?;

        // A reader behind a zero length must be empty
        if req.body().content_length() == Some(0) {
            if let Some(mut reader) = req.body_mut().take_reader() {
                if read_some(&mut reader, &mut [0u8; 1])? > 0 {
                    return Err(Error::BodyTooLong);
                }
            }
        }

        let waker = Arc::downgrade(&self.inner);
        let _wake = token.on_cancel(move || {
            if let Some(inner) = waker.upgrade() {
                inner.wake_all();
            }
        });

        {
            let mut busy = lock(&inner.admission);
            while *busy {
                token.check()?;
                busy = token.wait(&inner.admission_cond, busy);
            }
            *busy = true;
        }
        let admission = Admission { inner };

        self.await_stream_slot(&token)?;

        let pseudo_order = inner.config.pseudo_order();
        let fields = request_fields(req, &pseudo_order, inner.config.header_order())?;
        let trailers = match req.trailers() {
            Some(t) if !t.is_empty() => Some(trailer_fields(t)?),
            _ => None,
        };
        let declared = req.body().content_length();
        let body = match declared {
            Some(0) => None,
            _ => req.body_mut().take_reader(),
        };
        let end_stream = body.is_none() && trailers.is_none();
        let is_head = req.method() == Method::Head;

        let stream = {
            let mut w = inner.lock_write();
            if w.err.is_some() {
                return Err(Error::ClientConnUnusable);
            }
            let (id, max_frame_size, stream) = {
                let mut st = inner.lock_state();
                if st.closed || st.goaway.is_some() || st.do_not_reuse {
                    return Err(Error::ClientConnUnusable);
                }
                check_list_size(&fields, st.peer.max_header_list_size)?;
                let id = w.next_stream_id;
                if id > MAX_STREAM_ID {
                    st.do_not_reuse = true;
                    return Err(Error::ClientConnUnusable);
                }
                w.next_stream_id += 2;

                let stream = Arc::new(ClientStream::new(id));
                let mut entry = StreamEntry::new(
                    Arc::clone(&stream),
                    st.peer.initial_window_size,
                    inner.limits.stream_window,
                );
                entry.sent_end = end_stream;
                entry.is_head = is_head;
                st.streams.insert(id, entry);
                st.pending_requests -= 1;
                pending.armed = false;
                st.max_opened_id = id;
                st.last_active = Instant::now();
                st.last_idle = None;
                if req.wants_close() {
                    st.do_not_reuse = true;
                }
                (id, st.peer.max_frame_size, stream)
            };

            let mut block = BytesMut::new();
            if let Err(err) = encode_fields(&mut w.encoder, &fields, &mut block) {
                drop(w);
                self.abort_stream(&stream, ErrorCode::InternalError, err.clone());
                return Err(err);
            }
            FrameCodec::encode_header_block(
                id,
                &block.freeze(),
                end_stream,
                inner.config.headers_priority(),
                max_frame_size as usize,
                &mut w.buf,
            );
            trace!(conn = inner.id, stream = id, method = %req.method(), path = req.path(), "HEADERS sent");
            if let Err(err) = w.flush() {
                drop(w);
                self.fail_all(err.clone());
                return Err(err);
            }
            stream
        };
        drop(admission);

        let stream_waker = Arc::downgrade(&stream);
        let _stream_wake = token.on_cancel(move || {
            if let Some(stream) = stream_waker.upgrade() {
                stream.wake();
            }
        });

        if !end_stream {
            self.spawn_body_writer(Arc::clone(&stream), body, declared, trailers, token.clone());
        }

        let head = match stream.wait_head(&token) {
            Ok(head) => head,
            Err(err) => {
                if matches!(err, Error::Cancelled | Error::Timeout) {
                    stream.fail(err.clone());
                    self.cancel_stream(stream.id(), stream.close_body());
                }
                if err.is_retryable() && stream.body_written() {
                    return Err(Error::AfterRequestBody(Box::new(err)));
                }
                return Err(err);
            }
        };

        let body = if is_head || head.end_stream {
            if !head.end_stream {
                self.cancel_stream(stream.id(), stream.close_body());
            }
            Body::Empty
        } else {
            Body::H2(ResponseBody::new(self.clone(), Arc::clone(&stream), token.clone()))
        };

        Ok(Response::new(head.status, head.headers, body)
            .with_version(Version::Http2)
            .with_tls(inner.tls.clone()))
    }

    /// Count a request as pending until its stream is opened
    ///
    /// A `reserved` request turns its reservation into the pending count.
    fn begin_request(&self, reserved: bool) -> PendingRequest<'_> {
        let mut st = self.inner.lock_state();
        if reserved {
            st.reserved = st.reserved.saturating_sub(1);
        }
        st.pending_requests += 1;
        PendingRequest { conn: self, armed: true }
    }

    /// Wait until the peer's concurrency limit leaves room for one more stream
    fn await_stream_slot(&self, token: &CancelToken) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.lock_state();
        loop {
            if st.closed || st.goaway.is_some() || st.do_not_reuse {
                return Err(Error::ClientConnUnusable);
            }
            token.check()?;
            if st.streams.len() < st.peer.max_concurrent_streams as usize {
                return Ok(());
            }
            st = token.wait(&inner.cond, st);
        }
    }

    fn spawn_body_writer(
        &self,
        stream: Arc<ClientStream>,
        body: Option<Box<dyn Read + Send>>,
        declared: Option<u64>,
        trailers: Option<Vec<HeaderField>>,
        token: CancelToken,
    ) {
        let conn = self.clone();
        let writer_stream = Arc::clone(&stream);
        let spawned = thread::Builder::new()
            .name(format!("h2-body-{}-{}", self.inner.id, stream.id()))
            .spawn(move || {
                let waker = Arc::downgrade(&conn.inner);
                let _wake: CancelGuard = token.on_cancel(move || {
                    if let Some(inner) = waker.upgrade() {
                        inner.wake_all();
                    }
                });
                if let Err(err) = conn.write_body(&writer_stream, body, declared, trailers, &token) {
                    debug!(conn = conn.id(), stream = writer_stream.id(), error = %err, "request body failed");
                    conn.abort_stream(&writer_stream, ErrorCode::Cancel, err);
                }
            });
        if let Err(err) = spawned {
            self.abort_stream(&stream, ErrorCode::InternalError, Error::from(err));
        }
    }

    /// Send the request body, then trailers or END_STREAM
    fn write_body(
        &self,
        stream: &ClientStream,
        body: Option<Box<dyn Read + Send>>,
        declared: Option<u64>,
        trailers: Option<Vec<HeaderField>>,
        token: &CancelToken,
    ) -> Result<()> {
        let id = stream.id();
        if let Some(mut reader) = body {
            let max_frame_size = self.inner.lock_state().peer.max_frame_size as usize;
            let mut cap = max_frame_size.min(MAX_BODY_CHUNK);
            if let Some(len) = declared {
                cap = cap.min(len.saturating_add(1).min(MAX_BODY_CHUNK as u64) as usize);
            }
            let mut buf = vec![0u8; cap.max(1)];
            let mut sent: u64 = 0;

            loop {
                let want = match declared {
                    Some(len) => (len - sent).saturating_add(1).min(buf.len() as u64) as usize,
                    None => buf.len(),
                };
                let n = read_some(&mut reader, &mut buf[..want])?;
                token.check()?;
                let mut eof = n == 0;
                if let Some(len) = declared {
                    let total = sent + n as u64;
                    if total > len {
                        return Err(Error::BodyTooLong);
                    }
                    if eof && total < len {
                        return Err(Error::BodyTooShort { sent: total, declared: len });
                    }
                    if !eof && total == len {
                        // Confirm the reader is done so END_STREAM rides on this chunk
                        let mut probe = [0u8; 1];
                        if read_some(&mut reader, &mut probe)? > 0 {
                            return Err(Error::BodyTooLong);
                        }
                        eof = true;
                    }
                }

                let end_stream = eof && trailers.is_none();
                if n > 0 || end_stream {
                    if !self.send_data(stream, &buf[..n], end_stream, token)? {
                        return Ok(());
                    }
                    sent += n as u64;
                }
                if eof {
                    break;
                }
            }
        } else if trailers.is_none() && !self.send_data(stream, &[], true, token)? {
            return Ok(());
        }

        if let Some(fields) = trailers {
            let mut w = self.inner.lock_write();
            let (max_frame_size, limit) = {
                let st = self.inner.lock_state();
                if !st.streams.contains_key(&id) {
                    return Ok(());
                }
                (st.peer.max_frame_size, st.peer.max_header_list_size)
            };
            check_list_size(&fields, limit)?;
            let mut block = BytesMut::new();
            encode_fields(&mut w.encoder, &fields, &mut block)?;
            FrameCodec::encode_header_block(id, &block.freeze(), true, None, max_frame_size as usize, &mut w.buf);
            w.flush()?;
            trace!(conn = self.inner.id, stream = id, "trailers sent");
        }

        let close = {
            let mut st = self.inner.lock_state();
            let finished = match st.streams.get_mut(&id) {
                Some(entry) => {
                    entry.sent_end = true;
                    entry.recv_end
                }
                None => false,
            };
            if finished {
                st.forget(id);
                self.inner.cond.notify_all();
            }
            st.should_close()
        };
        if close {
            self.close();
        }
        Ok(())
    }

    /// Send `data` as DATA frames within the flow-control windows
    ///
    /// Returns false once the stream stopped accepting data.
    fn send_data(&self, stream: &ClientStream, mut data: &[u8], end_stream: bool, token: &CancelToken) -> Result<bool> {
        let id = stream.id();
        loop {
            let n = match self.await_flow(id, data.len(), token)? {
                Some(n) => n,
                None => return Ok(false),
            };
            let last = n == data.len();
            {
                let mut w = self.inner.lock_write();
                if !self.inner.lock_state().streams.contains_key(&id) {
                    return Ok(false);
                }
                let frame = DataFrame::new(id, Bytes::copy_from_slice(&data[..n]), last && end_stream);
                FrameCodec::encode_data(&frame, &mut w.buf);
                w.flush()?;
            }
            if n > 0 {
                stream.mark_body_written();
            }
            data = &data[n..];
            if last {
                return Ok(true);
            }
        }
    }

    /// Take up to `want` bytes of send window for stream `id`
    ///
    /// Blocks while either window is exhausted. Returns None when the
    /// stream is gone, or when the peer already ended its response; the
    /// stream is then cancelled so the peer stops waiting for the body.
    fn await_flow(&self, id: StreamId, want: usize, token: &CancelToken) -> Result<Option<usize>> {
        let inner = &*self.inner;
        let mut guard = inner.lock_state();
        loop {
            let st = &mut *guard;
            if st.closed {
                return Err(st.conn_err.clone().unwrap_or(Error::ClientConnClosed));
            }
            let entry = match st.streams.get_mut(&id) {
                Some(entry) => entry,
                None => return Ok(None),
            };
            if entry.recv_end {
                drop(guard);
                self.cancel_stream(id, 0);
                return Ok(None);
            }
            if want == 0 {
                return Ok(Some(0));
            }
            let max = want.min(st.peer.max_frame_size as usize);
            let n = sendable(st.conn_flow.send_window(), &entry.outflow, max);
            if n > 0 {
                entry.outflow.consume(n);
                st.conn_flow.consume_send_window(n);
                return Ok(Some(n));
            }
            token.check()?;
            guard = token.wait(&inner.cond, guard);
        }
    }

    /// Fail a stream locally and reset it
    pub(crate) fn abort_stream(&self, stream: &ClientStream, code: ErrorCode, err: Error) {
        let id = stream.id();
        let (present, close) = {
            let mut st = self.inner.lock_state();
            let present = st.forget(id).is_some();
            self.inner.cond.notify_all();
            (present, st.should_close())
        };
        stream.fail(err);
        if present {
            let mut w = self.inner.lock_write();
            w.write_rst_stream(id, code);
            let _ = w.flush();
            debug!(conn = self.inner.id, stream = id, code = %code, "stream reset");
        }
        if close {
            self.close();
        }
    }

    /// Stop a stream the caller no longer wants
    ///
    /// `discarded` response bytes that were buffered but never read are
    /// returned to the connection window.
    pub(crate) fn cancel_stream(&self, id: StreamId, discarded: usize) {
        let (present, conn_increment, close) = {
            let mut st = self.inner.lock_state();
            let present = st.forget(id).is_some();
            let conn_increment = if discarded > 0 {
                st.conn_flow.recv_window_mut().release(discarded as u32)
            } else {
                None
            };
            self.inner.cond.notify_all();
            (present, conn_increment, st.should_close())
        };
        if present || conn_increment.is_some() {
            let mut w = self.inner.lock_write();
            if present {
                w.write_rst_stream(id, ErrorCode::Cancel);
            }
            if let Some(increment) = conn_increment {
                w.write_window_update(0, increment);
            }
            let _ = w.flush();
            if present {
                debug!(conn = self.inner.id, stream = id, "stream cancelled");
            }
        }
        if close {
            self.close();
        }
    }

    /// Return consumed response bytes to the peer's send windows
    pub(crate) fn release_inbound(&self, id: StreamId, n: usize) {
        let n = n as u32;
        let (conn_increment, stream_increment) = {
            let mut st = self.inner.lock_state();
            let conn_increment = st.conn_flow.recv_window_mut().release(n);
            let stream_increment = match st.streams.get_mut(&id) {
                Some(entry) if !entry.recv_end => entry.inflow.release(n),
                _ => None,
            };
            (conn_increment, stream_increment)
        };
        if conn_increment.is_none() && stream_increment.is_none() {
            return;
        }
        let mut w = self.inner.lock_write();
        if let Some(increment) = conn_increment {
            w.write_window_update(0, increment);
        }
        if let Some(increment) = stream_increment {
            w.write_window_update(id, increment);
        }
        let _ = w.flush();
    }

    /// Round-trip a PING and wait for its acknowledgement
    pub fn ping(&self, token: &CancelToken) -> Result<()> {
        let inner = &*self.inner;
        let data: [u8; 8] = rand::random();
        let waker = Arc::downgrade(&self.inner);
        let _wake = token.on_cancel(move || {
            if let Some(inner) = waker.upgrade() {
                inner.wake_all();
            }
        });

        {
            let mut st = inner.lock_state();
            if st.closed {
                return Err(st.conn_err.clone().unwrap_or(Error::ClientConnClosed));
            }
            st.pending_pings.insert(data);
        }
        {
            let mut w = inner.lock_write();
            w.write_ping(PingFrame::new(data));
            if let Err(err) = w.flush() {
                inner.lock_state().pending_pings.remove(&data);
                return Err(err);
            }
        }

        let mut st = inner.lock_state();
        loop {
            if !st.pending_pings.contains(&data) {
                return Ok(());
            }
            if st.closed {
                st.pending_pings.remove(&data);
                return Err(st.conn_err.clone().unwrap_or(Error::ClientConnClosed));
            }
            if let Err(cancelled) = token.check() {
                st.pending_pings.remove(&data);
                return Err(cancelled.into());
            }
            st = token.wait(&inner.cond, st);
        }
    }

    /// Close gracefully: send GOAWAY, wait for open streams, then close
    ///
    /// If `token` fires first the connection is left open and the
    /// cancellation is returned.
    pub fn shutdown(&self, token: &CancelToken) -> Result<()> {
        let inner = &*self.inner;
        let waker = Arc::downgrade(&self.inner);
        let _wake = token.on_cancel(move || {
            if let Some(inner) = waker.upgrade() {
                inner.wake_all();
            }
        });

        {
            let mut st = inner.lock_state();
            if st.closed {
                return Ok(());
            }
            st.closing = true;
        }
        {
            let mut w = inner.lock_write();
            w.write_goaway(0, ErrorCode::NoError);
            if let Err(err) = w.flush() {
                drop(w);
                self.fail_all(err.clone());
                return Err(err);
            }
        }
        debug!(conn = inner.id, "graceful shutdown started");

        let mut st = inner.lock_state();
        while !st.streams.is_empty() && !st.closed {
            token.check()?;
            st = token.wait(&inner.cond, st);
        }
        drop(st);
        self.close();
        Ok(())
    }

    /// Close now, failing every open stream
    pub fn close(&self) {
        self.fail_all(Error::ClientConnClosed);
    }

    /// Close the connection if it has no streams or reservations
    pub fn close_if_idle(&self) -> bool {
        let idle = {
            let st = self.inner.lock_state();
            st.streams.is_empty() && st.reserved == 0 && st.pending_requests == 0
        };
        if idle {
            self.close();
        }
        idle
    }

    /// Tear the connection down with `err`
    pub(crate) fn fail_all(&self, err: Error) {
        let inner = &*self.inner;
        let (streams, goaway) = {
            let mut st = inner.lock_state();
            if st.closed {
                return;
            }
            st.closed = true;
            st.conn_err = Some(err.clone());
            let streams: Vec<Arc<ClientStream>> = st.streams.drain().map(|(_, entry)| entry.stream).collect();
            inner.cond.notify_all();
            (streams, st.goaway.clone())
        };
        {
            let _busy = lock(&inner.admission);
            inner.admission_cond.notify_all();
        }

        let after_goaway = goaway.filter(|_| matches!(err, Error::Io(_) | Error::Http(_)));
        for stream in streams {
            let stream_err = match &after_goaway {
                Some(g) => Error::GoAwayClosed {
                    code: g.error_code,
                    last_stream_id: g.last_stream_id,
                    debug_data: g.debug_str(),
                },
                None => err.clone(),
            };
            stream.fail(stream_err);
        }

        let _ = inner.session.close();
        debug!(conn = inner.id, reason = %err, "HTTP/2 connection closed");

        let hook = lock(&inner.dead_hook).take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

fn read_some(reader: &mut Box<dyn Read + Send>, buf: &mut [u8]) -> Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}
