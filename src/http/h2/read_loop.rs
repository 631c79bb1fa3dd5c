//! Connection read loop
//!
//! One thread per connection reads frames, updates the shared state and
//! routes payloads to their streams. It also runs the health check: after
//! `read_idle_timeout` without a frame it sends a PING, and if nothing
//! arrives within `ping_timeout` the connection is declared lost.

use super::client::{ClientConn, MAX_1XX_RESPONSES};
use super::codec::FrameReader;
use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::header_block::{parse_response, parse_trailers};
use super::stream::StreamId;
use crate::http::session::SessionReader;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Shortest poll interval while a deadline is pending
const MIN_POLL: Duration = Duration::from_millis(1);

pub(crate) struct ReadLoop {
    conn: ClientConn,
    reader: FrameReader<SessionReader>,
    /// Outstanding health-check PING and when it is due
    ping: Option<([u8; 8], Instant)>,
    last_frame: Instant,
    got_settings: bool,
}

impl ReadLoop {
    pub(crate) fn new(conn: ClientConn, reader: FrameReader<SessionReader>) -> Self {
        ReadLoop {
            conn,
            reader,
            ping: None,
            last_frame: Instant::now(),
            got_settings: false,
        }
    }

    pub(crate) fn run(mut self) {
        let err = match self.read_frames() {
            Ok(()) => Error::ClientConnClosed,
            Err(err) => err,
        };
        if let Error::Connection { code, reason } = &err {
            warn!(conn = self.conn.id(), code = %code, reason = %reason, "connection error, sending GOAWAY");
            let mut w = self.conn.inner.lock_write();
            w.write_goaway(0, *code);
            let _ = w.flush();
        }
        self.conn.fail_all(err);
    }

    fn read_frames(&mut self) -> Result<()> {
        loop {
            let timeout = self.next_timeout();
            self.reader.get_mut().set_timeout(timeout);

            let frame = match self.reader.read_frame() {
                Ok(frame) => frame,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::TimedOut => {
                    if self.on_timeout()? {
                        return Ok(());
                    }
                    continue;
                }
                Err(err @ Error::Stream { .. }) => {
                    self.reset_stream(err)?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.last_frame = Instant::now();
            self.ping = None;
            if !self.got_settings {
                match &frame {
                    Frame::Settings(s) if !s.ack => self.got_settings = true,
                    other => {
                        return Err(Error::connection(
                            ErrorCode::ProtocolError,
                            format!("expected SETTINGS as first frame, got {}", other.name()),
                        ))
                    }
                }
            }
            trace!(conn = self.conn.id(), frame = frame.name(), stream = frame.stream_id(), "frame received");

            match self.handle(frame) {
                Ok(()) => {}
                Err(err @ Error::Stream { .. }) => self.reset_stream(err)?,
                Err(err) => return Err(err),
            }

            let st = self.conn.inner.lock_state();
            if st.closed || st.should_close() {
                return Ok(());
            }
        }
    }

    fn handle(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Data(f) => self.on_data(f),
            Frame::Headers(meta) => self.on_headers(meta),
            Frame::Settings(f) => self.on_settings(f),
            Frame::WindowUpdate(f) => self.on_window_update(f),
            Frame::RstStream(f) => self.on_rst_stream(f),
            Frame::Ping(f) => self.on_ping(f),
            Frame::Goaway(f) => self.on_goaway(f),
            Frame::PushPromise(f) => Err(Error::connection(
                ErrorCode::ProtocolError,
                format!("PUSH_PROMISE on stream {} with push disabled", f.stream_id),
            )),
            Frame::Priority(_) | Frame::Unknown { .. } => Ok(()),
        }
    }

    /// Poll timeout covering the health check and the idle close
    fn next_timeout(&self) -> Option<Duration> {
        let config = &self.conn.inner.config;
        let now = Instant::now();

        let health = match self.ping {
            Some((_, due)) => Some(due),
            None => config.read_idle_timeout.map(|idle| self.last_frame + idle),
        };
        let idle = config.idle_timeout.map(|idle| {
            let since = self.conn.inner.lock_state().last_idle.unwrap_or(now);
            (since + idle).max(now + MIN_POLL)
        });

        [health, idle]
            .into_iter()
            .flatten()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now).max(MIN_POLL))
    }

    /// Returns true when the connection should close quietly
    fn on_timeout(&mut self) -> Result<bool> {
        let config = Arc::clone(&self.conn.inner.config);
        let now = Instant::now();

        match self.ping {
            Some((_, due)) if now >= due => {
                warn!(conn = self.conn.id(), timeout = ?config.ping_timeout, "health-check PING unanswered");
                return Err(Error::ConnectionLost);
            }
            Some(_) => {}
            None => {
                if let Some(idle) = config.read_idle_timeout {
                    if now >= self.last_frame + idle {
                        let data: [u8; 8] = rand::random();
                        let mut w = self.conn.inner.lock_write();
                        w.write_ping(PingFrame::new(data));
                        w.flush()?;
                        self.ping = Some((data, now + config.ping_timeout));
                        debug!(conn = self.conn.id(), idle = ?idle, "no frames received, sent health-check PING");
                    }
                }
            }
        }

        if let Some(idle) = config.idle_timeout {
            let mut st = self.conn.inner.lock_state();
            let unused = st.streams.is_empty() && st.reserved == 0 && st.pending_requests == 0;
            if unused && st.last_idle.is_some_and(|since| now >= since + idle) {
                st.do_not_reuse = true;
                debug!(conn = self.conn.id(), idle = ?idle, "closing idle connection");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reset one stream after a stream-scoped protocol error
    fn reset_stream(&mut self, err: Error) -> Result<()> {
        let (id, code) = match err {
            Error::Stream { stream_id, code, .. } => (stream_id, code),
            other => return Err(other),
        };
        let inner = &self.conn.inner;
        let entry = {
            let mut st = inner.lock_state();
            let entry = st.forget(id);
            inner.cond.notify_all();
            entry
        };
        debug!(conn = self.conn.id(), stream = id, error = %err, "resetting stream");
        if let Some(entry) = entry {
            entry.stream.fail(err);
        }
        let mut w = inner.lock_write();
        w.write_rst_stream(id, code);
        w.flush()
    }

    fn send_window_updates(&self, updates: &[(StreamId, u32)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut w = self.conn.inner.lock_write();
        for &(id, increment) in updates {
            w.write_window_update(id, increment);
        }
        w.flush()
    }

    fn on_data(&mut self, frame: DataFrame) -> Result<()> {
        let inner = Arc::clone(&self.conn.inner);
        let id = frame.stream_id;
        let flow_len = frame.frame_size() as u32;
        let data_len = frame.data.len() as u32;
        let mut updates = Vec::new();

        let outcome = {
            let mut guard = inner.lock_state();
            let st = &mut *guard;
            if id > st.max_opened_id || id % 2 == 0 {
                return Err(Error::connection(
                    ErrorCode::ProtocolError,
                    format!("DATA on idle stream {}", id),
                ));
            }
            if !st.conn_flow.recv_window_mut().take(flow_len) {
                return Err(Error::connection(
                    ErrorCode::FlowControlError,
                    "peer exceeded connection receive window",
                ));
            }

            let outcome = match st.streams.get_mut(&id) {
                // Stream already reset locally
                None => Err(None),
                Some(entry) if !entry.got_headers => Err(Some(Error::stream(
                    id,
                    ErrorCode::ProtocolError,
                    "DATA before response HEADERS",
                ))),
                Some(entry) if entry.recv_end => Err(Some(Error::stream(
                    id,
                    ErrorCode::StreamClosed,
                    "DATA after END_STREAM",
                ))),
                Some(entry) => {
                    if !entry.inflow.take(flow_len) {
                        return Err(Error::connection(
                            ErrorCode::FlowControlError,
                            format!("peer exceeded receive window of stream {}", id),
                        ));
                    }
                    entry.received += data_len as u64;
                    match entry.expected_len {
                        Some(expected) if entry.received > expected => Err(Some(Error::stream(
                            id,
                            ErrorCode::ProtocolError,
                            format!("response body exceeds content-length {}", expected),
                        ))),
                        _ => Ok(()),
                    }
                }
            };

            match outcome {
                Err(err) => {
                    if let Some(increment) = st.conn_flow.recv_window_mut().release(flow_len) {
                        updates.push((0, increment));
                    }
                    Err(err)
                }
                Ok(()) => {
                    let mut forget = false;
                    if let Some(entry) = st.streams.get_mut(&id) {
                        let accepted = entry.stream.push_data(frame.data);
                        let refund = if accepted { flow_len - data_len } else { flow_len };
                        if refund > 0 {
                            if let Some(increment) = entry.inflow.release(refund) {
                                if !frame.end_stream {
                                    updates.push((id, increment));
                                }
                            }
                        }
                        if frame.end_stream {
                            entry.recv_end = true;
                            match entry.expected_len {
                                Some(expected) if entry.received < expected => {
                                    entry.stream.fail(Error::UnexpectedEof);
                                }
                                _ => entry.stream.finish(None),
                            }
                            forget = entry.sent_end;
                        }
                        if refund > 0 {
                            if let Some(increment) = st.conn_flow.recv_window_mut().release(refund) {
                                updates.push((0, increment));
                            }
                        }
                    }
                    if forget {
                        st.forget(id);
                    }
                    if frame.end_stream {
                        inner.cond.notify_all();
                    }
                    Ok(())
                }
            }
        };

        self.send_window_updates(&updates)?;
        match outcome {
            Ok(()) | Err(None) => Ok(()),
            Err(Some(err)) => Err(err),
        }
    }

    fn on_headers(&mut self, meta: MetaHeaders) -> Result<()> {
        let inner = Arc::clone(&self.conn.inner);
        let id = meta.stream_id;
        let mut guard = inner.lock_state();
        let st = &mut *guard;
        if id > st.max_opened_id || id % 2 == 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                format!("HEADERS on idle stream {}", id),
            ));
        }
        let Some(entry) = st.streams.get_mut(&id) else {
            return Ok(());
        };
        if entry.recv_end {
            return Err(Error::stream(id, ErrorCode::StreamClosed, "HEADERS after END_STREAM"));
        }

        if !entry.got_headers {
            let (status, headers) = parse_response(&meta)?;
            if status.is_informational() {
                if status.code() == 101 {
                    return Err(Error::stream(id, ErrorCode::ProtocolError, "101 Switching Protocols over HTTP/2"));
                }
                if meta.end_stream {
                    return Err(Error::stream(id, ErrorCode::ProtocolError, "informational response with END_STREAM"));
                }
                entry.num_1xx += 1;
                if entry.num_1xx > MAX_1XX_RESPONSES {
                    return Err(Error::stream(id, ErrorCode::ProtocolError, "too many informational responses"));
                }
                trace!(conn = self.conn.id(), stream = id, status = status.code(), "informational response skipped");
                return Ok(());
            }

            entry.got_headers = true;
            entry.expected_len = if entry.is_head || status.code() == 204 || status.code() == 304 {
                None
            } else {
                headers.get("content-length").and_then(|v| v.trim().parse::<u64>().ok())
            };
            if meta.end_stream {
                entry.recv_end = true;
                if entry.expected_len.is_some_and(|n| n > 0) {
                    return Err(Error::stream(id, ErrorCode::ProtocolError, "END_STREAM before declared content-length"));
                }
            }
            debug!(conn = self.conn.id(), stream = id, status = status.code(), "response head received");
            entry.stream.deliver_head(status, headers, meta.end_stream);
        } else {
            if !meta.end_stream {
                return Err(Error::stream(id, ErrorCode::ProtocolError, "trailers without END_STREAM"));
            }
            let trailers = parse_trailers(&meta)?;
            entry.recv_end = true;
            match entry.expected_len {
                Some(expected) if entry.received < expected => entry.stream.fail(Error::UnexpectedEof),
                _ => entry.stream.finish(Some(trailers)),
            }
        }

        if entry.recv_end {
            if entry.sent_end {
                st.forget(id);
            }
            inner.cond.notify_all();
        }
        Ok(())
    }

    fn on_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            return Ok(());
        }
        let inner = &self.conn.inner;
        let mut w = inner.lock_write();
        {
            let mut st = inner.lock_state();
            let encoder = &mut w.encoder;
            st.apply_settings(&frame.settings, encoder)?;
            inner.cond.notify_all();
        }
        w.write_settings_ack();
        w.flush()?;
        debug!(conn = self.conn.id(), settings = %frame.settings, "peer SETTINGS applied");
        Ok(())
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) -> Result<()> {
        let inner = &self.conn.inner;
        let id = frame.stream_id;
        let mut st = inner.lock_state();
        if id == 0 {
            if frame.size_increment == 0 {
                return Err(Error::connection(ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment"));
            }
            st.conn_flow.increase_send_window(frame.size_increment)?;
        } else {
            if id > st.max_opened_id {
                return Err(Error::connection(
                    ErrorCode::ProtocolError,
                    format!("WINDOW_UPDATE on idle stream {}", id),
                ));
            }
            if let Some(entry) = st.streams.get_mut(&id) {
                if frame.size_increment == 0 {
                    return Err(Error::stream(id, ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment"));
                }
                if entry.outflow.increase(frame.size_increment).is_err() {
                    return Err(Error::stream(id, ErrorCode::FlowControlError, "stream send window overflow"));
                }
            }
        }
        inner.cond.notify_all();
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: RstStreamFrame) -> Result<()> {
        let inner = &self.conn.inner;
        let id = frame.stream_id;
        let entry = {
            let mut st = inner.lock_state();
            if id > st.max_opened_id {
                return Err(Error::connection(
                    ErrorCode::ProtocolError,
                    format!("RST_STREAM on idle stream {}", id),
                ));
            }
            let entry = st.forget(id);
            inner.cond.notify_all();
            entry
        };
        if let Some(entry) = entry {
            debug!(conn = self.conn.id(), stream = id, code = %frame.error_code, "stream reset by peer");
            entry.stream.fail(Error::StreamReset {
                stream_id: id,
                code: frame.error_code,
                remote: true,
            });
        }
        Ok(())
    }

    fn on_ping(&mut self, frame: PingFrame) -> Result<()> {
        let inner = &self.conn.inner;
        if frame.ack {
            let mut st = inner.lock_state();
            if st.pending_pings.remove(&frame.data) {
                inner.cond.notify_all();
            }
            return Ok(());
        }
        let mut w = inner.lock_write();
        w.write_ping(PingFrame::ack(frame.data));
        w.flush()
    }

    fn on_goaway(&mut self, frame: GoawayFrame) -> Result<()> {
        let inner = &self.conn.inner;
        let debug_data = frame.debug_str();
        if frame.error_code == ErrorCode::NoError {
            debug!(conn = self.conn.id(), last_stream = frame.last_stream_id, "server sent GOAWAY");
        } else {
            warn!(
                conn = self.conn.id(),
                last_stream = frame.last_stream_id,
                code = %frame.error_code,
                debug = %debug_data,
                "server sent GOAWAY"
            );
        }

        let refused = {
            let mut st = inner.lock_state();
            st.do_not_reuse = true;
            let ids: Vec<StreamId> = st
                .streams
                .keys()
                .copied()
                .filter(|&id| id > frame.last_stream_id)
                .collect();
            let refused: Vec<_> = ids.into_iter().filter_map(|id| st.forget(id)).collect();
            st.goaway = Some(frame.clone());
            inner.cond.notify_all();
            refused
        };
        for entry in refused {
            entry.stream.fail(Error::GoAway {
                code: frame.error_code,
                last_stream_id: frame.last_stream_id,
                debug_data: debug_data.clone(),
            });
        }
        Ok(())
    }
}
