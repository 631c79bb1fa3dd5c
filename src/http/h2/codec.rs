//! HTTP/2 frame encoding and decoding
//!
//! `FrameCodec` serializes outbound frames into a caller-owned buffer so a
//! connection can batch several frames into one write. `FrameReader` parses
//! inbound frames from any `Read`, enforcing the per-type size and stream
//! rules of RFC 7540 Section 6 and joining HEADERS with its CONTINUATION
//! frames before HPACK decoding.
//!
//! The reader is resumable: when the underlying reader returns a timeout,
//! bytes already received stay buffered and the next call picks up where
//! the previous one stopped.

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::hpack::HpackDecoder;
use super::settings::Settings;
use super::{CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE};
use crate::http::headers::{self, field_size};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

const READ_CHUNK: usize = 16 << 10;

/// Frame encoders
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        FrameHeader {
            length,
            kind: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    fn put_header(dst: &mut BytesMut, frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) {
        dst.put_slice(&Self::encode_header(frame_type, flags, stream_id, length));
    }

    /// Encode a DATA frame
    pub fn encode_data(frame: &DataFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.padding.is_some() {
            flags.set(FrameFlags::PADDED);
        }

        Self::put_header(dst, FrameType::Data, flags, frame.stream_id, frame.frame_size());
        if let Some(pad_len) = frame.padding {
            dst.put_u8(pad_len);
        }
        dst.put_slice(&frame.data);
        if let Some(pad_len) = frame.padding {
            dst.put_bytes(0, pad_len as usize);
        }
    }

    /// Encode a single HEADERS frame
    pub fn encode_headers(frame: &HeadersFrame, dst: &mut BytesMut) {
        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }
        if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
        }

        Self::put_header(dst, FrameType::Headers, flags, frame.stream_id, payload_len);
        if let Some(pad_len) = frame.padding {
            dst.put_u8(pad_len);
        }
        if let Some(priority) = &frame.priority {
            put_priority(priority, dst);
        }
        dst.put_slice(&frame.header_block);
        if let Some(pad_len) = frame.padding {
            dst.put_bytes(0, pad_len as usize);
        }
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation(stream_id: u32, fragment: &[u8], end_headers: bool, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        Self::put_header(dst, FrameType::Continuation, flags, stream_id, fragment.len());
        dst.put_slice(fragment);
    }

    /// Encode a complete header block as HEADERS followed by as many
    /// CONTINUATION frames as `max_frame_size` requires
    pub fn encode_header_block(
        stream_id: u32,
        block: &Bytes,
        end_stream: bool,
        priority: Option<PrioritySpec>,
        max_frame_size: usize,
        dst: &mut BytesMut,
    ) {
        let first_room = if priority.is_some() {
            max_frame_size - 5
        } else {
            max_frame_size
        };
        let first_len = block.len().min(first_room);
        let mut frame = HeadersFrame::new(stream_id, block.slice(..first_len), end_stream, first_len == block.len());
        frame.priority = priority;
        Self::encode_headers(&frame, dst);

        let mut rest = &block[first_len..];
        while !rest.is_empty() {
            let n = rest.len().min(max_frame_size);
            Self::encode_continuation(stream_id, &rest[..n], n == rest.len(), dst);
            rest = &rest[n..];
        }
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings(frame: &SettingsFrame, dst: &mut BytesMut) {
        if frame.ack {
            Self::put_header(dst, FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, 0);
            return;
        }
        Self::put_header(dst, FrameType::Settings, FrameFlags::empty(), 0, frame.settings.len() * 6);
        frame.settings.encode(dst);
    }

    /// Encode a PING frame
    pub fn encode_ping(frame: &PingFrame, dst: &mut BytesMut) {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };
        Self::put_header(dst, FrameType::Ping, flags, 0, 8);
        dst.put_slice(&frame.data);
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway(frame: &GoawayFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::Goaway, FrameFlags::empty(), 0, 8 + frame.debug_data.len());
        dst.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        dst.put_u32(frame.error_code.as_u32());
        dst.put_slice(&frame.debug_data);
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update(frame: &WindowUpdateFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        dst.put_u32(frame.size_increment & 0x7FFFFFFF);
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream(frame: &RstStreamFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        dst.put_u32(frame.error_code.as_u32());
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority(frame: &PriorityFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::Priority, FrameFlags::empty(), frame.stream_id, 5);
        put_priority(&frame.priority, dst);
    }
}

fn put_priority(priority: &PrioritySpec, dst: &mut BytesMut) {
    let mut dep = priority.stream_dependency & 0x7FFFFFFF;
    if priority.exclusive {
        dep |= 0x80000000;
    }
    dst.put_u32(dep);
    dst.put_u8(priority.weight);
}

fn parse_priority(buf: &[u8]) -> PrioritySpec {
    let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    PrioritySpec::new(raw & 0x7FFFFFFF, raw & 0x80000000 != 0, buf[4])
}

fn protocol_error(reason: impl Into<String>) -> Error {
    Error::connection(ErrorCode::ProtocolError, reason)
}

fn frame_size_error(reason: impl Into<String>) -> Error {
    Error::connection(ErrorCode::FrameSizeError, reason)
}

/// Remove the pad-length byte and trailing padding from a PADDED payload
fn strip_padding(payload: &mut Bytes, flags: FrameFlags, kind: &str) -> Result<Option<u8>> {
    if !flags.is_padded() {
        return Ok(None);
    }
    if payload.is_empty() {
        return Err(protocol_error(format!("padded {} frame without pad length", kind)));
    }
    let pad_len = payload.get_u8();
    if pad_len as usize > payload.len() {
        return Err(protocol_error(format!(
            "{} padding {} exceeds payload {}",
            kind,
            pad_len,
            payload.len()
        )));
    }
    payload.truncate(payload.len() - pad_len as usize);
    Ok(Some(pad_len))
}

/// Header block awaiting CONTINUATION frames
struct PendingBlock {
    stream_id: u32,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    block: BytesMut,
}

/// Inbound frame parser
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_read_frame_size: usize,
    max_header_list_size: u32,
    decoder: HpackDecoder,
    pending: Option<PendingBlock>,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader with the given local limits
    pub fn new(inner: R, max_read_frame_size: u32, max_header_list_size: u32, header_table_size: u32) -> Self {
        FrameReader {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_read_frame_size: max_read_frame_size as usize,
            max_header_list_size,
            decoder: HpackDecoder::new(header_table_size),
            pending: None,
        }
    }

    /// Create a reader with protocol default limits
    pub fn with_defaults(inner: R) -> Self {
        Self::new(inner, DEFAULT_MAX_FRAME_SIZE, u32::MAX, super::DEFAULT_HEADER_TABLE_SIZE)
    }

    /// Get a mutable reference to the underlying reader
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Read and check the client connection preface (server side)
    pub fn read_preface(&mut self) -> Result<()> {
        self.fill(CONNECTION_PREFACE.len())?;
        let got = self.buf.split_to(CONNECTION_PREFACE.len());
        if &got[..] != CONNECTION_PREFACE {
            return Err(protocol_error("invalid connection preface"));
        }
        Ok(())
    }

    fn fill(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            let start = self.buf.len();
            self.buf.resize(start + (n - start).max(READ_CHUNK), 0);
            match self.inner.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer").into());
                }
                Ok(read) => self.buf.truncate(start + read),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Read the next complete frame
    ///
    /// CONTINUATION frames never surface; they are folded into the
    /// HEADERS frame they continue. A `Stream` error leaves the reader
    /// usable; any other error is fatal to the connection.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            self.fill(FRAME_HEADER_SIZE)?;
            let mut raw = [0u8; FRAME_HEADER_SIZE];
            raw.copy_from_slice(&self.buf[..FRAME_HEADER_SIZE]);
            let header = FrameCodec::decode_header(&raw);

            if header.length > self.max_read_frame_size {
                return Err(frame_size_error(format!(
                    "frame length {} exceeds limit {}",
                    header.length, self.max_read_frame_size
                )));
            }

            self.fill(FRAME_HEADER_SIZE + header.length)?;
            self.buf.advance(FRAME_HEADER_SIZE);
            let payload = self.buf.split_to(header.length).freeze();

            if let Some(frame) = self.parse(header, payload)? {
                return Ok(frame);
            }
        }
    }

    fn parse(&mut self, header: FrameHeader, mut payload: Bytes) -> Result<Option<Frame>> {
        let stream_id = header.stream_id;
        let flags = header.flags;

        if let Some(pending) = &self.pending {
            if header.frame_type() != Some(FrameType::Continuation) || stream_id != pending.stream_id {
                return Err(protocol_error(format!(
                    "expected CONTINUATION for stream {}, got frame type 0x{:x} on stream {}",
                    pending.stream_id, header.kind, stream_id
                )));
            }
        }

        let Some(frame_type) = header.frame_type() else {
            return Ok(Some(Frame::Unknown {
                kind: header.kind,
                stream_id,
            }));
        };

        let frame = match frame_type {
            FrameType::Data => {
                if stream_id == 0 {
                    return Err(protocol_error("DATA frame on stream 0"));
                }
                let padding = strip_padding(&mut payload, flags, "DATA")?;
                Frame::Data(DataFrame {
                    stream_id,
                    data: payload,
                    end_stream: flags.is_end_stream(),
                    padding,
                })
            }
            FrameType::Headers => {
                if stream_id == 0 {
                    return Err(protocol_error("HEADERS frame on stream 0"));
                }
                strip_padding(&mut payload, flags, "HEADERS")?;
                let priority = if flags.is_priority() {
                    if payload.len() < 5 {
                        return Err(frame_size_error("HEADERS priority field truncated"));
                    }
                    let spec = parse_priority(&payload[..5]);
                    payload.advance(5);
                    Some(spec)
                } else {
                    None
                };
                let pending = PendingBlock {
                    stream_id,
                    end_stream: flags.is_end_stream(),
                    priority,
                    block: BytesMut::from(&payload[..]),
                };
                return self.continue_block(pending, flags.is_end_headers());
            }
            FrameType::Continuation => {
                let Some(mut pending) = self.pending.take() else {
                    return Err(protocol_error(format!(
                        "CONTINUATION on stream {} without open header block",
                        stream_id
                    )));
                };
                pending.block.extend_from_slice(&payload);
                return self.continue_block(pending, flags.is_end_headers());
            }
            FrameType::Priority => {
                if stream_id == 0 {
                    return Err(protocol_error("PRIORITY frame on stream 0"));
                }
                if payload.len() != 5 {
                    return Err(Error::stream(
                        stream_id,
                        ErrorCode::FrameSizeError,
                        format!("PRIORITY frame length {}", payload.len()),
                    ));
                }
                Frame::Priority(PriorityFrame {
                    stream_id,
                    priority: parse_priority(&payload),
                })
            }
            FrameType::RstStream => {
                if stream_id == 0 {
                    return Err(protocol_error("RST_STREAM frame on stream 0"));
                }
                if payload.len() != 4 {
                    return Err(frame_size_error(format!("RST_STREAM frame length {}", payload.len())));
                }
                Frame::RstStream(RstStreamFrame::new(stream_id, ErrorCode::from_wire(payload.get_u32())))
            }
            FrameType::Settings => {
                if stream_id != 0 {
                    return Err(protocol_error(format!("SETTINGS frame on stream {}", stream_id)));
                }
                if flags.is_ack() {
                    if !payload.is_empty() {
                        return Err(frame_size_error("SETTINGS ACK with payload"));
                    }
                    Frame::Settings(SettingsFrame::ack())
                } else {
                    Frame::Settings(SettingsFrame::new(Settings::decode(&payload)?))
                }
            }
            FrameType::PushPromise => {
                if stream_id == 0 {
                    return Err(protocol_error("PUSH_PROMISE frame on stream 0"));
                }
                strip_padding(&mut payload, flags, "PUSH_PROMISE")?;
                if payload.len() < 4 {
                    return Err(frame_size_error("PUSH_PROMISE frame truncated"));
                }
                Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id: payload.get_u32() & 0x7FFFFFFF,
                })
            }
            FrameType::Ping => {
                if stream_id != 0 {
                    return Err(protocol_error(format!("PING frame on stream {}", stream_id)));
                }
                if payload.len() != 8 {
                    return Err(frame_size_error(format!("PING frame length {}", payload.len())));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                })
            }
            FrameType::Goaway => {
                if stream_id != 0 {
                    return Err(protocol_error(format!("GOAWAY frame on stream {}", stream_id)));
                }
                if payload.len() < 8 {
                    return Err(frame_size_error(format!("GOAWAY frame length {}", payload.len())));
                }
                let last_stream_id = payload.get_u32() & 0x7FFFFFFF;
                let error_code = ErrorCode::from_wire(payload.get_u32());
                Frame::Goaway(GoawayFrame::new(last_stream_id, error_code, payload))
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(frame_size_error(format!("WINDOW_UPDATE frame length {}", payload.len())));
                }
                Frame::WindowUpdate(WindowUpdateFrame::new(stream_id, payload.get_u32() & 0x7FFFFFFF))
            }
        };
        Ok(Some(frame))
    }

    fn continue_block(&mut self, pending: PendingBlock, end_headers: bool) -> Result<Option<Frame>> {
        // An unterminated block may not grow without bound while we wait
        let raw_limit = (self.max_header_list_size as u64).saturating_mul(2);
        if pending.block.len() as u64 > raw_limit {
            return Err(Error::connection(
                ErrorCode::EnhanceYourCalm,
                format!("header block of {} bytes exceeds limit", pending.block.len()),
            ));
        }
        if !end_headers {
            self.pending = Some(pending);
            return Ok(None);
        }
        self.decode_block(pending).map(|meta| Some(Frame::Headers(meta)))
    }

    fn decode_block(&mut self, pending: PendingBlock) -> Result<MetaHeaders> {
        let limit = self.max_header_list_size as u64;
        let mut size = 0u64;
        let mut truncated = false;
        let mut invalid: Option<String> = None;
        let mut fields = Vec::new();

        self.decoder
            .decode(&pending.block, |name, value| {
                let (name, value) = match (String::from_utf8(name.into_owned()), String::from_utf8(value.into_owned())) {
                    (Ok(n), Ok(v)) => (n, v),
                    _ => {
                        invalid.get_or_insert_with(|| "header field is not valid UTF-8".to_string());
                        return;
                    }
                };
                size += field_size(&name, &value);
                if size > limit {
                    truncated = true;
                    return;
                }
                let bare = name.strip_prefix(':').unwrap_or(&name);
                if !headers::is_valid_name(bare) || bare.bytes().any(|b| b.is_ascii_uppercase()) || !headers::is_valid_value(&value) {
                    invalid.get_or_insert_with(|| format!("invalid header field {:?}", name));
                    return;
                }
                fields.push(HeaderField::new(name, value));
            })
            .map_err(|reason| Error::connection(ErrorCode::CompressionError, reason))?;

        if let Some(reason) = invalid {
            return Err(Error::stream(pending.stream_id, ErrorCode::ProtocolError, reason));
        }

        Ok(MetaHeaders {
            stream_id: pending.stream_id,
            end_stream: pending.end_stream,
            priority: pending.priority,
            fields,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::hpack::HpackEncoder;
    use crate::http::h2::settings::SettingsBuilder;
    use std::io::Cursor;

    fn reader(bytes: BytesMut) -> FrameReader<Cursor<Vec<u8>>> {
        FrameReader::with_defaults(Cursor::new(bytes.to_vec()))
    }

    fn header_block(fields: &[(&str, &str)]) -> Bytes {
        let mut encoder = HpackEncoder::new(4096);
        let mut block = BytesMut::new();
        encoder.encode(fields.iter().copied(), &mut block).unwrap();
        block.freeze()
    }

    #[test]
    fn test_encode_decode_header() {
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let header = FrameCodec::encode_header(FrameType::Headers, flags, 42, 1234);
        let decoded = FrameCodec::decode_header(&header);

        assert_eq!(decoded.frame_type(), Some(FrameType::Headers));
        assert_eq!(decoded.flags, flags);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.length, 1234);
    }

    #[test]
    fn test_encode_data_frame_with_padding() {
        let frame = DataFrame::new(1, Bytes::from("Hi"), false).with_padding(10);
        let mut buf = BytesMut::new();
        FrameCodec::encode_data(&frame, &mut buf);

        // 1 (pad length) + 2 (data) + 10 (padding)
        assert_eq!(buf[0..3], [0, 0, 13]);
        assert_eq!(buf[4] & FrameFlags::PADDED, FrameFlags::PADDED);
        assert_eq!(buf[9], 10);
        assert_eq!(&buf[10..12], b"Hi");
        assert_eq!(&buf[12..22], &[0u8; 10]);

        match reader(buf).read_frame().unwrap() {
            Frame::Data(data) => {
                assert_eq!(&data.data[..], b"Hi");
                assert_eq!(data.frame_size(), 13);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_settings_keep_wire_order() {
        let settings = SettingsBuilder::new()
            .header_table_size(65536)
            .enable_push(false)
            .initial_window_size(6291456)
            .max_header_list_size(262144)
            .build()
            .unwrap();
        let mut buf = BytesMut::new();
        FrameCodec::encode_settings(&SettingsFrame::new(settings), &mut buf);
        assert_eq!(buf[0..3], [0, 0, 24]);
        assert_eq!(&buf[9..11], &[0, 1]);
        assert_eq!(&buf[15..17], &[0, 2]);
        assert_eq!(&buf[21..23], &[0, 4]);
        assert_eq!(&buf[27..29], &[0, 6]);

        FrameCodec::encode_settings(&SettingsFrame::ack(), &mut buf);
        let mut reader = reader(buf);
        match reader.read_frame().unwrap() {
            Frame::Settings(frame) => {
                assert!(!frame.ack);
                assert_eq!(frame.settings.initial_window_size(), Some(6291456));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(reader.read_frame().unwrap(), Frame::Settings(f) if f.ack));
    }

    #[test]
    fn test_header_block_split_into_continuations() {
        let value = "v".repeat(40);
        let block = header_block(&[(":status", "200"), ("x-long", &value)]);
        let mut buf = BytesMut::new();
        FrameCodec::encode_header_block(3, &block, true, None, 16, &mut buf);

        // First frame is HEADERS without END_HEADERS
        assert_eq!(buf[3], FrameType::Headers.as_u8());
        assert_eq!(buf[4], FrameFlags::END_STREAM);

        match reader(buf).read_frame().unwrap() {
            Frame::Headers(meta) => {
                assert_eq!(meta.stream_id, 3);
                assert!(meta.end_stream);
                assert_eq!(meta.pseudo(":status"), Some("200"));
                assert_eq!(meta.fields[1].value, value);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_interleaved_frame_during_header_block_is_protocol_error() {
        let block = header_block(&[(":status", "200")]);
        let mut buf = BytesMut::new();
        FrameCodec::encode_headers(&HeadersFrame::new(1, block, false, false), &mut buf);
        FrameCodec::encode_ping(&PingFrame::new([0; 8]), &mut buf);

        let err = reader(buf).read_frame().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ProtocolError));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_continuation_without_headers_is_protocol_error() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_continuation(1, &[0x88], true, &mut buf);
        let err = reader(buf).read_frame().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_data(&DataFrame::new(1, Bytes::from(vec![0u8; 16385]), false), &mut buf);
        let err = reader(buf).read_frame().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FrameSizeError));
    }

    #[test]
    fn test_frame_size_rules() {
        let mut buf = BytesMut::new();
        buf.put_slice(&FrameCodec::encode_header(FrameType::Ping, FrameFlags::empty(), 0, 4));
        buf.put_u32(0);
        assert_eq!(reader(buf).read_frame().unwrap_err().code(), Some(ErrorCode::FrameSizeError));

        let mut buf = BytesMut::new();
        buf.put_slice(&FrameCodec::encode_header(FrameType::Priority, FrameFlags::empty(), 5, 4));
        buf.put_u32(0);
        let err = reader(buf).read_frame().unwrap_err();
        assert!(matches!(err, Error::Stream { stream_id: 5, code: ErrorCode::FrameSizeError, .. }));

        let mut buf = BytesMut::new();
        buf.put_slice(&FrameCodec::encode_header(FrameType::Settings, FrameFlags::empty(), 0, 7));
        buf.put_bytes(0, 7);
        assert_eq!(reader(buf).read_frame().unwrap_err().code(), Some(ErrorCode::FrameSizeError));
    }

    #[test]
    fn test_stream_id_rules() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_data(&DataFrame::new(0, Bytes::from("x"), false), &mut buf);
        assert_eq!(reader(buf).read_frame().unwrap_err().code(), Some(ErrorCode::ProtocolError));

        let mut buf = BytesMut::new();
        buf.put_slice(&FrameCodec::encode_header(FrameType::Ping, FrameFlags::empty(), 1, 8));
        buf.put_bytes(0, 8);
        assert_eq!(reader(buf).read_frame().unwrap_err().code(), Some(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_bad_padding_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_slice(&FrameCodec::encode_header(
            FrameType::Data,
            FrameFlags::from_u8(FrameFlags::PADDED),
            1,
            3,
        ));
        buf.put_slice(&[5, b'a', b'b']);
        assert_eq!(reader(buf).read_frame().unwrap_err().code(), Some(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_unknown_frame_type_is_surfaced_for_ignoring() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 2, 0xfa, 0, 0, 0, 0, 1, 0xde, 0xad]);
        FrameCodec::encode_ping(&PingFrame::new([7; 8]), &mut buf);

        let mut reader = reader(buf);
        assert!(matches!(reader.read_frame().unwrap(), Frame::Unknown { kind: 0xfa, stream_id: 1 }));
        assert!(matches!(reader.read_frame().unwrap(), Frame::Ping(p) if p.data == [7; 8]));
    }

    #[test]
    fn test_header_list_limit_truncates() {
        let block = header_block(&[(":status", "200"), ("x-a", "aaaaaaaaaa"), ("x-b", "bbbbbbbbbb")]);
        let mut buf = BytesMut::new();
        FrameCodec::encode_header_block(1, &block, false, None, 16384, &mut buf);

        // :status (7+3+32) plus x-a (3+10+32) fits; x-b does not
        let mut reader = FrameReader::new(Cursor::new(buf.to_vec()), 16384, 100, 4096);
        match reader.read_frame().unwrap() {
            Frame::Headers(meta) => {
                assert!(meta.truncated);
                assert_eq!(meta.fields.len(), 2);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_uppercase_header_name_is_stream_error() {
        let block = header_block(&[(":status", "200"), ("X-Upper", "1")]);
        let mut buf = BytesMut::new();
        FrameCodec::encode_header_block(7, &block, false, None, 16384, &mut buf);
        let err = reader(buf).read_frame().unwrap_err();
        assert!(matches!(err, Error::Stream { stream_id: 7, code: ErrorCode::ProtocolError, .. }));
    }

    /// A reader that times out after every chunk
    struct Choppy {
        data: Vec<u8>,
        pos: usize,
        timed_out: bool,
    }

    impl Read for Choppy {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"));
            }
            self.timed_out = false;
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_timeouts_do_not_lose_partial_frames() {
        let mut buf = BytesMut::new();
        FrameCodec::encode_window_update(&WindowUpdateFrame::new(3, 1000), &mut buf);
        let mut reader = FrameReader::with_defaults(Choppy {
            data: buf.to_vec(),
            pos: 0,
            timed_out: false,
        });

        let mut timeouts = 0;
        let frame = loop {
            match reader.read_frame() {
                Ok(frame) => break frame,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::TimedOut => timeouts += 1,
                Err(e) => panic!("unexpected error {}", e),
            }
        };
        assert!(timeouts > 1);
        assert!(matches!(frame, Frame::WindowUpdate(w) if w.stream_id == 3 && w.size_increment == 1000));
    }

    #[test]
    fn test_preface() {
        let mut buf = BytesMut::new();
        buf.put_slice(CONNECTION_PREFACE);
        FrameCodec::encode_settings(&SettingsFrame::new(Settings::new()), &mut buf);
        let mut reader = reader(buf);
        reader.read_preface().unwrap();
        assert!(matches!(reader.read_frame().unwrap(), Frame::Settings(_)));
    }
}
