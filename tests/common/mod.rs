//! Scripted HTTP/2 peer for integration tests
//!
//! The peer runs on its own thread and speaks frames through the crate's
//! public codec, so each test controls exactly what the client sees.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use h2fetch::http::h2::codec::{FrameCodec, FrameReader};
use h2fetch::http::h2::frames::{
    DataFrame, GoawayFrame, MetaHeaders, PingFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame,
};
use h2fetch::http::h2::hpack::HpackEncoder;
use h2fetch::http::h2::{ClientConn, ConnConfig, ErrorCode, Frame, Settings, SettingsParameter};
use h2fetch::http::{FdSessionOps, SessionOps};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::ssl::{select_next_proto, AlpnError, SslAcceptor, SslAcceptorBuilder, SslMethod, SslStream};
use openssl::x509::{X509Builder, X509NameBuilder};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long the peer waits on a silent client before failing the test
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// MAX_CONCURRENT_STREAMS announced by the peer; seeing it on the client
/// means the peer's SETTINGS were applied
pub const PEER_MAX_STREAMS: u32 = 50;

/// Server side of one connection
pub struct Peer<S: Read + Write> {
    reader: FrameReader<S>,
    encoder: HpackEncoder,
}

impl<S: Read + Write> Peer<S> {
    pub fn new(stream: S) -> Self {
        Peer {
            reader: FrameReader::with_defaults(stream),
            encoder: HpackEncoder::new(4096),
        }
    }

    /// Read the preface and the client's SETTINGS, then send `extra`
    /// settings (plus MAX_CONCURRENT_STREAMS) and ACK the client's
    pub fn handshake(&mut self, extra: &[(SettingsParameter, u32)]) -> Settings {
        self.reader.read_preface().unwrap();
        let client_settings = match self.reader.read_frame().unwrap() {
            Frame::Settings(f) if !f.ack => f.settings,
            other => panic!("expected SETTINGS, got {:?}", other),
        };

        let mut settings = Settings::new();
        settings.set(SettingsParameter::MaxConcurrentStreams, PEER_MAX_STREAMS);
        for &(param, value) in extra {
            settings.set(param, value);
        }
        let mut buf = BytesMut::new();
        FrameCodec::encode_settings(&SettingsFrame::new(settings), &mut buf);
        FrameCodec::encode_settings(&SettingsFrame::ack(), &mut buf);
        self.write(&buf);
        client_settings
    }

    /// Next frame, whatever it is
    pub fn read_frame(&mut self) -> Frame {
        self.reader.read_frame().unwrap()
    }

    /// Next frame, skipping SETTINGS ACKs and connection WINDOW_UPDATEs
    pub fn next_frame(&mut self) -> Frame {
        loop {
            match self.read_frame() {
                Frame::Settings(f) if f.ack => continue,
                Frame::WindowUpdate(f) if f.stream_id == 0 => continue,
                frame => return frame,
            }
        }
    }

    /// Next frame, or None once the client has closed the connection
    pub fn try_frame(&mut self) -> Option<Frame> {
        self.reader.read_frame().ok()
    }

    pub fn expect_headers(&mut self) -> MetaHeaders {
        match self.next_frame() {
            Frame::Headers(headers) => headers,
            other => panic!("expected HEADERS, got {:?}", other),
        }
    }

    /// Set the read timeout of the underlying socket
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>)
    where
        S: HasTcp,
    {
        self.reader.get_mut().tcp().set_read_timeout(timeout).unwrap();
    }

    /// Half-close the socket so the client reads EOF
    pub fn close_write(&mut self)
    where
        S: HasTcp,
    {
        self.reader.get_mut().tcp().shutdown(Shutdown::Write).unwrap();
    }

    pub fn send_headers(&mut self, stream_id: u32, status: u16, fields: &[(&str, &str)], end_stream: bool) {
        let status = status.to_string();
        let mut all = vec![(":status", status.as_str())];
        all.extend_from_slice(fields);
        self.send_fields(stream_id, &all, end_stream);
    }

    pub fn send_trailers(&mut self, stream_id: u32, fields: &[(&str, &str)]) {
        self.send_fields(stream_id, fields, true);
    }

    fn send_fields(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let mut block = BytesMut::new();
        self.encoder.encode(fields.iter().copied(), &mut block).unwrap();
        let mut buf = BytesMut::new();
        FrameCodec::encode_header_block(stream_id, &block.freeze(), end_stream, None, 16384, &mut buf);
        self.write(&buf);
    }

    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let mut buf = BytesMut::new();
        FrameCodec::encode_data(&DataFrame::new(stream_id, Bytes::copy_from_slice(data), end_stream), &mut buf);
        self.write(&buf);
    }

    pub fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        let mut buf = BytesMut::new();
        FrameCodec::encode_window_update(&WindowUpdateFrame::new(stream_id, increment), &mut buf);
        self.write(&buf);
    }

    pub fn send_goaway(&mut self, last_stream_id: u32, code: ErrorCode) {
        let mut buf = BytesMut::new();
        FrameCodec::encode_goaway(&GoawayFrame::new(last_stream_id, code, Bytes::new()), &mut buf);
        self.write(&buf);
    }

    pub fn send_rst_stream(&mut self, stream_id: u32, code: ErrorCode) {
        let mut buf = BytesMut::new();
        FrameCodec::encode_rst_stream(&RstStreamFrame::new(stream_id, code), &mut buf);
        self.write(&buf);
    }

    pub fn send_ping_ack(&mut self, data: [u8; 8]) {
        let mut buf = BytesMut::new();
        FrameCodec::encode_ping(&PingFrame::ack(data), &mut buf);
        self.write(&buf);
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let stream = self.reader.get_mut();
        stream.write_all(bytes).unwrap();
        stream.flush().unwrap();
    }
}

/// Access to the socket under a peer stream
pub trait HasTcp {
    fn tcp(&self) -> &TcpStream;
}

impl HasTcp for TcpStream {
    fn tcp(&self) -> &TcpStream {
        self
    }
}

impl HasTcp for SslStream<TcpStream> {
    fn tcp(&self) -> &TcpStream {
        self.get_ref()
    }
}

/// Listener on an ephemeral loopback port
pub fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Accept one plaintext connection
pub fn accept(listener: &TcpListener) -> Peer<TcpStream> {
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(PEER_TIMEOUT)).unwrap();
    Peer::new(stream)
}

/// Run `script` against the next `n` plaintext connections, one thread
/// per test
pub fn serve<F>(n: usize, script: F) -> (u16, thread::JoinHandle<()>)
where
    F: Fn(usize, Peer<TcpStream>) + Send + 'static,
{
    let (listener, port) = listen();
    let handle = thread::spawn(move || {
        for i in 0..n {
            script(i, accept(&listener));
        }
    });
    (port, handle)
}

/// Open a `ClientConn` to a local peer
pub fn connect(port: u16, config: ConnConfig) -> ClientConn {
    let tcp = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let session: Arc<dyn SessionOps> = Arc::new(FdSessionOps::new(tcp));
    ClientConn::new(session, Arc::new(config)).unwrap()
}

/// Wait until the client has applied the peer's SETTINGS
pub fn wait_for_settings(conn: &ClientConn) {
    wait_until(|| conn.state().max_concurrent_streams == PEER_MAX_STREAMS);
}

pub fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + PEER_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// TLS acceptor with a fresh self-signed certificate for "localhost"
///
/// `alpn` is in wire format, e.g. `b"\x02h2"`.
pub fn tls_acceptor(alpn: &'static [u8]) -> SslAcceptor {
    tls_acceptor_builder(alpn).build()
}

/// Unbuilt `tls_acceptor`, for tests that add server-side hooks
pub fn tls_acceptor_builder(alpn: &'static [u8]) -> SslAcceptorBuilder {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut cert = X509Builder::new().unwrap();
    cert.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    cert.set_serial_number(&serial).unwrap();
    cert.set_subject_name(&name).unwrap();
    cert.set_issuer_name(&name).unwrap();
    cert.set_pubkey(&key).unwrap();
    cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    cert.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = cert.build();

    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&cert).unwrap();
    acceptor.set_alpn_select_callback(move |_, client| select_next_proto(alpn, client).ok_or(AlpnError::NOACK));
    acceptor
}

/// Accept one TLS connection
pub fn accept_tls(listener: &TcpListener, acceptor: &SslAcceptor) -> Peer<SslStream<TcpStream>> {
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(PEER_TIMEOUT)).unwrap();
    Peer::new(acceptor.accept(stream).unwrap())
}
