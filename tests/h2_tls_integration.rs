//! HTTP/2 over TLS integration tests
//!
//! ALPN negotiation against a local OpenSSL server, the TLS state attached
//! to responses, the HTTP/1 fallback hook and the wire fingerprint seen
//! by the server.

mod common;

use common::{accept_tls, listen, tls_acceptor};
use h2fetch::http::h2::frames::PrioritySpec;
use h2fetch::http::h2::{Error, Frame, H2Fingerprint, Http1Fallback, Transport};
use h2fetch::http::tls::{ClientHelloSpec, TlsConfig};
use h2fetch::http::{Body, Headers, Method, Request, Response, SessionOps, Status, Version};
use std::io::{Cursor, Read, Write};
use std::sync::mpsc;
use std::thread;

fn get(port: u16) -> Request {
    Request::builder()
        .method(Method::Get)
        .url(format!("https://127.0.0.1:{}/", port))
        .build()
        .unwrap()
}

fn insecure(alpn: &[&str]) -> TlsConfig {
    TlsConfig::client().alpn(alpn).verify_peer(false).build().unwrap()
}

#[test]
fn test_h2_over_tls() {
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let acceptor = tls_acceptor(b"\x02h2");
        let mut peer = accept_tls(&listener, &acceptor);
        peer.handshake(&[]);
        let req = peer.expect_headers();
        assert_eq!(req.pseudo(":scheme"), Some("https"));
        peer.send_headers(req.stream_id, 200, &[("content-type", "text/plain")], false);
        peer.send_data(req.stream_id, b"secure", true);
        while peer.try_frame().is_some() {}
    });

    let transport = Transport::builder().tls_config(insecure(&["h2"])).build().unwrap();
    let mut resp = transport.round_trip(get(port)).unwrap();
    assert_eq!(resp.status().code(), 200);
    assert_eq!(resp.version(), Version::Http2);
    let tls = resp.tls().unwrap();
    assert_eq!(tls.alpn.as_deref(), Some("h2"));
    assert_eq!(tls.peer_common_name.as_deref(), Some("localhost"));
    assert!(tls.servername.is_none());
    assert_eq!(resp.bytes().unwrap(), b"secure");

    transport.shutdown();
    server.join().unwrap();
}

#[test]
fn test_peer_verification_rejects_self_signed() {
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let acceptor = tls_acceptor(b"\x02h2");
        let (stream, _) = listener.accept().unwrap();
        assert!(acceptor.accept(stream).is_err());
    });

    let transport = Transport::builder().build().unwrap();
    let err = transport.round_trip(get(port)).unwrap_err();
    assert!(matches!(err, Error::Http(_)), "got {:?}", err);
    server.join().unwrap();
}

#[test]
fn test_http2_not_negotiated() {
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let acceptor = tls_acceptor(b"\x08http/1.1");
        let (stream, _) = listener.accept().unwrap();
        let mut tls = acceptor.accept(stream).unwrap();
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink);
    });

    let transport = Transport::builder()
        .tls_config(insecure(&["h2", "http/1.1"]))
        .build()
        .unwrap();
    match transport.round_trip(get(port)) {
        Err(Error::Http2NotNegotiated(alpn)) => assert_eq!(alpn.as_deref(), Some("http/1.1")),
        other => panic!("expected Http2NotNegotiated, got {:?}", other),
    }
    server.join().unwrap();
}

#[test]
fn test_no_alpn_selected() {
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let acceptor = tls_acceptor(b"\x06spdy/3");
        let (stream, _) = listener.accept().unwrap();
        let mut tls = acceptor.accept(stream).unwrap();
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink);
    });

    let transport = Transport::builder().tls_config(insecure(&["h2"])).build().unwrap();
    match transport.round_trip(get(port)) {
        Err(Error::Http2NotNegotiated(alpn)) => assert!(alpn.is_none()),
        other => panic!("expected Http2NotNegotiated, got {:?}", other),
    }
    server.join().unwrap();
}

/// Minimal HTTP/1.1 exchange over the handed-over session
struct RawHttp1;

impl Http1Fallback for RawHttp1 {
    fn round_trip(&self, session: Box<dyn SessionOps>, req: Request) -> h2fetch::http::h2::Result<Response> {
        let head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            req.method().as_str(),
            req.path(),
            req.authority()
        );
        let mut out = head.as_bytes();
        while !out.is_empty() {
            let n = session.write(out)?;
            out = &out[n..];
        }

        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match session.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => raw.extend_from_slice(&buf[..n]),
            }
        }
        let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let code: u16 = std::str::from_utf8(&raw[9..12]).unwrap().parse().unwrap();
        let body = raw.split_off(split + 4);
        Ok(Response::new(Status::new(code)?, Headers::new(), Body::from_reader(Cursor::new(body))).with_version(Version::Http11))
    }
}

#[test]
fn test_http1_fallback_gets_session() {
    let (tx, rx) = mpsc::channel();
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let acceptor = tls_acceptor(b"\x08http/1.1");
        let (stream, _) = listener.accept().unwrap();
        let mut tls = acceptor.accept(stream).unwrap();
        let mut req = Vec::new();
        let mut buf = [0u8; 1024];
        while !req.ends_with(b"\r\n\r\n") {
            let n = tls.read(&mut buf).unwrap();
            assert!(n > 0);
            req.extend_from_slice(&buf[..n]);
        }
        tx.send(String::from_utf8(req).unwrap()).unwrap();
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi").unwrap();
        let _ = tls.shutdown();
    });

    let transport = Transport::builder()
        .tls_config(insecure(&["h2", "http/1.1"]))
        .http1_fallback(RawHttp1)
        .build()
        .unwrap();
    let mut resp = transport.round_trip(get(port)).unwrap();
    assert_eq!(resp.version(), Version::Http11);
    assert_eq!(resp.status().code(), 200);
    assert_eq!(resp.bytes().unwrap(), b"hi");
    assert!(rx.recv().unwrap().starts_with("GET / HTTP/1.1\r\n"));
    let key = h2fetch::http::h2::ConnKey::for_request(&get(port));
    assert_eq!(transport.pool().len(&key), 0);
    server.join().unwrap();
}

#[test]
fn test_chrome_fingerprint_on_the_wire() {
    let (tx, rx) = mpsc::channel();
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let acceptor = tls_acceptor(b"\x02h2");
        let mut peer = accept_tls(&listener, &acceptor);
        let settings = peer.handshake(&[]);
        let update = match peer.read_frame() {
            Frame::WindowUpdate(f) => (f.stream_id, f.size_increment),
            other => panic!("expected WINDOW_UPDATE, got {:?}", other),
        };
        let req = peer.expect_headers();
        let pseudo: Vec<String> = req
            .fields
            .iter()
            .take_while(|f| f.is_pseudo())
            .map(|f| f.name.clone())
            .collect();
        let regular: Vec<String> = req.regular().map(|f| f.name.clone()).collect();
        tx.send((settings, update, pseudo, regular, req.priority)).unwrap();
        peer.send_headers(req.stream_id, 200, &[], true);
        while peer.try_frame().is_some() {}
    });

    let tls = TlsConfig::client()
        .fingerprint(ClientHelloSpec::chrome())
        .verify_peer(false)
        .build()
        .unwrap();
    let transport = Transport::builder()
        .tls_config(tls)
        .h2_fingerprint(H2Fingerprint::chrome())
        .build()
        .unwrap();
    let req = Request::builder()
        .method(Method::Get)
        .url(format!("https://127.0.0.1:{}/", port))
        .header("accept-language", "en-US")
        .header("user-agent", "test")
        .header("accept", "*/*")
        .build()
        .unwrap();
    let resp = transport.round_trip(req).unwrap();
    assert_eq!(resp.status().code(), 200);
    assert_eq!(resp.tls().unwrap().alpn.as_deref(), Some("h2"));

    let (settings, update, pseudo, regular, priority) = rx.recv().unwrap();
    assert_eq!(settings, H2Fingerprint::chrome().settings);
    assert_eq!(update, (0, 15663105));
    assert_eq!(pseudo, [":method", ":authority", ":scheme", ":path"]);
    assert_eq!(regular, ["user-agent", "accept", "accept-language"]);
    assert_eq!(priority, Some(PrioritySpec::new(0, true, 255)));

    transport.shutdown();
    server.join().unwrap();
}
