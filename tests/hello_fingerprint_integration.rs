//! ClientHello fingerprint tests
//!
//! A local OpenSSL server records what the client offered: the cipher
//! suites in wire order, and whether the status_request extension was
//! present (the server status callback only runs when it was).

mod common;

use common::{listen, tls_acceptor_builder};
use h2fetch::http::tls::{ClientHelloSpec, TlsConfig};
use h2fetch::http::SessionOps;
use openssl::ssl::ClientHelloResponse;
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

struct Offer {
    tls13: Vec<String>,
    tls12: Vec<String>,
    status_request: bool,
}

fn observe(spec: ClientHelloSpec) -> Offer {
    let ciphers = Arc::new(Mutex::new(Vec::new()));
    let status = Arc::new(AtomicBool::new(false));

    let mut builder = tls_acceptor_builder(b"\x02h2");
    let seen = Arc::clone(&ciphers);
    builder.set_client_hello_callback(move |ssl, _alert| {
        let raw = ssl.client_hello_ciphers().map(<[u8]>::to_vec).unwrap_or_default();
        let lists = ssl.bytes_to_cipher_list(&raw, false)?;
        *seen.lock().unwrap() = lists.suites.iter().map(|c| c.name().to_string()).collect::<Vec<_>>();
        Ok(ClientHelloResponse::SUCCESS)
    });
    let requested = Arc::clone(&status);
    builder
        .set_status_callback(move |_| {
            requested.store(true, Ordering::SeqCst);
            Ok(false)
        })
        .unwrap();
    let acceptor = builder.build();

    let (listener, port) = listen();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut tls = acceptor.accept(stream).unwrap();
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink);
    });

    let client = TlsConfig::client().fingerprint(spec).verify_peer(false).build().unwrap();
    let tcp = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let session = client.connect_to(tcp, "localhost").unwrap();
    assert_eq!(session.vars().alpn.as_deref(), Some("h2"));
    let _ = session.close();
    server.join().unwrap();

    let offered = ciphers.lock().unwrap().clone();
    let (tls13, tls12) = offered.into_iter().partition(|name: &String| name.starts_with("TLS_"));
    Offer {
        tls13,
        tls12,
        status_request: status.load(Ordering::SeqCst),
    }
}

fn names(list: &Option<String>) -> Vec<String> {
    list.as_deref().unwrap_or_default().split(':').map(str::to_string).collect()
}

#[test]
fn test_chrome_cipher_order_on_the_wire() {
    let chrome = ClientHelloSpec::chrome();
    let offer = observe(chrome.clone());

    assert_eq!(offer.tls13, names(&chrome.ciphersuites));

    // Suites the local OpenSSL build cannot offer drop out; the order holds
    let expected = names(&chrome.cipher_list);
    let kept: Vec<String> = expected.iter().filter(|c| offer.tls12.contains(c)).cloned().collect();
    assert_eq!(offer.tls12, kept);
    assert!(offer.tls12.len() >= 6, "offered {:?}", offer.tls12);
    assert_eq!(offer.tls12[..6], expected[..6]);
}

#[test]
fn test_presets_differ_on_the_wire() {
    let chrome = observe(ClientHelloSpec::chrome());
    let firefox = observe(ClientHelloSpec::firefox());
    assert_eq!(
        firefox.tls13,
        ["TLS_AES_128_GCM_SHA256", "TLS_CHACHA20_POLY1305_SHA256", "TLS_AES_256_GCM_SHA384"]
    );
    assert_ne!(chrome.tls13, firefox.tls13);
    assert_eq!(firefox.tls12[2], "ECDHE-ECDSA-CHACHA20-POLY1305");
    assert_eq!(chrome.tls12[2], "ECDHE-ECDSA-AES256-GCM-SHA384");
}

#[test]
fn test_status_request_toggle() {
    assert!(observe(ClientHelloSpec::chrome()).status_request);
    assert!(!observe(ClientHelloSpec::chrome().with_status_request(false)).status_request);
}

#[test]
fn test_golang_offers_only_its_suites() {
    let golang = ClientHelloSpec::golang();
    let offer = observe(golang.clone());
    assert_eq!(offer.tls12, names(&golang.cipher_list));
}
