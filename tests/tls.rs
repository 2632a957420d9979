//! Secure-session tests that need no certificates: a peer that does not
//! speak TLS makes the handshake fail, which must resolve like any other
//! transport error.
#![cfg(feature = "tls")]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use sockio::{
    Config, Error, SessionCallbacks, SessionKind, SessionOptions, TcpService, TlsClientConfig,
};

const WAIT: Duration = Duration::from_secs(5);
const GRACE: Duration = Duration::from_millis(300);

fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

#[test]
fn test_handshake_failure_disconnects_without_data() {
    let _ = env_logger::builder().is_test(true).try_init();
    sockio::net_init();
    let svc = TcpService::start(Config {
        threads: 1,
        tls_client: Some(TlsClientConfig::with_webpki_roots()),
        ..Config::default()
    })
    .unwrap();

    let (mut peer, server_side) = pair();
    let (dis_tx, dis_rx) = mpsc::channel();
    let data_calls = Arc::new(AtomicUsize::new(0));
    let counter = data_calls.clone();
    let _session = svc
        .add_session(
            server_side,
            SessionOptions {
                secure: true,
                kind: SessionKind::Outbound,
                server_name: Some("example.com".into()),
                ..SessionOptions::default()
            },
            SessionCallbacks::new(
                |_, _| {},
                move |_, bytes| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    bytes.len()
                },
                move |_| dis_tx.send(()).unwrap(),
            ),
        )
        .unwrap();

    // Swallow the client hello, then answer with bytes that are not TLS
    // records. The record layer rejects them, which must close the session.
    peer.set_read_timeout(Some(WAIT)).unwrap();
    let mut scratch = [0u8; 4096];
    let _ = peer.read(&mut scratch);
    peer.write_all(b"220 this end speaks smtp, not tls\r\n").unwrap();

    dis_rx.recv_timeout(WAIT).unwrap();
    assert!(dis_rx.recv_timeout(GRACE).is_err());
    // No plaintext ever existed, so the data callback never ran.
    assert_eq!(data_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_peer_close_during_handshake_disconnects_once() {
    sockio::net_init();
    let svc = TcpService::start(Config {
        threads: 1,
        tls_client: Some(TlsClientConfig::with_webpki_roots()),
        ..Config::default()
    })
    .unwrap();

    let (peer, server_side) = pair();
    let (dis_tx, dis_rx) = mpsc::channel();
    let _session = svc
        .add_session(
            server_side,
            SessionOptions {
                secure: true,
                kind: SessionKind::Outbound,
                server_name: Some("example.com".into()),
                ..SessionOptions::default()
            },
            SessionCallbacks::new(|_, _| {}, |_, _| 0, move |_| dis_tx.send(()).unwrap()),
        )
        .unwrap();

    drop(peer);
    dis_rx.recv_timeout(WAIT).unwrap();
    assert!(dis_rx.recv_timeout(GRACE).is_err());
}

#[test]
fn test_secure_session_without_tls_config_is_rejected() {
    sockio::net_init();
    let svc = TcpService::start(Config {
        threads: 1,
        ..Config::default()
    })
    .unwrap();
    let (_peer, server_side) = pair();
    let r = svc.add_session(
        server_side,
        SessionOptions {
            secure: true,
            kind: SessionKind::Outbound,
            ..SessionOptions::default()
        },
        SessionCallbacks::new(|_, _| {}, |_, _| 0, |_| {}),
    );
    assert!(matches!(r, Err(Error::TlsNotConfigured)));
}
