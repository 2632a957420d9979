//! End-to-end session tests over loopback sockets.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sockio::{Config, SessionCallbacks, SessionOptions, TcpService};

const WAIT: Duration = Duration::from_secs(5);

fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn service(threads: usize) -> TcpService {
    let _ = env_logger::builder().is_test(true).try_init();
    sockio::net_init();
    TcpService::start(Config {
        threads,
        ..Config::default()
    })
    .unwrap()
}

#[test]
fn test_enter_callback_reports_peer_addr() {
    let svc = service(1);
    let (peer, server_side) = pair();
    let expected = peer.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    let _session = svc
        .add_session(
            server_side,
            SessionOptions::default(),
            SessionCallbacks::new(
                move |_s, addr| tx.send(addr).unwrap(),
                |_, _| 0,
                |_| {},
            ),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), expected);
}

#[test]
fn test_echo() {
    let svc = service(2);
    let (mut peer, server_side) = pair();
    let _session = svc
        .add_session(
            server_side,
            SessionOptions::default(),
            SessionCallbacks::new(
                |_, _| {},
                |session, bytes| {
                    session.send(bytes.to_vec());
                    bytes.len()
                },
                |_| {},
            ),
        )
        .unwrap();
    peer.write_all(b"ping").unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn test_sends_from_foreign_thread_concatenate_in_order() {
    let svc = service(2);
    let (mut peer, server_side) = pair();
    let session = svc
        .add_session(
            server_side,
            SessionOptions::default(),
            SessionCallbacks::new(|_, _| {}, |_, _| 0, |_| {}),
        )
        .unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let s = session.clone();
    let t1 = done_tx.clone();
    thread::spawn(move || {
        s.send_with(&b"AB"[..], move || t1.send(1).unwrap());
        s.send_with(&b"CD"[..], move || done_tx.send(2).unwrap());
    })
    .join()
    .unwrap();

    peer.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ABCD");
    // Completion callbacks fire in submission order.
    assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), 1);
    assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), 2);
}

#[test]
fn test_many_sends_deliver_without_loss_or_reorder() {
    let svc = service(1);
    let (mut peer, server_side) = pair();
    let session = svc
        .add_session(
            server_side,
            SessionOptions::default(),
            SessionCallbacks::new(|_, _| {}, |_, _| 0, |_| {}),
        )
        .unwrap();

    let mut expected = Vec::new();
    for i in 0..200u32 {
        let chunk = i.to_be_bytes().to_vec();
        expected.extend_from_slice(&chunk);
        session.send(chunk);
    }
    session.shutdown();

    peer.set_read_timeout(Some(WAIT)).unwrap();
    let mut got = Vec::new();
    peer.read_to_end(&mut got).unwrap();
    assert_eq!(got, expected);
}

#[test]
fn test_unconsumed_bytes_are_redelivered() {
    let svc = service(1);
    let (mut peer, server_side) = pair();
    let (frames_tx, frames_rx) = mpsc::channel();
    let _session = svc
        .add_session(
            server_side,
            SessionOptions::default(),
            SessionCallbacks::new(
                |_, _| {},
                // Consume only complete 4-byte frames; the tail stays
                // buffered for the next invocation.
                move |_, bytes| {
                    let mut consumed = 0;
                    while bytes.len() - consumed >= 4 {
                        frames_tx
                            .send(bytes[consumed..consumed + 4].to_vec())
                            .unwrap();
                        consumed += 4;
                    }
                    consumed
                },
                |_| {},
            ),
        )
        .unwrap();

    peer.write_all(b"abcdef").unwrap();
    assert_eq!(frames_rx.recv_timeout(WAIT).unwrap(), b"abcd");
    // "ef" is still buffered; two more bytes complete the frame.
    peer.write_all(b"gh").unwrap();
    assert_eq!(frames_rx.recv_timeout(WAIT).unwrap(), b"efgh");
}

#[test]
fn test_pin_to_caller_loop_from_pool_thread() {
    let svc = Arc::new(service(2));
    let (_peer_a, server_a) = pair();
    let (_peer_b, server_b) = pair();
    let stash = Arc::new(Mutex::new(Some(server_b)));
    let (tx, rx) = mpsc::channel();

    let svc2 = svc.clone();
    let session_a = svc
        .add_session(
            server_a,
            SessionOptions::default(),
            SessionCallbacks::new(
                // Runs on the owning loop thread, which is a pool thread.
                move |_s, _addr| {
                    let stream = stash.lock().unwrap().take().unwrap();
                    let r = svc2.add_session(
                        stream,
                        SessionOptions {
                            pin_to_caller_loop: true,
                            ..SessionOptions::default()
                        },
                        SessionCallbacks::new(|_, _| {}, |_, _| 0, |_| {}),
                    );
                    tx.send(r.map(|s| s.id())).unwrap();
                },
                |_, _| 0,
                |_| {},
            ),
        )
        .unwrap();

    let id_b = rx
        .recv_timeout(WAIT)
        .unwrap()
        .expect("pinned placement from a pool thread succeeds");
    assert_eq!(id_b.loop_index(), session_a.id().loop_index());
}
