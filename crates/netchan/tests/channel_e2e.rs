// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end channel tests over loopback sockets.
//!
//! Each test builds real client/server sessions on 127.0.0.1 and exercises
//! the public API: ordering, handshake pairing, retry, cancel, close
//! rendezvous, and byte accounting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded};
use parking_lot::Mutex;

use netchan::{ChannelConfig, ChannelError, IoCore, Session, Status};

const WAIT: Duration = Duration::from_secs(5);

fn io_core() -> IoCore {
    IoCore::new(ChannelConfig::default()).expect("spawn io core")
}

/// Bind and immediately release an ephemeral port so a later session can
/// claim it.
fn reserve_port() -> SocketAddr {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    addr
}

#[test]
fn basic_round_trip() {
    let io = io_core();
    let server = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "rt").unwrap();
    let addr = server.local_addr().unwrap();
    let client = Session::client(&io, addr, "rt");

    let server_chan = server.channel("B", "A");
    let client_chan = client.channel("A", "B");

    let (sent_tx, sent_rx) = bounded(1);
    client_chan.send(vec![0xDE, 0xAD, 0xBE, 0xEF], move |res| {
        let _ = sent_tx.send(res);
    });

    let (recv_tx, recv_rx) = bounded(1);
    server_chan.recv(move |res| {
        let _ = recv_tx.send(res);
    });

    assert_eq!(sent_rx.recv_timeout(WAIT).unwrap().unwrap(), 4);
    assert_eq!(
        recv_rx.recv_timeout(WAIT).unwrap().unwrap(),
        vec![0xDE, 0xAD, 0xBE, 0xEF]
    );

    assert!(client_chan.is_connected());
    assert!(server_chan.is_connected());
    assert_eq!(client_chan.total_sent(), 4);
    assert_eq!(server_chan.total_received(), 4);

    client_chan.close();
    server_chan.close();
    assert_eq!(client_chan.status(), Status::Closed);
    assert_eq!(server_chan.status(), Status::Closed);
}

#[test]
fn sends_enqueued_before_connect_complete_in_order() {
    let io = io_core();
    let addr = reserve_port();

    // No server yet: everything below is queued behind the handshake.
    let client = Session::client(&io, addr, "pre");
    let client_chan = client.channel("A", "B");

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = bounded(1);
    for i in 0..2 {
        let order = order.clone();
        let done_tx = done_tx.clone();
        client_chan.send(vec![i as u8; 8], move |res| {
            res.unwrap();
            order.lock().push(i);
            if i == 1 {
                let _ = done_tx.send(());
            }
        });
    }

    thread::sleep(Duration::from_millis(100));
    let server = Session::server(&io, addr, "pre").unwrap();
    let server_chan = server.channel("B", "A");

    done_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(order.lock().clone(), vec![0, 1]);
    assert!(client_chan.wait_for_connection(Some(WAIT)).unwrap());

    client_chan.close();
    server_chan.close();
}

#[test]
fn server_channel_created_before_client() {
    let io = io_core();
    let server = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "sf").unwrap();
    let addr = server.local_addr().unwrap();

    let server_chan = server.channel("B", "A");
    thread::sleep(Duration::from_millis(200));

    let client = Session::client(&io, addr, "sf");
    let client_chan = client.channel("A", "B");

    assert!(client_chan.wait_for_connection(Some(WAIT)).unwrap());
    assert!(server_chan.wait_for_connection(Some(WAIT)).unwrap());

    let (recv_tx, recv_rx) = bounded(1);
    server_chan.recv(move |res| {
        let _ = recv_tx.send(res);
    });
    client_chan.send(b"hello".to_vec(), |res| {
        res.unwrap();
    });
    assert_eq!(recv_rx.recv_timeout(WAIT).unwrap().unwrap(), b"hello");

    client_chan.close();
    server_chan.close();
}

#[test]
fn client_retries_until_server_appears() {
    let io = io_core();
    let addr = reserve_port();

    // Client first; connect attempts are refused and retried with backoff.
    let client = Session::client(&io, addr, "cf");
    let client_chan = client.channel("A", "B");
    assert!(!client_chan.is_connected());

    thread::sleep(Duration::from_millis(200));

    let server = Session::server(&io, addr, "cf").unwrap();
    let server_chan = server.channel("B", "A");

    assert!(client_chan.wait_for_connection(Some(WAIT)).unwrap());
    assert!(client_chan.is_connected());

    let (recv_tx, recv_rx) = bounded(1);
    server_chan.recv(move |res| {
        let _ = recv_tx.send(res);
    });
    client_chan.send(vec![7; 16], |res| {
        res.unwrap();
    });
    assert_eq!(recv_rx.recv_timeout(WAIT).unwrap().unwrap(), vec![7; 16]);

    client_chan.close();
    server_chan.close();
}

#[test]
fn cancel_during_retry_stops_connecting() {
    let io = io_core();
    let addr = reserve_port();

    let client = Session::client(&io, addr, "cancel");
    let chan = client.channel("A", "B");

    thread::sleep(Duration::from_millis(400));

    let started = Instant::now();
    chan.cancel();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "cancel took {:?}",
        started.elapsed()
    );

    assert_eq!(chan.status(), Status::Cancelled);
    assert!(!chan.is_connected());
    match chan.wait_for_connection(Some(Duration::from_millis(500))) {
        Err(ChannelError::ConnectFailed(_)) => {}
        other => panic!("expected ConnectFailed, got {:?}", other),
    }
}

#[test]
fn graceful_close_drains_pending_sends() {
    let io = io_core();
    let server = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "drain").unwrap();
    let addr = server.local_addr().unwrap();
    let client = Session::client(&io, addr, "drain");

    let server_chan = server.channel("B", "A");
    let client_chan = client.channel("A", "B");

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10u8 {
        let order = order.clone();
        client_chan.send(vec![i; 32], move |res| {
            res.unwrap();
            order.lock().push(format!("send-{}", i));
        });
    }

    let (done_tx, done_rx) = bounded(1);
    {
        let order = order.clone();
        client_chan.async_close(move || {
            order.lock().push("closed".to_string());
            let _ = done_tx.send(());
        });
    }

    done_rx.recv_timeout(WAIT).unwrap();

    let seen = order.lock().clone();
    assert_eq!(seen.len(), 11);
    assert_eq!(seen[10], "closed");
    for (i, entry) in seen.iter().take(10).enumerate() {
        assert_eq!(entry, &format!("send-{}", i));
    }
    assert_eq!(client_chan.total_sent(), 32 * 10);

    // A second close is a warning and completes immediately.
    let (again_tx, again_rx) = bounded(1);
    client_chan.async_close(move || {
        let _ = again_tx.send(());
    });
    again_rx.recv_timeout(WAIT).unwrap();

    server_chan.close();
}

#[test]
fn peer_close_fails_pending_recv() {
    let io = io_core();
    let server = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "eof").unwrap();
    let addr = server.local_addr().unwrap();
    let client = Session::client(&io, addr, "eof");

    let server_chan = server.channel("B", "A");
    let client_chan = client.channel("A", "B");
    assert!(client_chan.wait_for_connection(Some(WAIT)).unwrap());
    assert!(server_chan.wait_for_connection(Some(WAIT)).unwrap());

    let (recv_tx, recv_rx) = bounded(1);
    server_chan.recv(move |res| {
        let _ = recv_tx.send(res);
    });

    // Closing the client tears the socket down once its queues drain; the
    // server's parked recv fails rather than waiting forever.
    client_chan.close();

    let res = recv_rx.recv_timeout(WAIT).unwrap();
    assert!(res.is_err(), "expected recv failure, got {:?}", res);

    server_chan.close();
}

#[test]
fn cancel_drops_queued_ops_with_cancellation() {
    let io = io_core();
    let addr = reserve_port();

    // Never connects; every queued op must still complete, with an error.
    let client = Session::client(&io, addr, "drop");
    let chan = client.channel("A", "B");

    let (tx, rx) = unbounded();
    for _ in 0..5 {
        let tx = tx.clone();
        chan.send(vec![1, 2, 3], move |res| {
            let _ = tx.send(res.is_err());
        });
    }

    chan.cancel();

    for _ in 0..5 {
        assert!(rx.recv_timeout(WAIT).unwrap());
    }
    assert_eq!(chan.status(), Status::Cancelled);
}

#[test]
fn raw_socket_channels_exchange_data() {
    let io = io_core();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let join = thread::spawn(move || listener.accept().unwrap().0);
    let client_stream = std::net::TcpStream::connect(addr).unwrap();
    let server_stream = join.join().unwrap();

    let a = netchan::Channel::from_stream(&io, client_stream).unwrap();
    let b = netchan::Channel::from_stream(&io, server_stream).unwrap();

    assert!(a.is_connected());
    assert!(b.is_connected());
    assert!(a.wait_for_connection(Some(WAIT)).unwrap());

    let (recv_tx, recv_rx) = bounded(1);
    b.recv(move |res| {
        let _ = recv_tx.send(res);
    });
    a.send(b"raw".to_vec(), |res| {
        res.unwrap();
    });
    assert_eq!(recv_rx.recv_timeout(WAIT).unwrap().unwrap(), b"raw");

    a.close();
    b.close();
}

#[test]
fn byte_accounting_matches_payload_sizes() {
    let io = io_core();
    let server = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "bytes").unwrap();
    let addr = server.local_addr().unwrap();
    let client = Session::client(&io, addr, "bytes");

    let server_chan = server.channel("B", "A");
    let client_chan = client.channel("A", "B");

    let mut expected = 0u64;
    let (recv_tx, recv_rx) = unbounded();
    let count = 20;
    for _ in 0..count {
        let size = 1 + fastrand::usize(..2048);
        expected += size as u64;

        let payload: Vec<u8> = (0..size).map(|_| fastrand::u8(..)).collect();
        let reference = payload.clone();

        let tx = recv_tx.clone();
        server_chan.recv(move |res| {
            let _ = tx.send(res.map(|data| data == reference));
        });
        client_chan.send(payload, |res| {
            res.unwrap();
        });
    }

    for _ in 0..count {
        assert!(recv_rx.recv_timeout(WAIT).unwrap().unwrap());
    }

    assert_eq!(client_chan.total_sent(), expected);
    assert_eq!(server_chan.total_received(), expected);

    client_chan.reset_stats();
    assert_eq!(client_chan.total_sent(), 0);

    client_chan.close();
    server_chan.close();
}

#[test]
fn on_connect_fires_with_result() {
    let io = io_core();
    let server = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "cb").unwrap();
    let addr = server.local_addr().unwrap();
    let client = Session::client(&io, addr, "cb");

    let server_chan = server.channel("B", "A");
    let client_chan = client.channel("A", "B");

    let (tx, rx) = bounded(1);
    client_chan.on_connect(move |res| {
        let _ = tx.send(res.is_ok());
    });
    assert!(rx.recv_timeout(WAIT).unwrap());

    client_chan.close();
    server_chan.close();
}

#[test]
fn wait_for_connection_times_out_without_peer() {
    let io = io_core();
    let addr = reserve_port();

    let client = Session::client(&io, addr, "timeout");
    let chan = client.channel("A", "B");

    let verdict = chan
        .wait_for_connection(Some(Duration::from_millis(150)))
        .unwrap();
    assert!(!verdict);

    chan.cancel();
}
