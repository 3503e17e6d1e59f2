#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! Links over real loopback UDP sockets.
//!
//! A plain `UdpSocket` stands in for the relay server and for the mosh
//! process on each side of the link under test.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use moshrelay_agent::channel::{Datagram, packet_channel};
use moshrelay_agent::link::{LinkError, LocalLoopbackLink, RelayLink};
use moshrelay_core::protocol::MAX_PACKET_SIZE;

const WAIT: Duration = Duration::from_secs(5);

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 64];
    let (n, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("datagram not received in time")
        .unwrap();
    buf.truncate(n);
    (buf, from)
}

#[tokio::test]
async fn relay_link_round_trip() {
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (sink, mut from_relay) = packet_channel();
    let (to_relay, source) = packet_channel();
    let link = Arc::new(RelayLink::new(
        relay.local_addr().unwrap(),
        "abc",
        "xyz",
        sink,
        source,
    ));
    let cancel = CancellationToken::new();
    let task = {
        let link = Arc::clone(&link);
        let cancel = cancel.clone();
        tokio::spawn(async move { link.connect(&cancel).await })
    };

    let (announce, link_addr) = recv(&relay).await;
    assert_eq!(announce, b"CONNECT abc xyz");

    for (len, seed) in [(1, 0u8), (700, 3), (MAX_PACKET_SIZE, 9)] {
        let bytes = payload(len, seed);
        relay.send_to(&bytes, link_addr).await.unwrap();
        let datagram = timeout(WAIT, from_relay.recv()).await.unwrap().unwrap();
        assert_eq!(datagram.as_bytes(), bytes.as_slice());

        let bytes = payload(len, seed.wrapping_add(1));
        to_relay
            .send(Datagram::new(bytes.clone()).unwrap())
            .await
            .unwrap();
        let (received, from) = recv(&relay).await;
        assert_eq!(from, link_addr);
        assert_eq!(received, bytes);
    }

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn loopback_listener_replies_to_last_peer() {
    let (sink, mut from_client) = packet_channel();
    let (to_client, source) = packet_channel();
    let link = Arc::new(LocalLoopbackLink::listener(sink, source));
    let task = {
        let link = Arc::clone(&link);
        tokio::spawn(async move { link.run(&CancellationToken::new()).await })
    };
    let addr = link
        .wait_bound(Duration::from_millis(10), &CancellationToken::new())
        .await
        .unwrap();

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    first.send_to(b"hello", addr).await.unwrap();
    let datagram = timeout(WAIT, from_client.recv()).await.unwrap().unwrap();
    assert_eq!(datagram.as_bytes(), b"hello");

    to_client
        .send(Datagram::copy_from(b"reply-1").unwrap())
        .await
        .unwrap();
    let (received, from) = recv(&first).await;
    assert_eq!(received, b"reply-1");
    assert_eq!(from, addr);

    // A new sender replaces the remembered peer.
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    second.send_to(b"again", addr).await.unwrap();
    timeout(WAIT, from_client.recv()).await.unwrap().unwrap();
    to_client
        .send(Datagram::copy_from(b"reply-2").unwrap())
        .await
        .unwrap();
    let (received, _) = recv(&second).await;
    assert_eq!(received, b"reply-2");

    link.stop();
    link.stop();
    assert!(matches!(task.await.unwrap(), Err(LinkError::Closed)));
}

#[tokio::test]
async fn loopback_listener_survives_write_without_peer() {
    let (sink, mut from_client) = packet_channel();
    let (to_client, source) = packet_channel();
    let link = Arc::new(LocalLoopbackLink::listener(sink, source));
    let cancel = CancellationToken::new();
    let task = {
        let link = Arc::clone(&link);
        let cancel = cancel.clone();
        tokio::spawn(async move { link.run(&cancel).await })
    };
    let addr = link
        .wait_bound(Duration::from_millis(10), &cancel)
        .await
        .unwrap();

    // Nobody has sent yet: the datagram has no destination and is dropped.
    to_client
        .send(Datagram::copy_from(b"early").unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hi", addr).await.unwrap();
    timeout(WAIT, from_client.recv()).await.unwrap().unwrap();
    to_client
        .send(Datagram::copy_from(b"late").unwrap())
        .await
        .unwrap();
    let (received, _) = recv(&client).await;
    assert_eq!(received, b"late");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn loopback_listener_ignores_oversized_datagram() {
    let (sink, mut from_client) = packet_channel();
    let (to_client, source) = packet_channel();
    let link = Arc::new(LocalLoopbackLink::listener(sink, source));
    let cancel = CancellationToken::new();
    let task = {
        let link = Arc::clone(&link);
        let cancel = cancel.clone();
        tokio::spawn(async move { link.run(&cancel).await })
    };
    let addr = link
        .wait_bound(Duration::from_millis(10), &cancel)
        .await
        .unwrap();

    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger
        .send_to(&[0u8; MAX_PACKET_SIZE + 1], addr)
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hi", addr).await.unwrap();
    let datagram = timeout(WAIT, from_client.recv()).await.unwrap().unwrap();
    assert_eq!(datagram.as_bytes(), b"hi");

    // Replies still go to the client, not to the rejected sender.
    to_client
        .send(Datagram::copy_from(b"reply").unwrap())
        .await
        .unwrap();
    let (received, _) = recv(&client).await;
    assert_eq!(received, b"reply");
    assert!(!task.is_finished());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn loopback_dialer_round_trip() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let (sink, mut from_server) = packet_channel();
    let (to_server, source) = packet_channel();
    let link = Arc::new(LocalLoopbackLink::dialer(port, sink, source));
    let cancel = CancellationToken::new();
    let task = {
        let link = Arc::clone(&link);
        let cancel = cancel.clone();
        tokio::spawn(async move { link.run(&cancel).await })
    };

    let bytes = payload(MAX_PACKET_SIZE, 42);
    to_server
        .send(Datagram::new(bytes.clone()).unwrap())
        .await
        .unwrap();
    let (received, link_addr) = recv(&server).await;
    assert_eq!(received, bytes);

    server.send_to(b"state", link_addr).await.unwrap();
    let datagram = timeout(WAIT, from_server.recv()).await.unwrap().unwrap();
    assert_eq!(datagram.as_bytes(), b"state");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

/// Relay link and listening loopback link wired the way the client role
/// wires them, with an echoing relay.
#[tokio::test]
async fn client_pipeline_through_echo_relay() {
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (from_client_tx, from_client_rx) = packet_channel();
    let (to_client_tx, to_client_rx) = packet_channel();
    let relay_link = Arc::new(RelayLink::new(
        relay.local_addr().unwrap(),
        "api",
        "key",
        to_client_tx,
        from_client_rx,
    ));
    let loopback = Arc::new(LocalLoopbackLink::listener(from_client_tx, to_client_rx));
    let cancel = CancellationToken::new();

    let relay_task = {
        let link = Arc::clone(&relay_link);
        let cancel = cancel.clone();
        tokio::spawn(async move { link.connect(&cancel).await })
    };
    let loopback_task = {
        let link = Arc::clone(&loopback);
        let cancel = cancel.clone();
        tokio::spawn(async move { link.run(&cancel).await })
    };

    let (announce, _) = recv(&relay).await;
    assert_eq!(announce, b"CONNECT api key");

    let echo = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (n, from) = relay.recv_from(&mut buf).await.unwrap();
            relay.send_to(&buf[..n], from).await.unwrap();
        }
    });

    let addr = loopback
        .wait_bound(Duration::from_millis(10), &cancel)
        .await
        .unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for len in [1, 512, MAX_PACKET_SIZE] {
        let bytes = payload(len, 7);
        client.send_to(&bytes, addr).await.unwrap();
        let (received, _) = recv(&client).await;
        assert_eq!(received, bytes);
    }

    relay_link.stop();
    loopback.stop();
    assert!(matches!(relay_task.await.unwrap(), Err(LinkError::Closed)));
    assert!(matches!(loopback_task.await.unwrap(), Err(LinkError::Closed)));
    echo.abort();
}
