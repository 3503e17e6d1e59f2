//! UDP links bridged to packet channels.
//!
//! A link owns one socket and two tasks' worth of work: a read loop that
//! moves datagrams from the socket into its sink channel, and a write loop
//! that drains its source channel onto the socket. Both run inside the
//! link's `run`/`connect` future and end together.

mod loopback;
mod relay;

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use moshrelay_core::protocol::MAX_PACKET_SIZE;

use crate::channel::{Datagram, PacketReceiver, PacketSender};

pub use loopback::{LocalLoopbackLink, LoopbackMode, reply_target};
pub use relay::RelayLink;

/// Errors that end a link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send announce datagram: {0}")]
    Announce(#[source] std::io::Error),

    #[error("read error: {0}")]
    Read(#[source] std::io::Error),

    #[error("write error: {0}")]
    Write(#[source] std::io::Error),

    /// Client-role loopback write before any datagram was received.
    #[error("no peer address known yet")]
    NoPeer,

    /// The link was stopped.
    #[error("link closed")]
    Closed,

    #[error("link already started")]
    AlreadyStarted,

    #[error("packet channel closed")]
    ChannelClosed,
}

/// Resolve `host:port` to the first socket address it names.
pub async fn resolve(addr: &str) -> Result<SocketAddr, LinkError> {
    let resolve_err = |source: std::io::Error| LinkError::Resolve {
        addr: addr.to_string(),
        source,
    };
    tokio::net::lookup_host(addr)
        .await
        .map_err(resolve_err)?
        .next()
        .ok_or_else(|| {
            resolve_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            ))
        })
}

/// Unspecified local address of the same family as `peer`.
fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}

/// Channel ends and shutdown signal shared by both link kinds.
#[derive(Debug)]
struct Bridge {
    /// Datagrams read from the socket go here.
    sink: PacketSender,
    /// Datagrams to write to the socket come from here; taken on start.
    source: Mutex<Option<PacketReceiver>>,
    closed: CancellationToken,
}

impl Bridge {
    fn new(sink: PacketSender, source: PacketReceiver) -> Self {
        Self {
            sink,
            source: Mutex::new(Some(source)),
            closed: CancellationToken::new(),
        }
    }

    async fn take_source(&self) -> Result<PacketReceiver, LinkError> {
        if self.closed.is_cancelled() {
            return Err(LinkError::Closed);
        }
        self.source
            .lock()
            .await
            .take()
            .ok_or(LinkError::AlreadyStarted)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    /// Drive `loops` until it fails, the link is stopped (`Closed`) or the
    /// session is cancelled (`Ok`).
    async fn run<F>(&self, cancel: &CancellationToken, loops: F) -> Result<(), LinkError>
    where
        F: Future<Output = Result<(), LinkError>>,
    {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(LinkError::Closed),
            () = cancel.cancelled() => Ok(()),
            result = loops => result,
        }
    }
}

/// Move datagrams from `socket` into `sink`, reporting each sender to
/// `on_peer` before its datagram is forwarded.
///
/// Oversized datagrams are dropped and their sender is not reported.
async fn read_loop(
    socket: &UdpSocket,
    sink: &PacketSender,
    mut on_peer: impl FnMut(SocketAddr),
) -> Result<(), LinkError> {
    // One spare byte so an oversized datagram is detected instead of
    // silently truncated.
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await.map_err(LinkError::Read)?;
        let datagram = match Datagram::copy_from(&buf[..n]) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(%peer, len = e.len, "Dropping oversized datagram");
                continue;
            }
        };
        on_peer(peer);
        sink.send(datagram)
            .await
            .map_err(|_| LinkError::ChannelClosed)?;
    }
}

/// Drain `source` onto the socket via `send`.
async fn write_loop<S, Fut>(source: &mut PacketReceiver, mut send: S) -> Result<(), LinkError>
where
    S: FnMut(Datagram) -> Fut,
    Fut: Future<Output = Result<(), LinkError>>,
{
    while let Some(datagram) = source.recv().await {
        send(datagram).await?;
    }
    debug!("Packet source closed");
    Err(LinkError::ChannelClosed)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::channel::packet_channel;

    #[tokio::test]
    async fn resolves_literal_address() {
        let addr = resolve("127.0.0.1:7000").await.unwrap();
        assert_eq!(addr, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn resolve_without_port_fails() {
        assert!(matches!(
            resolve("127.0.0.1").await,
            Err(LinkError::Resolve { .. })
        ));
    }

    #[test]
    fn unspecified_matches_family() {
        let v4: SocketAddr = "10.0.0.1:9".parse().unwrap();
        let v6: SocketAddr = "[::1]:9".parse().unwrap();
        assert!(unspecified_for(v4).is_ipv4());
        assert!(unspecified_for(v6).is_ipv6());
    }

    #[tokio::test]
    async fn source_is_taken_once() {
        let (tx, rx) = packet_channel();
        let bridge = Bridge::new(tx, rx);
        bridge.take_source().await.unwrap();
        assert!(matches!(
            bridge.take_source().await,
            Err(LinkError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn closed_bridge_does_not_start() {
        let (tx, rx) = packet_channel();
        let bridge = Bridge::new(tx, rx);
        bridge.close();
        bridge.close();
        assert!(matches!(bridge.take_source().await, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn oversized_datagram_is_dropped_and_loop_continues() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger
            .send_to(&vec![0u8; MAX_PACKET_SIZE + 1], addr)
            .await
            .unwrap();
        client.send_to(b"valid", addr).await.unwrap();

        let (tx, mut rx) = packet_channel();
        let mut peers = Vec::new();
        let reading = read_loop(&socket, &tx, |peer| peers.push(peer));
        let datagram = tokio::select! {
            result = reading => panic!("read loop ended: {result:?}"),
            datagram = rx.recv() => datagram.unwrap(),
        };
        assert_eq!(datagram.as_bytes(), b"valid");
        assert_eq!(peers, vec![client.local_addr().unwrap()]);
    }
}
