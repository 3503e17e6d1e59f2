//! UDP link to the mosh process on this host.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Bridge, LinkError, read_loop, write_loop};
use crate::channel::{PacketReceiver, PacketSender};
use crate::error::SessionError;
use crate::stopper::Stopper;

/// How the loopback socket finds its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackMode {
    /// Client role: bind an ephemeral port for `mosh-client` to send to and
    /// reply to whoever sent last.
    Listen,
    /// Server role: dial the port `mosh-server` reported.
    Dial(u16),
}

/// Loopback side of the pipeline.
#[derive(Debug)]
pub struct LocalLoopbackLink {
    mode: LoopbackMode,
    local_addr: OnceLock<SocketAddr>,
    bridge: Bridge,
}

impl LocalLoopbackLink {
    /// Client-role link. `sink` receives datagrams from `mosh-client`;
    /// `source` supplies the datagrams sent back to it.
    pub fn listener(sink: PacketSender, source: PacketReceiver) -> Self {
        Self::new(LoopbackMode::Listen, sink, source)
    }

    /// Server-role link to `mosh-server` on `127.0.0.1:<port>`.
    pub fn dialer(port: u16, sink: PacketSender, source: PacketReceiver) -> Self {
        Self::new(LoopbackMode::Dial(port), sink, source)
    }

    fn new(mode: LoopbackMode, sink: PacketSender, source: PacketReceiver) -> Self {
        Self {
            mode,
            local_addr: OnceLock::new(),
            bridge: Bridge::new(sink, source),
        }
    }

    /// Bound socket address; `None` until `run` has bound the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Poll [`local_addr`](Self::local_addr) every `interval` until the
    /// socket is bound. `None` if `cancel` fires first.
    pub async fn wait_bound(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Option<SocketAddr> {
        loop {
            if let Some(addr) = self.local_addr() {
                return Some(addr);
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Bind (or dial) and forward datagrams until the first error.
    ///
    /// Returns `Ok` when `cancel` fires and [`LinkError::Closed`] after
    /// [`stop`](Self::stop).
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), LinkError> {
        let mut source = self.bridge.take_source().await?;
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(LinkError::Bind)?;

        match self.mode {
            LoopbackMode::Listen => {
                let addr = socket.local_addr().map_err(LinkError::Bind)?;
                let _ = self.local_addr.set(addr);
                info!(%addr, "Loopback link listening");
                self.bridge
                    .run(cancel, self.relay_last_peer(&socket, &mut source))
                    .await
            }
            LoopbackMode::Dial(port) => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                socket
                    .connect(addr)
                    .await
                    .map_err(|source| LinkError::Dial { addr, source })?;
                if let Ok(local) = socket.local_addr() {
                    let _ = self.local_addr.set(local);
                }
                info!(%addr, "Loopback link dialed mosh server");
                self.bridge
                    .run(cancel, self.relay_connected(&socket, &mut source))
                    .await
            }
        }
    }

    async fn relay_connected(
        &self,
        socket: &UdpSocket,
        source: &mut PacketReceiver,
    ) -> Result<(), LinkError> {
        tokio::try_join!(
            read_loop(socket, &self.bridge.sink, |_| {}),
            write_loop(source, move |datagram| async move {
                socket
                    .send(datagram.as_bytes())
                    .await
                    .map(drop)
                    .map_err(LinkError::Write)
            }),
        )
        .map(drop)
    }

    /// The read loop publishes each sender; the write loop replies to the
    /// most recent one.
    async fn relay_last_peer(
        &self,
        socket: &UdpSocket,
        source: &mut PacketReceiver,
    ) -> Result<(), LinkError> {
        let (peer_tx, peer_rx) = watch::channel(None);
        let remember = |peer: SocketAddr| {
            let _ = peer_tx.send_if_modified(|last| {
                if *last == Some(peer) {
                    return false;
                }
                debug!(%peer, "Loopback peer changed");
                *last = Some(peer);
                true
            });
        };
        let peer_rx = &peer_rx;

        tokio::try_join!(
            read_loop(socket, &self.bridge.sink, remember),
            write_loop(source, move |datagram| async move {
                let last = *peer_rx.borrow();
                let peer = match reply_target(last) {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!(error = %e, len = datagram.len(), "Dropping datagram");
                        return Ok(());
                    }
                };
                socket
                    .send_to(datagram.as_bytes(), peer)
                    .await
                    .map(drop)
                    .map_err(LinkError::Write)
            }),
        )
        .map(drop)
    }

    /// Close the link; the running `run` returns [`LinkError::Closed`].
    /// Safe to call any number of times, before or after `run`.
    pub fn stop(&self) {
        self.bridge.close();
    }
}

/// Destination for a client-role write: the last peer seen by the read
/// loop, or [`LinkError::NoPeer`] if nothing has been received yet.
pub fn reply_target(last_peer: Option<SocketAddr>) -> Result<SocketAddr, LinkError> {
    last_peer.ok_or(LinkError::NoPeer)
}

#[async_trait]
impl Stopper for LocalLoopbackLink {
    fn component(&self) -> &'static str {
        "loopback link"
    }

    async fn stop(&self) -> Result<(), SessionError> {
        Self::stop(self);
        Ok(())
    }
}
