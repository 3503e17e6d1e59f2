//! UDP link to the rendezvous relay server.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::info;

use moshrelay_core::protocol::announce_payload;

use super::{Bridge, LinkError, read_loop, unspecified_for, write_loop};
use crate::channel::{PacketReceiver, PacketSender};
use crate::error::SessionError;
use crate::stopper::Stopper;

/// Dials the relay, announces the rendezvous key, then forwards datagrams
/// both ways until stopped.
#[derive(Debug)]
pub struct RelayLink {
    relay_addr: SocketAddr,
    api_key: String,
    rendezvous_key: String,
    bridge: Bridge,
}

impl RelayLink {
    /// `sink` receives datagrams from the relay; `source` supplies the
    /// datagrams sent to it.
    pub fn new(
        relay_addr: SocketAddr,
        api_key: impl Into<String>,
        rendezvous_key: impl Into<String>,
        sink: PacketSender,
        source: PacketReceiver,
    ) -> Self {
        Self {
            relay_addr,
            api_key: api_key.into(),
            rendezvous_key: rendezvous_key.into(),
            bridge: Bridge::new(sink, source),
        }
    }

    /// Dial, announce, and relay until the first error.
    ///
    /// Returns `Ok` when `cancel` fires and [`LinkError::Closed`] after
    /// [`stop`](Self::stop).
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), LinkError> {
        let mut source = self.bridge.take_source().await?;
        let relay_addr = self.relay_addr;

        let socket = UdpSocket::bind(unspecified_for(relay_addr))
            .await
            .map_err(LinkError::Bind)?;
        socket
            .connect(relay_addr)
            .await
            .map_err(|source| LinkError::Dial {
                addr: relay_addr,
                source,
            })?;
        socket
            .send(announce_payload(&self.api_key, &self.rendezvous_key).as_bytes())
            .await
            .map_err(LinkError::Announce)?;
        info!(relay = %relay_addr, local = ?socket.local_addr().ok(), "Announced to relay server");

        let socket = &socket;
        let loops = async {
            tokio::try_join!(
                read_loop(socket, &self.bridge.sink, |_| {}),
                write_loop(&mut source, move |datagram| async move {
                    socket
                        .send(datagram.as_bytes())
                        .await
                        .map(drop)
                        .map_err(LinkError::Write)
                }),
            )
            .map(drop)
        };
        self.bridge.run(cancel, loops).await
    }

    /// Close the link; the running `connect` returns [`LinkError::Closed`].
    /// Safe to call any number of times, before or after `connect`.
    pub fn stop(&self) {
        self.bridge.close();
    }
}

#[async_trait]
impl Stopper for RelayLink {
    fn component(&self) -> &'static str {
        "relay link"
    }

    async fn stop(&self) -> Result<(), SessionError> {
        Self::stop(self);
        Ok(())
    }
}
