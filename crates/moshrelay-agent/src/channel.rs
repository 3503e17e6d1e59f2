//! Packet channels between adjacent pipeline stages.
//!
//! A [`Datagram`] is moved into the channel by its producer; the consumer
//! owns it from then on, so buffers are never shared between stages.

use tokio::sync::mpsc;

use moshrelay_core::protocol::{MAX_PACKET_SIZE, PACKET_CHANNEL_CAPACITY};

/// Sending half of a packet channel.
pub type PacketSender = mpsc::Sender<Datagram>;

/// Receiving half of a packet channel.
pub type PacketReceiver = mpsc::Receiver<Datagram>;

/// Create an ordered packet channel for one direction of the pipeline.
pub fn packet_channel() -> (PacketSender, PacketReceiver) {
    mpsc::channel(PACKET_CHANNEL_CAPACITY)
}

/// Payload larger than [`MAX_PACKET_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("datagram of {len} bytes exceeds the {max} byte limit", max = MAX_PACKET_SIZE)]
pub struct OversizedDatagram {
    pub len: usize,
}

/// One relayed UDP payload, at most [`MAX_PACKET_SIZE`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram(Vec<u8>);

impl Datagram {
    pub fn new(bytes: Vec<u8>) -> Result<Self, OversizedDatagram> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(OversizedDatagram { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// Copy the received portion of a read buffer into a fresh datagram.
    pub fn copy_from(bytes: &[u8]) -> Result<Self, OversizedDatagram> {
        Self::new(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_payload() {
        assert_eq!(
            Datagram::new(vec![0; MAX_PACKET_SIZE + 1]),
            Err(OversizedDatagram {
                len: MAX_PACKET_SIZE + 1
            })
        );
        assert_eq!(Datagram::new(vec![7; MAX_PACKET_SIZE]).unwrap().len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn copy_is_length_exact() {
        let buf = [1u8, 2, 3, 0, 0, 0];
        let datagram = Datagram::copy_from(&buf[..3]).unwrap();
        assert_eq!(datagram.as_bytes(), &[1, 2, 3]);
        assert!(!datagram.is_empty());
    }

    #[tokio::test]
    async fn channel_preserves_order_and_bytes() {
        let (tx, mut rx) = packet_channel();
        for len in [1usize, 2, 700, MAX_PACKET_SIZE] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            tx.send(Datagram::new(payload).unwrap()).await.unwrap();
        }
        for len in [1usize, 2, 700, MAX_PACKET_SIZE] {
            let datagram = rx.recv().await.unwrap();
            assert_eq!(datagram.len(), len);
            assert!(datagram
                .as_bytes()
                .iter()
                .enumerate()
                .all(|(i, b)| *b == (i % 251) as u8));
        }
    }
}
