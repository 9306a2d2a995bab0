//! Thin wrapper around a bound UDP socket. Kept separate from
//! [`crate::network`] so the receive loop and the rest of the node's
//! plumbing are easy to reason about independently.

use crate::node::Endpoint;
use crate::packet::MAX_PACKET_SIZE;
use std::io;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    pub async fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let socket = UdpSocket::bind(endpoint.socket_addr()).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.socket.local_addr().map(Endpoint::from)
    }

    pub async fn send_to(&self, datagram: &[u8], to: Endpoint) -> io::Result<usize> {
        self.socket.send_to(datagram, to.socket_addr()).await
    }

    /// Blocks until a datagram arrives, returning it along with the sender's
    /// endpoint. Datagrams above [`MAX_PACKET_SIZE`] are truncated by the OS
    /// before this call sees them; the packet codec rejects those as
    /// malformed rather than this layer trying to detect truncation.
    pub async fn recv_from(&self, buf: &mut [u8; MAX_PACKET_SIZE]) -> io::Result<(usize, Endpoint)> {
        let (len, from) = self.socket.recv_from(buf).await?;
        Ok((len, Endpoint::from(from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn two_transports_can_exchange_a_datagram() {
        let a = Transport::bind(Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let b = Transport::bind(Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let b_endpoint = b.local_endpoint().unwrap();

        a.send_to(b"hello", b_endpoint).await.unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
