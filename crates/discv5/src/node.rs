//! Core identifiers: the 32-byte `NodeId` and the `(ip, udp_port)` endpoint.

use ethereum_types::{H256, U256};
use rand::Rng;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A 32-byte node identifier, derived from a public key per the identity scheme.
pub type NodeId = H256;

/// A UDP endpoint as advertised in an ENR or learned from a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp_port: u16) -> Self {
        Self { ip, udp_port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.udp_port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            udp_port: addr.port(),
        }
    }
}

/// A peer handle: a node id paired with the endpoint we believe reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl Peer {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}@{}", self.id, self.endpoint)
    }
}

/// `⌊log₂(a ⊕ b)⌋ + 1`, or `0` when `a == b`. Values range over `0..=256`.
pub fn log_distance(a: NodeId, b: NodeId) -> usize {
    let xor = a ^ b;
    U256::from_big_endian(xor.as_bytes()).bits()
}

/// Draws a random id at exactly `log_distance(local, id) == distance`, used
/// to target bucket-refresh lookups at a specific, otherwise-empty region of
/// id-space. `distance == 0` returns `local` itself.
pub fn random_id_at_log_distance(local: NodeId, distance: usize) -> NodeId {
    if distance == 0 {
        return local;
    }
    let bit_index = distance - 1;
    let byte_idx = 31 - bit_index / 8;
    let bit_in_byte = bit_index % 8;

    let mut bytes = local.to_fixed_bytes();
    // Flip the target bit so the xor's highest set bit lands exactly here.
    bytes[byte_idx] ^= 1 << bit_in_byte;

    let mut rng = rand::thread_rng();
    // Bits above the target bit must stay equal to `local`'s (or the xor's
    // highest set bit would move); bits below it are free to vary.
    let low_mask: u8 = (1u16 << bit_in_byte).wrapping_sub(1) as u8;
    let random_byte: u8 = rng.gen();
    bytes[byte_idx] = (bytes[byte_idx] & !low_mask) | (random_byte & low_mask);
    for byte in bytes.iter_mut().skip(byte_idx + 1) {
        *byte = rng.gen();
    }
    H256::from(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = NodeId::random();
        assert_eq!(log_distance(id, id), 0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(log_distance(a, b), log_distance(b, a));
    }

    #[test]
    fn distance_is_bounded() {
        let a = NodeId::zero();
        let b = NodeId::repeat_byte(0xff);
        assert_eq!(log_distance(a, b), 256);
    }

    #[test]
    fn random_id_at_distance_lands_exactly_there() {
        let local = H256::random();
        for distance in [1, 17, 128, 255, 256] {
            let id = random_id_at_log_distance(local, distance);
            assert_eq!(log_distance(local, id), distance, "distance {distance}");
        }
    }

    #[test]
    fn random_id_at_zero_distance_is_local() {
        let local = H256::random();
        assert_eq!(random_id_at_log_distance(local, 0), local);
    }
}
