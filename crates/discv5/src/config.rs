//! Node-level configuration: where state is persisted, what address to
//! listen on, which peers to bootstrap from, and the static identity key.

use crate::node::Endpoint;
use secp256k1::SecretKey;
use std::net::IpAddr;
use std::path::PathBuf;

/// A bootstrap peer, given as an ENR-derived endpoint plus its node id, or
/// just learned lazily via the `ENR`. In practice bootnodes are usually
/// configured by their base64 ENR string; that parsing lives at the CLI
/// edge, not here.
#[derive(Debug, Clone)]
pub struct Bootnode {
    pub node_id: crate::node::NodeId,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for on-disk state: the ENR database and, unless a
    /// `private_key` is given directly, the persisted node key.
    pub base_dir: PathBuf,
    /// Address the UDP socket binds to.
    pub listen_on: IpAddr,
    pub port: u16,
    pub bootnodes: Vec<Bootnode>,
    /// Static identity key. When `None`, the node loads or generates one
    /// under `base_dir` on startup.
    pub private_key: Option<SecretKey>,
}

impl Config {
    pub fn listen_endpoint(&self) -> Endpoint {
        Endpoint::new(self.listen_on, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn listen_endpoint_combines_host_and_port() {
        let config = Config {
            base_dir: PathBuf::from("/tmp/discv5"),
            listen_on: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            bootnodes: Vec::new(),
            private_key: None,
        };
        assert_eq!(config.listen_endpoint().udp_port, 9000);
    }
}
