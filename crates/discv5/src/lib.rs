//! Core of a peer-to-peer node implementing Ethereum's Discovery v5 protocol.
//!
//! This crate owns the hard engineering of the system: the Kademlia routing
//! table, the per-peer session/handshake state machine and packet codec, and
//! the network loop that correlates requests with responses, runs iterative
//! find-nodes lookups and keeps the routing table fresh.
//!
//! Plumbing that is not specific to discovery (the UDP socket, ENR/key file
//! persistence, the CLI front-end, logging setup) lives at the edges and is
//! only referenced here through small traits.

pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod enr;
pub mod enr_db;
pub mod error;
pub mod identity;
pub mod kademlia;
pub mod lookup;
pub mod maintenance;
pub mod message;
pub mod network;
pub mod node;
pub mod packet;
pub mod pool;
pub mod session;
pub mod socket;
pub mod unresponsive;

pub use config::Config;
pub use enr::NodeRecord;
pub use error::Discv5Error;
pub use network::Network;
pub use node::{Endpoint, NodeId};
