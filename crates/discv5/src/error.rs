//! Error kinds for the discovery core.
//!
//! Steady-state errors are never fatal: decoding failures, timeouts and
//! validation errors are logged and either dropped or surfaced to the
//! specific caller that can act on them. Only initialization-time errors
//! (e.g. registering the same talk protocol twice) are fatal.

use crate::node::NodeId;
use discv5_rlp::error::RLPDecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Discv5Error {
    #[error("packet decode error: {0}")]
    PacketDecode(#[from] PacketDecodeError),
    #[error("message decode error: {0}")]
    MessageDecode(#[from] MessageDecodeError),
    #[error("request to {0:?} timed out")]
    TooSlow(NodeId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("protocol not supported")]
    ProtocolNotSupported,
    #[error("duplicate protocol registration: {0:?}")]
    DuplicateProtocol(Vec<u8>),
    #[error("find-nodes response was empty")]
    EmptyFindNodesResponse,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PacketDecodeError {
    #[error("packet shorter than the minimum tag length")]
    TooShort,
    #[error("packet exceeds the maximum datagram size")]
    TooLong,
    #[error("malformed auth section: {0}")]
    Rlp(#[from] RLPDecodeError),
    #[error("AES-GCM authentication failed")]
    DecryptionFailed,
    #[error("unrecognized auth section shape")]
    UnknownShape,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MessageDecodeError {
    #[error("empty message buffer")]
    Empty,
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),
    #[error("rlp error: {0}")]
    Rlp(#[from] RLPDecodeError),
}

/// Signaled by [`crate::enr_db::EnrDatabase::set`] when the record's sequence
/// number does not exceed the one already stored. Caller decides whether to
/// treat this as noteworthy; by default it is silently ignored.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("old sequence number")]
pub struct OldSequenceNumber;
