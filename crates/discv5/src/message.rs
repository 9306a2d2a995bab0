//! Typed discv5 messages: the cleartext of every decrypted packet is
//! `message_id (1 byte) ‖ rlp(payload_tuple)`. This module is the
//! statically-enumerated replacement for a dynamic message-class registry —
//! decoding dispatches on the id byte to the matching variant directly.

use crate::enr::NodeRecord;
use crate::error::MessageDecodeError;
use bytes::{Bytes, BytesMut};
use discv5_rlp::{decode::RLPDecode, encode::RLPEncode, structs::Decoder};
use std::net::IpAddr;

/// Opaque request identifier, up to 8 bytes, echoed verbatim in responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub Bytes);

impl RequestId {
    /// Draws a fresh 8-byte id from the CSPRNG.
    pub fn random() -> Self {
        let bytes: [u8; 8] = rand::random();
        Self(Bytes::copy_from_slice(&bytes))
    }
}

impl RLPEncode for RequestId {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        self.0.encode(buf)
    }
}

impl RLPDecode for RequestId {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), discv5_rlp::error::RLPDecodeError> {
        let (bytes, rest) = Bytes::decode_unfinished(rlp)?;
        Ok((RequestId(bytes), rest))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ping {
    pub request_id: RequestId,
    pub enr_seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pong {
    pub request_id: RequestId,
    pub enr_seq: u64,
    pub observed_ip: IpAddr,
    pub observed_udp_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindNode {
    pub request_id: RequestId,
    pub distances: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Nodes {
    pub request_id: RequestId,
    /// Total number of NODES packets making up this response; a single
    /// logical response may be split across several packets to respect the
    /// 1280-byte datagram ceiling.
    pub total: u8,
    pub enrs: Vec<NodeRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TalkRequest {
    pub request_id: RequestId,
    pub protocol: Bytes,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TalkResponse {
    pub request_id: RequestId,
    /// An empty payload means "protocol unsupported"; callers cannot tell
    /// that apart from "supported but genuinely has nothing to say."
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Nodes(Nodes),
    TalkRequest(TalkRequest),
    TalkResponse(TalkResponse),
}

impl Message {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Message::Ping(m) => &m.request_id,
            Message::Pong(m) => &m.request_id,
            Message::FindNode(m) => &m.request_id,
            Message::Nodes(m) => &m.request_id,
            Message::TalkRequest(m) => &m.request_id,
            Message::TalkResponse(m) => &m.request_id,
        }
    }

    /// `true` for message kinds that complete a pending request rather than
    /// starting a new one.
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Pong(_) | Message::Nodes(_) | Message::TalkResponse(_))
    }

    pub fn message_id(&self) -> u8 {
        match self {
            Message::Ping(_) => 1,
            Message::Pong(_) => 2,
            Message::FindNode(_) => 3,
            Message::Nodes(_) => 4,
            Message::TalkRequest(_) => 5,
            Message::TalkResponse(_) => 6,
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[self.message_id()]);
        match self {
            Message::Ping(m) => {
                (m.request_id.clone(), m.enr_seq).encode(&mut buf);
            }
            Message::Pong(m) => {
                (
                    m.request_id.clone(),
                    m.enr_seq,
                    m.observed_ip,
                    m.observed_udp_port,
                )
                    .encode(&mut buf);
            }
            Message::FindNode(m) => {
                (m.request_id.clone(), m.distances.clone()).encode(&mut buf);
            }
            Message::Nodes(m) => {
                (m.request_id.clone(), m.total, m.enrs.clone()).encode(&mut buf);
            }
            Message::TalkRequest(m) => {
                (m.request_id.clone(), m.protocol.clone(), m.payload.clone()).encode(&mut buf);
            }
            Message::TalkResponse(m) => {
                (m.request_id.clone(), m.payload.clone()).encode(&mut buf);
            }
        }
        buf.to_vec()
    }

    pub fn decode(cleartext: &[u8]) -> Result<Self, MessageDecodeError> {
        let (id, payload) = cleartext.split_first().ok_or(MessageDecodeError::Empty)?;
        let decoder = Decoder::new(payload).map_err(MessageDecodeError::Rlp)?;
        match id {
            1 => {
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
                decoder.finish().map_err(MessageDecodeError::Rlp)?;
                Ok(Message::Ping(Ping {
                    request_id,
                    enr_seq,
                }))
            }
            2 => {
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
                let (observed_ip, decoder) = decoder.decode_field("observed_ip")?;
                let (observed_udp_port, decoder) = decoder.decode_field("observed_udp_port")?;
                decoder.finish().map_err(MessageDecodeError::Rlp)?;
                Ok(Message::Pong(Pong {
                    request_id,
                    enr_seq,
                    observed_ip,
                    observed_udp_port,
                }))
            }
            3 => {
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (distances, decoder) = decoder.decode_field("distances")?;
                decoder.finish().map_err(MessageDecodeError::Rlp)?;
                Ok(Message::FindNode(FindNode {
                    request_id,
                    distances,
                }))
            }
            4 => {
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (total, decoder) = decoder.decode_field("total")?;
                let (enrs, decoder) = decoder.decode_field("enrs")?;
                decoder.finish().map_err(MessageDecodeError::Rlp)?;
                Ok(Message::Nodes(Nodes {
                    request_id,
                    total,
                    enrs,
                }))
            }
            5 => {
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (protocol, decoder) = decoder.decode_field("protocol")?;
                let (payload, decoder) = decoder.decode_field("payload")?;
                decoder.finish().map_err(MessageDecodeError::Rlp)?;
                Ok(Message::TalkRequest(TalkRequest {
                    request_id,
                    protocol,
                    payload,
                }))
            }
            6 => {
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (payload, decoder) = decoder.decode_field("payload")?;
                decoder.finish().map_err(MessageDecodeError::Rlp)?;
                Ok(Message::TalkResponse(TalkResponse {
                    request_id,
                    payload,
                }))
            }
            other => Err(MessageDecodeError::UnknownMessageId(*other)),
        }
    }
}
