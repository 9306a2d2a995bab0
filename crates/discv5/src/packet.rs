//! Component D: the packet codec. Every datagram shares a 32-byte tag
//! prefix and is one of three shapes — an ordinary encrypted message, a
//! WHOAREYOU challenge, or a handshake response — discriminated by the
//! fixed magic string and by how many fields the auth section's RLP list
//! carries.

use crate::enr::NodeRecord;
use crate::error::PacketDecodeError;
use crate::node::NodeId;
use bytes::Bytes;
use discv5_rlp::{
    decode::{decode_rlp_item, get_item_with_prefix, RLPDecode},
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use ethereum_types::H256;
use sha2::{Digest, Sha256};

pub const TAG_SIZE: usize = 32;
pub const MAX_PACKET_SIZE: usize = 1280;
pub const AUTH_TAG_SIZE: usize = 12;

/// Marks a WHOAREYOU packet where an ordinary packet's auth tag would
/// otherwise begin. Truncated from the literal "WHOAREYOU" to the 8-byte
/// length the external interface calls for.
const WHOAREYOU_MAGIC: [u8; 8] = *b"WHOAREYO";

const SIG_SIZE: usize = 64;
const EPH_KEY_SIZE: usize = 33;

/// `sha256(destination_node_id) XOR source_node_id`. Recoverable by the
/// recipient once it knows its own id, since `sha256(dest) XOR tag ==
/// source` when `dest == local_node_id`.
pub fn compute_tag(local_node_id: NodeId, dest_node_id: NodeId) -> [u8; TAG_SIZE] {
    let digest = Sha256::digest(dest_node_id.as_bytes());
    let mut tag = [0u8; TAG_SIZE];
    for i in 0..TAG_SIZE {
        tag[i] = digest[i] ^ local_node_id.as_bytes()[i];
    }
    tag
}

pub fn recover_source_node_id(tag: &[u8; TAG_SIZE], local_node_id: NodeId) -> NodeId {
    let digest = Sha256::digest(local_node_id.as_bytes());
    let mut source = [0u8; TAG_SIZE];
    for i in 0..TAG_SIZE {
        source[i] = digest[i] ^ tag[i];
    }
    H256::from(source)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `tag ‖ rlp([auth_tag]) ‖ AES-GCM(nonce=auth_tag, aad=tag, pt=message)`.
    Message {
        auth_tag: [u8; AUTH_TAG_SIZE],
        ciphertext: Bytes,
    },
    /// `tag ‖ magic ‖ rlp([token, id_nonce, enr_seq])`.
    WhoAreYou {
        token: Bytes,
        id_nonce: [u8; 32],
        enr_seq: u64,
    },
    /// `tag ‖ rlp([nonce, [sig_size, eph_key_size], id_nonce_sig,
    /// ephemeral_pubkey, optional_enr]) ‖ AES-GCM(nonce, aad=tag, pt=message)`.
    HandshakeResponse {
        nonce: [u8; AUTH_TAG_SIZE],
        id_nonce_sig: [u8; SIG_SIZE],
        ephemeral_pubkey: [u8; EPH_KEY_SIZE],
        enr: Option<NodeRecord>,
        ciphertext: Bytes,
    },
}

impl Packet {
    pub fn encode(&self, tag: [u8; TAG_SIZE]) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&tag);
        match self {
            Packet::Message {
                auth_tag,
                ciphertext,
            } => {
                let mut auth = Vec::new();
                Encoder::new(&mut auth).encode_field(auth_tag).finish();
                out.extend_from_slice(&auth);
                out.extend_from_slice(ciphertext);
            }
            Packet::WhoAreYou {
                token,
                id_nonce,
                enr_seq,
            } => {
                out.extend_from_slice(&WHOAREYOU_MAGIC);
                let mut body = Vec::new();
                Encoder::new(&mut body)
                    .encode_field(token)
                    .encode_field(id_nonce)
                    .encode_field(enr_seq)
                    .finish();
                out.extend_from_slice(&body);
            }
            Packet::HandshakeResponse {
                nonce,
                id_nonce_sig,
                ephemeral_pubkey,
                enr,
                ciphertext,
            } => {
                let mut auth = Vec::new();
                Encoder::new(&mut auth)
                    .encode_field(nonce)
                    .encode_field(&(id_nonce_sig.len(), ephemeral_pubkey.len()))
                    .encode_field(id_nonce_sig)
                    .encode_field(ephemeral_pubkey)
                    .encode_optional_field(enr)
                    .finish();
                out.extend_from_slice(&auth);
                out.extend_from_slice(ciphertext);
            }
        }
        out
    }

    /// Decodes a datagram, recovering the sender's node id along the way
    /// (the tag only reveals it once XORed against the local id).
    pub fn decode(
        datagram: &[u8],
        local_node_id: NodeId,
    ) -> Result<(NodeId, Packet), PacketDecodeError> {
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(PacketDecodeError::TooLong);
        }
        if datagram.len() < TAG_SIZE {
            return Err(PacketDecodeError::TooShort);
        }
        let (tag_bytes, rest) = datagram.split_at(TAG_SIZE);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(tag_bytes);
        let source = recover_source_node_id(&tag, local_node_id);

        if rest.len() >= WHOAREYOU_MAGIC.len() && rest[..WHOAREYOU_MAGIC.len()] == WHOAREYOU_MAGIC
        {
            let body = &rest[WHOAREYOU_MAGIC.len()..];
            let decoder = Decoder::new(body)?;
            let (token, decoder) = decoder.decode_field::<Bytes>("token")?;
            let (id_nonce, decoder) = decoder.decode_field::<[u8; 32]>("id_nonce")?;
            let (enr_seq, decoder) = decoder.decode_field::<u64>("enr_seq")?;
            decoder.finish()?;
            return Ok((
                source,
                Packet::WhoAreYou {
                    token,
                    id_nonce,
                    enr_seq,
                },
            ));
        }

        let (auth_item, after_auth) = get_item_with_prefix(rest)?;
        let (_, payload, _) = decode_rlp_item(auth_item)?;
        let field_count = count_list_items(payload)?;
        let ciphertext = Bytes::copy_from_slice(after_auth);

        match field_count {
            1 => {
                let decoder = Decoder::new(auth_item)?;
                let (auth_tag, decoder) = decoder.decode_field::<[u8; AUTH_TAG_SIZE]>("auth_tag")?;
                decoder.finish()?;
                Ok((
                    source,
                    Packet::Message {
                        auth_tag,
                        ciphertext,
                    },
                ))
            }
            4 | 5 => {
                let decoder = Decoder::new(auth_item)?;
                let (nonce, decoder) = decoder.decode_field::<[u8; AUTH_TAG_SIZE]>("nonce")?;
                let ((sig_size, eph_key_size), decoder) =
                    decoder.decode_field::<(usize, usize)>("sizes")?;
                if sig_size != SIG_SIZE || eph_key_size != EPH_KEY_SIZE {
                    return Err(PacketDecodeError::UnknownShape);
                }
                let (id_nonce_sig, decoder) =
                    decoder.decode_field::<[u8; SIG_SIZE]>("id_nonce_sig")?;
                let (ephemeral_pubkey, decoder) =
                    decoder.decode_field::<[u8; EPH_KEY_SIZE]>("ephemeral_pubkey")?;
                let (enr, decoder) = decoder.decode_optional_field::<NodeRecord>();
                decoder.finish()?;
                Ok((
                    source,
                    Packet::HandshakeResponse {
                        nonce,
                        id_nonce_sig,
                        ephemeral_pubkey,
                        enr,
                        ciphertext,
                    },
                ))
            }
            _ => Err(PacketDecodeError::UnknownShape),
        }
    }
}

fn count_list_items(mut payload: &[u8]) -> Result<usize, RLPDecodeError> {
    let mut count = 0;
    while !payload.is_empty() {
        let (_, rest) = get_item_with_prefix(payload)?;
        count += 1;
        payload = rest;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_to_recover_source() {
        let local = H256::random();
        let source = H256::random();
        let tag = compute_tag(local, source);
        assert_eq!(recover_source_node_id(&tag, local), source);
    }

    #[test]
    fn message_packet_round_trips() {
        let local = H256::random();
        let peer = H256::random();
        let tag = compute_tag(peer, local);
        let packet = Packet::Message {
            auth_tag: [7u8; AUTH_TAG_SIZE],
            ciphertext: Bytes::from_static(b"sealed-bytes-here"),
        };
        let encoded = packet.encode(tag);
        let (source, decoded) = Packet::decode(&encoded, local).unwrap();
        assert_eq!(source, peer);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn whoareyou_packet_round_trips() {
        let local = H256::random();
        let peer = H256::random();
        let tag = compute_tag(peer, local);
        let packet = Packet::WhoAreYou {
            token: Bytes::from_static(b"abcdefgh"),
            id_nonce: [3u8; 32],
            enr_seq: 9,
        };
        let encoded = packet.encode(tag);
        let (source, decoded) = Packet::decode(&encoded, local).unwrap();
        assert_eq!(source, peer);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn handshake_response_round_trips_without_enr() {
        let local = H256::random();
        let peer = H256::random();
        let tag = compute_tag(peer, local);
        let packet = Packet::HandshakeResponse {
            nonce: [1u8; AUTH_TAG_SIZE],
            id_nonce_sig: [2u8; SIG_SIZE],
            ephemeral_pubkey: [3u8; EPH_KEY_SIZE],
            enr: None,
            ciphertext: Bytes::from_static(b"ciphertext"),
        };
        let encoded = packet.encode(tag);
        let (source, decoded) = Packet::decode(&encoded, local).unwrap();
        assert_eq!(source, peer);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn handshake_response_round_trips_with_enr() {
        use crate::enr::Pairs;
        use secp256k1::SecretKey;

        let local = H256::random();
        let peer = H256::random();
        let tag = compute_tag(peer, local);
        let signer = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let pubkey = secp256k1::PublicKey::from_secret_key(secp256k1::SECP256K1, &signer);
        let enr = NodeRecord::sign(
            1,
            Pairs {
                id: Some("v4".into()),
                secp256k1: Some(ethereum_types::H264::from_slice(&pubkey.serialize())),
                ip: None,
                udp_port: Some(9000),
            },
            &signer,
        )
        .unwrap();
        let packet = Packet::HandshakeResponse {
            nonce: [1u8; AUTH_TAG_SIZE],
            id_nonce_sig: [2u8; SIG_SIZE],
            ephemeral_pubkey: [3u8; EPH_KEY_SIZE],
            enr: Some(enr),
            ciphertext: Bytes::from_static(b"ciphertext"),
        };
        let encoded = packet.encode(tag);
        let (source, decoded) = Packet::decode(&encoded, local).unwrap();
        assert_eq!(source, peer);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn too_short_datagram_is_rejected() {
        let local = H256::random();
        let err = Packet::decode(&[0u8; 4], local).unwrap_err();
        assert_eq!(err, PacketDecodeError::TooShort);
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let local = H256::random();
        let err = Packet::decode(&[0u8; MAX_PACKET_SIZE + 1], local).unwrap_err();
        assert_eq!(err, PacketDecodeError::TooLong);
    }
}
