//! Ethereum Node Records: a signed, monotonically versioned map from short
//! keys to byte strings. Grounded in the `v4` identity scheme: the record is
//! signed with a secp256k1 key over the canonical RLP encoding of
//! `(seq, kv-pairs)` sorted by key, and the node id is the Keccak-256 hash of
//! the uncompressed public key.

use crate::node::NodeId;
use bytes::{BufMut, Bytes};
use discv5_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use ethereum_types::{H256, H264, H512};
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};
use sha3::{Digest, Keccak256};
use std::net::Ipv4Addr;
use thiserror::Error;

/// RLP-encoded ENRs observed on the wire must not exceed this size.
const MAX_RECORD_ENCODED_SIZE: usize = 300;

#[derive(Debug, Error)]
pub enum EnrError {
    #[error("rlp decode error: {0}")]
    Rlp(#[from] RLPDecodeError),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("signature is invalid")]
    InvalidSignature,
    #[error("unsupported identity scheme: {0}")]
    UnsupportedScheme(String),
}

pub fn node_id_from_public_key(public_key: &H512) -> NodeId {
    let mut buf = [0u8; 64];
    buf.copy_from_slice(public_key.as_bytes());
    let digest = Keccak256::digest(buf);
    NodeId::from_slice(&digest)
}

/// The known key/value pairs of a record. Unknown keys are ignored on
/// decode, matching the "extensible, additional pairs are informational
/// only" stance of the ENR spec.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pairs {
    pub id: Option<String>,
    pub secp256k1: Option<H264>,
    pub ip: Option<Ipv4Addr>,
    pub udp_port: Option<u16>,
}

impl Pairs {
    fn from_raw(raw: &[(Bytes, Bytes)]) -> Result<Self, RLPDecodeError> {
        let mut pairs = Pairs::default();
        for (key, value) in raw {
            match key.as_ref() {
                b"id" => pairs.id = Some(String::decode(value)?),
                b"secp256k1" => pairs.secp256k1 = Some(H264(<[u8; 33]>::decode(value)?)),
                b"ip" => pairs.ip = Some(Ipv4Addr::decode(value)?),
                b"udp" => pairs.udp_port = Some(u16::decode(value)?),
                _ => {}
            }
        }
        Ok(pairs)
    }

    /// Encodes the known pairs in the lexicographic key order the signature
    /// is computed over: `id`, `ip`, `secp256k1`, `udp`.
    fn encode(&self, buf: &mut dyn BufMut) {
        if let Some(id) = &self.id {
            Bytes::from("id").encode(buf);
            id.encode(buf);
        }
        if let Some(ip) = &self.ip {
            Bytes::from("ip").encode(buf);
            ip.encode(buf);
        }
        if let Some(secp256k1) = &self.secp256k1 {
            Bytes::from("secp256k1").encode(buf);
            secp256k1.encode(buf);
        }
        if let Some(udp) = self.udp_port {
            Bytes::from("udp").encode(buf);
            udp.encode(buf);
        }
    }

    /// Returns `true` if `other` carries the same values for every pair that
    /// `self` defines (used to decide whether bumping the local ENR's
    /// sequence number is actually necessary).
    fn contains_all(&self, other: &Pairs) -> bool {
        self.id == other.id && self.secp256k1 == other.secp256k1 && self.udp_port == other.udp_port
    }
}

/// Reference: <https://github.com/ethereum/devp2p/blob/master/enr.md>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub signature: H512,
    pub seq: u64,
    pairs: Pairs,
}

impl NodeRecord {
    /// Builds and signs a fresh record. Used whenever the sequence number is
    /// bumped; see [`crate::identity::build_local_enr`] for the merge policy.
    pub fn sign(seq: u64, pairs: Pairs, signer: &SecretKey) -> Result<Self, EnrError> {
        let mut record = NodeRecord {
            signature: H512::zero(),
            seq,
            pairs,
        };
        record.signature = record.compute_signature(signer);
        Ok(record)
    }

    pub fn pairs(&self) -> &Pairs {
        &self.pairs
    }

    pub fn id_scheme(&self) -> Option<&str> {
        self.pairs.id.as_deref()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        let compressed = self.pairs.secp256k1?;
        PublicKey::from_slice(compressed.as_bytes()).ok()
    }

    pub fn node_id(&self) -> Option<NodeId> {
        let pubkey = self.public_key()?;
        let uncompressed = pubkey.serialize_uncompressed();
        Some(node_id_from_public_key(&H512::from_slice(&uncompressed[1..])))
    }

    pub fn udp_endpoint(&self) -> Option<(Ipv4Addr, u16)> {
        Some((self.pairs.ip?, self.pairs.udp_port?))
    }

    fn signature_digest(&self) -> [u8; 32] {
        let mut pairs_buf = Vec::new();
        self.pairs.encode(&mut pairs_buf);
        let mut rlp = Vec::new();
        Encoder::new(&mut rlp)
            .encode_field(&self.seq)
            .encode_raw(&pairs_buf)
            .finish();
        Keccak256::digest(rlp).into()
    }

    fn compute_signature(&self, signer: &SecretKey) -> H512 {
        let digest = self.signature_digest();
        // The digest is not itself attacker-influenced before signing, so a
        // plain (non-recoverable) ECDSA signature is enough to verify later
        // against the embedded public key.
        let msg = secp256k1::Message::from_digest(digest);
        let sig = secp256k1::SECP256K1.sign_ecdsa(&msg, signer);
        H512::from_slice(&sig.serialize_compact())
    }

    pub fn verify_signature(&self) -> bool {
        let Some(pubkey) = self.public_key() else {
            return false;
        };
        let digest = self.signature_digest();
        let msg = secp256k1::Message::from_digest(digest);
        let Ok(sig) = Signature::from_compact(self.signature.as_bytes()) else {
            return false;
        };
        secp256k1::SECP256K1.verify_ecdsa(&msg, &sig, &pubkey).is_ok()
    }

    /// `true` if every pair carried by `self` is also present, unchanged, in
    /// `other` (order and extra pairs on `other`'s side do not matter).
    pub fn has_same_pairs_as(&self, other: &Pairs) -> bool {
        self.pairs.contains_all(other)
    }
}

impl RLPEncode for NodeRecord {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut pairs_buf = Vec::new();
        self.pairs.encode(&mut pairs_buf);
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.seq)
            .encode_raw(&pairs_buf)
            .finish();
    }
}

impl RLPDecode for NodeRecord {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if rlp.len() > MAX_RECORD_ENCODED_SIZE {
            return Err(RLPDecodeError::InvalidLength);
        }
        let decoder = Decoder::new(rlp)?;
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (seq, decoder) = decoder.decode_field("seq")?;
        let (raw_pairs, decoder) = decode_optional_pairs(Vec::new(), decoder)?;
        let has_id = raw_pairs.iter().any(|(k, _)| k.as_ref() == b"id");
        if !has_id {
            return Err(RLPDecodeError::Custom(
                "invalid node record: 'id' pair missing".into(),
            ));
        }
        let pairs = Pairs::from_raw(&raw_pairs)?;
        let remaining = decoder.finish()?;
        Ok((
            NodeRecord {
                signature,
                seq,
                pairs,
            },
            remaining,
        ))
    }
}

fn decode_optional_pairs(
    mut pairs: Vec<(Bytes, Bytes)>,
    decoder: Decoder,
) -> Result<(Vec<(Bytes, Bytes)>, Decoder), RLPDecodeError> {
    let (key, decoder): (Option<Bytes>, Decoder) = decoder.decode_optional_field();
    if let Some(key) = key {
        let (value, decoder): (Vec<u8>, Decoder) = decoder.get_encoded_item()?;
        pairs.push((key, Bytes::from(value)));
        decode_optional_pairs(pairs, decoder)
    } else {
        Ok((pairs, decoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SecretKey {
        SecretKey::from_slice(&[7u8; 32]).expect("valid scalar")
    }

    fn sample_pairs(signer: &SecretKey, udp: u16) -> Pairs {
        let pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, signer);
        Pairs {
            id: Some("v4".into()),
            secp256k1: Some(H264::from_slice(&pubkey.serialize())),
            ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
            udp_port: Some(udp),
        }
    }

    #[test]
    fn round_trips_through_rlp() {
        let signer = signer();
        let record = NodeRecord::sign(1, sample_pairs(&signer, 30303), &signer).unwrap();
        let encoded = record.encode_to_vec();
        let decoded = NodeRecord::decode(&encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn signature_verifies() {
        let signer = signer();
        let record = NodeRecord::sign(1, sample_pairs(&signer, 30303), &signer).unwrap();
        assert!(record.verify_signature());
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let signer = signer();
        let mut record = NodeRecord::sign(1, sample_pairs(&signer, 30303), &signer).unwrap();
        record.seq += 1;
        assert!(!record.verify_signature());
    }

    #[test]
    fn node_id_matches_keccak_of_uncompressed_pubkey() {
        let signer = signer();
        let record = NodeRecord::sign(1, sample_pairs(&signer, 30303), &signer).unwrap();
        let pubkey = PublicKey::from_secret_key(secp256k1::SECP256K1, &signer);
        let uncompressed = pubkey.serialize_uncompressed();
        let expected = node_id_from_public_key(&H512::from_slice(&uncompressed[1..]));
        assert_eq!(record.node_id(), Some(expected));
    }

    #[test]
    fn decode_rejects_missing_id() {
        let mut rlp = Vec::new();
        Encoder::new(&mut rlp)
            .encode_field(&H512::zero())
            .encode_field(&1u64)
            .finish();
        assert!(NodeRecord::decode(&rlp).is_err());
    }
}
