//! Handshake cryptography: ECDH, HKDF-SHA256 key derivation and id-nonce
//! signing, plus the AES-GCM helpers used to seal/open packet payloads.
//!
//! Grounded in the discv5 handshake's actual key schedule: an ephemeral (or
//! static, for the responder) ECDH shared secret is fed through
//! HKDF-SHA256, salted with the id_nonce and expanded with an info string
//! naming both peers, to yield three 16-byte keys.

use crate::node::NodeId;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{ecdsa::Signature, Message as SecpMessage, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

const KEY_AGREEMENT_INFO: &[u8] = b"discovery v5 key agreement";
const ID_NONCE_SIGNATURE_PREFIX: &[u8] = b"discovery-id-nonce";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub initiator_key: [u8; 16],
    pub recipient_key: [u8; 16],
    pub auth_response_key: [u8; 16],
}

/// `ecdh(pubkey, privkey)`: the x9.62 compressed SEC1 encoding of the shared
/// point, matching what the HKDF input expects.
pub fn ecdh_shared_secret(secret: &SecretKey, public: &PublicKey) -> [u8; 33] {
    let xy_point = shared_secret_point(public, secret);
    let mut compressed = [0u8; 33];
    let y = &xy_point[32..];
    compressed[0] = if y[31] & 1 == 0 { 0x02 } else { 0x03 };
    compressed[1..].copy_from_slice(&xy_point[..32]);
    compressed
}

/// Derives `initiator_key`, `recipient_key` and `auth_response_key` from the
/// shared secret, the id_nonce (used as the HKDF salt) and the ordered
/// node-id pair (mixed into the HKDF info to bind the keys to this
/// particular pair of peers).
pub fn derive_session_keys(
    shared_secret: &[u8],
    id_nonce: &[u8; 32],
    node_id_initiator: NodeId,
    node_id_recipient: NodeId,
) -> SessionKeys {
    let hkdf = Hkdf::<Sha256>::new(Some(id_nonce), shared_secret);

    let mut info = KEY_AGREEMENT_INFO.to_vec();
    info.extend_from_slice(node_id_initiator.as_bytes());
    info.extend_from_slice(node_id_recipient.as_bytes());

    let mut key_data = [0u8; 48];
    if hkdf.expand(&info, &mut key_data).is_err() {
        unreachable!("48 bytes is within HKDF-SHA256's maximum expand length");
    }

    let mut initiator_key = [0u8; 16];
    let mut recipient_key = [0u8; 16];
    let mut auth_response_key = [0u8; 16];
    initiator_key.copy_from_slice(&key_data[0..16]);
    recipient_key.copy_from_slice(&key_data[16..32]);
    auth_response_key.copy_from_slice(&key_data[32..48]);

    SessionKeys {
        initiator_key,
        recipient_key,
        auth_response_key,
    }
}

fn id_nonce_signing_digest(id_nonce: &[u8; 32], ephemeral_pubkey: &[u8]) -> [u8; 32] {
    let mut input = ID_NONCE_SIGNATURE_PREFIX.to_vec();
    input.extend_from_slice(id_nonce);
    input.extend_from_slice(ephemeral_pubkey);
    Sha256::digest(input).into()
}

/// Signs `sha256("discovery-id-nonce" ‖ id_nonce ‖ ephemeral_pubkey)` with
/// the initiator's static key, as required to complete a handshake.
pub fn sign_id_nonce(
    signer: &SecretKey,
    id_nonce: &[u8; 32],
    ephemeral_pubkey: &[u8],
) -> Signature {
    let digest = id_nonce_signing_digest(id_nonce, ephemeral_pubkey);
    let message = SecpMessage::from_digest(digest);
    SECP256K1.sign_ecdsa(&message, signer)
}

pub fn verify_id_nonce_signature(
    initiator_pubkey: &PublicKey,
    id_nonce: &[u8; 32],
    ephemeral_pubkey: &[u8],
    signature: &Signature,
) -> bool {
    let digest = id_nonce_signing_digest(id_nonce, ephemeral_pubkey);
    let message = SecpMessage::from_digest(digest);
    SECP256K1
        .verify_ecdsa(&message, signature, initiator_pubkey)
        .is_ok()
}

/// Seals `plaintext` under `key`, authenticating `aad` alongside it. `nonce`
/// is the packet's 12-byte auth_tag.
pub fn seal(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    match cipher.encrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: plaintext,
            aad,
        },
    ) {
        Ok(ciphertext) => ciphertext,
        Err(_) => unreachable!("AES-128-GCM with a 12-byte nonce and a 16-byte key never fails"),
    }
}

/// Opens a sealed payload, returning `None` on authentication failure (the
/// caller treats this as a decoding error and drops the packet).
pub fn open(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;
    use rand::rngs::OsRng;

    #[test]
    fn ecdh_is_symmetric_between_peers() {
        let a = SecretKey::new(&mut OsRng);
        let b = SecretKey::new(&mut OsRng);
        let a_pub = PublicKey::from_secret_key(SECP256K1, &a);
        let b_pub = PublicKey::from_secret_key(SECP256K1, &b);
        assert_eq!(ecdh_shared_secret(&a, &b_pub), ecdh_shared_secret(&b, &a_pub));
    }

    #[test]
    fn derived_keys_differ_per_role_slot() {
        let shared_secret = [7u8; 33];
        let id_nonce = [1u8; 32];
        let keys = derive_session_keys(&shared_secret, &id_nonce, H256::zero(), H256::repeat_byte(1));
        assert_ne!(keys.initiator_key, keys.recipient_key);
        assert_ne!(keys.recipient_key, keys.auth_response_key);
    }

    #[test]
    fn derivation_is_deterministic() {
        let shared_secret = [9u8; 33];
        let id_nonce = [2u8; 32];
        let a = derive_session_keys(&shared_secret, &id_nonce, H256::zero(), H256::repeat_byte(3));
        let b = derive_session_keys(&shared_secret, &id_nonce, H256::zero(), H256::repeat_byte(3));
        assert_eq!(a, b);
    }

    #[test]
    fn id_nonce_signature_round_trips() {
        let signer = SecretKey::new(&mut OsRng);
        let pubkey = PublicKey::from_secret_key(SECP256K1, &signer);
        let id_nonce = [5u8; 32];
        let ephemeral_pubkey = [3u8; 33];
        let sig = sign_id_nonce(&signer, &id_nonce, &ephemeral_pubkey);
        assert!(verify_id_nonce_signature(&pubkey, &id_nonce, &ephemeral_pubkey, &sig));
    }

    #[test]
    fn id_nonce_signature_rejects_wrong_key() {
        let signer = SecretKey::new(&mut OsRng);
        let other = SecretKey::new(&mut OsRng);
        let other_pubkey = PublicKey::from_secret_key(SECP256K1, &other);
        let id_nonce = [5u8; 32];
        let ephemeral_pubkey = [3u8; 33];
        let sig = sign_id_nonce(&signer, &id_nonce, &ephemeral_pubkey);
        assert!(!verify_id_nonce_signature(
            &other_pubkey,
            &id_nonce,
            &ephemeral_pubkey,
            &sig
        ));
    }

    #[test]
    fn seal_then_open_round_trips() {
        let key = [42u8; 16];
        let nonce = [1u8; 12];
        let aad = b"tag-bytes";
        let plaintext = b"ping request payload";
        let ciphertext = seal(&key, &nonce, aad, plaintext);
        let opened = open(&key, &nonce, aad, &ciphertext).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_fails_on_tampered_ciphertext() {
        let key = [42u8; 16];
        let nonce = [1u8; 12];
        let aad = b"tag-bytes";
        let mut ciphertext = seal(&key, &nonce, aad, b"ping request payload");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(open(&key, &nonce, aad, &ciphertext).is_none());
    }

    #[test]
    fn open_fails_on_wrong_aad() {
        let key = [42u8; 16];
        let nonce = [1u8; 12];
        let ciphertext = seal(&key, &nonce, b"tag-a", b"ping request payload");
        assert!(open(&key, &nonce, b"tag-b", &ciphertext).is_none());
    }
}
