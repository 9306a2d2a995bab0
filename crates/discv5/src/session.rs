//! Component E: the per-peer session state machine.
//!
//! ```text
//!  BeforeHandshake ──send──▶ DuringHandshake(initiator) ──whoareyou──▶ AfterHandshake
//!  BeforeHandshake ──recv──▶ DuringHandshake(responder) ──handshake response──▶ AfterHandshake
//!  AfterHandshake ──decrypt failure──▶ Closed ──next send──▶ BeforeHandshake
//! ```
//!
//! A session performs at most one handshake attempt at a time; further
//! outgoing messages queue on a small bounded buffer and flush once the
//! handshake completes. Queue overflow drops the oldest buffered message.
//!
//! Per the wire format, ordinary post-handshake packets use `recipient_key`
//! in both directions; `initiator_key` is used only for the one-time
//! handshake-response packet. `auth_response_key` is derived to keep the
//! three-key schedule intact but has no consumer in this packet format and
//! is otherwise unused.

use crate::crypto::{self, SessionKeys};
use crate::enr::NodeRecord;
use crate::message::Message;
use crate::node::{Endpoint, NodeId};
use crate::packet::{self, Packet};
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use std::collections::VecDeque;

/// Bound on the pre-handshake outgoing message queue.
const PENDING_QUEUE_CAPACITY: usize = 4;

#[derive(Debug)]
enum State {
    BeforeHandshake,
    DuringHandshake { id_nonce: [u8; 32] },
    AfterHandshake { keys: SessionKeys },
    Closed,
}

/// An externally observable outcome of driving the session forward. The
/// caller (the pool) puts the returned datagrams on the wire; this module
/// never touches a socket directly.
#[derive(Debug)]
pub enum Outcome {
    /// Send these datagrams, in order.
    Send(Vec<Vec<u8>>),
    /// The message was buffered; nothing to send yet.
    Buffered,
    /// A handshake completed. `delivered` holds the message embedded in the
    /// handshake exchange itself, if any; `to_send` holds the encoded
    /// datagrams for the handshake packet plus any drained backlog.
    HandshakeComplete {
        delivered: Vec<Message>,
        to_send: Vec<Vec<u8>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no static public key on file for the remote peer; cannot complete ECDH")]
    UnknownRemoteKey,
    #[error("id-nonce signature failed to verify")]
    BadIdNonceSignature,
    #[error("AES-GCM authentication failed")]
    DecryptionFailed,
    #[error("session is not mid-handshake")]
    NotHandshaking,
    #[error(transparent)]
    MessageDecode(#[from] crate::error::MessageDecodeError),
}

#[derive(Debug)]
pub struct Session {
    /// Local handle distinguishing concurrently-racing sessions for the same
    /// peer; never sent on the wire.
    pub local_id: u64,
    pub remote_node_id: NodeId,
    pub remote_endpoint: Endpoint,
    state: State,
    pending: VecDeque<Message>,
}

impl Session {
    pub fn new(remote_node_id: NodeId, remote_endpoint: Endpoint) -> Self {
        Self {
            local_id: rand::random(),
            remote_node_id,
            remote_endpoint,
            state: State::BeforeHandshake,
            pending: VecDeque::with_capacity(PENDING_QUEUE_CAPACITY),
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, State::AfterHandshake { .. })
    }

    fn push_pending(&mut self, message: Message) {
        if self.pending.len() >= PENDING_QUEUE_CAPACITY {
            self.pending.pop_front();
        }
        self.pending.push_back(message);
    }

    /// Enqueues `message` for delivery. In `BeforeHandshake`/`Closed` this
    /// kicks off an initiator handshake by sending a random-data decoy
    /// packet (indistinguishable, to an observer, from a genuine message
    /// whose session has simply been forgotten); in `DuringHandshake` it
    /// buffers; in `AfterHandshake` it encrypts and sends immediately.
    pub fn enqueue_outgoing(&mut self, message: Message, local_node_id: NodeId) -> Outcome {
        match &self.state {
            State::AfterHandshake { keys } => {
                let datagram = self.encrypt_ordinary(&message, &keys.recipient_key, local_node_id);
                Outcome::Send(vec![datagram])
            }
            State::DuringHandshake { .. } => {
                self.push_pending(message);
                Outcome::Buffered
            }
            State::BeforeHandshake | State::Closed => {
                self.push_pending(message);
                let decoy = self.decoy_datagram(local_node_id);
                self.state = State::DuringHandshake { id_nonce: [0u8; 32] };
                Outcome::Send(vec![decoy])
            }
        }
    }

    fn decoy_datagram(&self, local_node_id: NodeId) -> Vec<u8> {
        let mut auth_tag = [0u8; packet::AUTH_TAG_SIZE];
        rand::thread_rng().fill_bytes(&mut auth_tag);
        // Realistic-sized filler; a peer that hasn't completed a handshake
        // with us cannot tell this apart from a genuine but undecryptable
        // message.
        let mut filler = vec![0u8; 44];
        rand::thread_rng().fill_bytes(&mut filler);
        let tag = packet::compute_tag(local_node_id, self.remote_node_id);
        Packet::Message {
            auth_tag,
            ciphertext: filler.into(),
        }
        .encode(tag)
    }

    /// Responds to an inbound packet the pool could not match to a live
    /// session: issues a WHOAREYOU challenge carrying a fresh id_nonce.
    /// `remote_last_known_enr_seq` is whatever sequence number we already
    /// have on file for the peer (0 if none), so the peer can decide
    /// whether to attach its own ENR to the handshake reply.
    pub fn challenge(&mut self, local_node_id: NodeId, remote_last_known_enr_seq: u64) -> Vec<u8> {
        let mut id_nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id_nonce);
        self.state = State::DuringHandshake { id_nonce };
        let tag = packet::compute_tag(local_node_id, self.remote_node_id);
        let mut token = [0u8; packet::AUTH_TAG_SIZE];
        rand::thread_rng().fill_bytes(&mut token);
        Packet::WhoAreYou {
            token: token.to_vec().into(),
            id_nonce,
            enr_seq: remote_last_known_enr_seq,
        }
        .encode(tag)
    }

    /// Initiator side: a WHOAREYOU arrived in response to our decoy.
    /// Completes the handshake and drains the pending queue.
    pub fn handle_whoareyou(
        &mut self,
        id_nonce: [u8; 32],
        peer_last_known_enr_seq: u64,
        remote_static_pubkey: Option<PublicKey>,
        local_signer: &SecretKey,
        local_node_id: NodeId,
        local_enr: &NodeRecord,
    ) -> Result<Outcome, SessionError> {
        let remote_pubkey = remote_static_pubkey.ok_or(SessionError::UnknownRemoteKey)?;

        let ephemeral_secret = SecretKey::new(&mut rand::rngs::OsRng);
        let ephemeral_pubkey = PublicKey::from_secret_key(SECP256K1, &ephemeral_secret);
        let shared_secret = crypto::ecdh_shared_secret(&ephemeral_secret, &remote_pubkey);
        let keys =
            crypto::derive_session_keys(&shared_secret, &id_nonce, local_node_id, self.remote_node_id);
        let id_nonce_sig =
            crypto::sign_id_nonce(local_signer, &id_nonce, &ephemeral_pubkey.serialize());

        let attach_enr = local_enr.seq > peer_last_known_enr_seq;

        let mut drained: Vec<Message> = self.pending.drain(..).collect();
        let first = if drained.is_empty() {
            None
        } else {
            Some(drained.remove(0))
        };

        let tag = packet::compute_tag(local_node_id, self.remote_node_id);
        let mut nonce = [0u8; packet::AUTH_TAG_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let plaintext = first.as_ref().map(Message::encode_to_vec).unwrap_or_default();
        let ciphertext = crypto::seal(&keys.initiator_key, &nonce, &tag, &plaintext);

        let handshake_datagram = Packet::HandshakeResponse {
            nonce,
            id_nonce_sig: id_nonce_sig.serialize_compact(),
            ephemeral_pubkey: ephemeral_pubkey.serialize(),
            enr: if attach_enr { Some(local_enr.clone()) } else { None },
            ciphertext: ciphertext.into(),
        }
        .encode(tag);

        let mut to_send = vec![handshake_datagram];
        for msg in &drained {
            to_send.push(self.encrypt_ordinary(msg, &keys.recipient_key, local_node_id));
        }

        self.state = State::AfterHandshake { keys };

        Ok(Outcome::HandshakeComplete {
            delivered: first.into_iter().collect(),
            to_send,
        })
    }

    /// Responder side: the initiator's handshake response arrived.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_handshake_response(
        &mut self,
        nonce: [u8; packet::AUTH_TAG_SIZE],
        id_nonce_sig: [u8; 64],
        ephemeral_pubkey_bytes: [u8; 33],
        attached_enr: Option<NodeRecord>,
        ciphertext: &[u8],
        local_static_secret: &SecretKey,
        local_node_id: NodeId,
        remote_static_pubkey_from_db: Option<PublicKey>,
    ) -> Result<Outcome, SessionError> {
        let State::DuringHandshake { id_nonce } = &self.state else {
            return Err(SessionError::NotHandshaking);
        };
        let id_nonce = *id_nonce;

        let remote_pubkey = attached_enr
            .as_ref()
            .and_then(NodeRecord::public_key)
            .or(remote_static_pubkey_from_db)
            .ok_or(SessionError::UnknownRemoteKey)?;

        let ephemeral_pubkey = PublicKey::from_slice(&ephemeral_pubkey_bytes)
            .map_err(|_| SessionError::BadIdNonceSignature)?;
        let signature = secp256k1::ecdsa::Signature::from_compact(&id_nonce_sig)
            .map_err(|_| SessionError::BadIdNonceSignature)?;
        if !crypto::verify_id_nonce_signature(
            &remote_pubkey,
            &id_nonce,
            &ephemeral_pubkey_bytes,
            &signature,
        ) {
            return Err(SessionError::BadIdNonceSignature);
        }

        let shared_secret = crypto::ecdh_shared_secret(local_static_secret, &ephemeral_pubkey);
        let keys =
            crypto::derive_session_keys(&shared_secret, &id_nonce, self.remote_node_id, local_node_id);

        let tag = packet::compute_tag(local_node_id, self.remote_node_id);
        let plaintext = crypto::open(&keys.initiator_key, &nonce, &tag, ciphertext)
            .ok_or(SessionError::DecryptionFailed)?;

        let mut delivered = Vec::new();
        if !plaintext.is_empty() {
            delivered.push(Message::decode(&plaintext)?);
        }

        let to_send = self
            .pending
            .drain(..)
            .map(|m| self.encrypt_ordinary(&m, &keys.recipient_key, local_node_id))
            .collect();

        self.state = State::AfterHandshake { keys };

        Ok(Outcome::HandshakeComplete { delivered, to_send })
    }

    fn encrypt_ordinary(&self, message: &Message, key: &[u8; 16], local_node_id: NodeId) -> Vec<u8> {
        let mut auth_tag = [0u8; packet::AUTH_TAG_SIZE];
        rand::thread_rng().fill_bytes(&mut auth_tag);
        let tag = packet::compute_tag(local_node_id, self.remote_node_id);
        let ciphertext = crypto::seal(key, &auth_tag, &tag, &message.encode_to_vec());
        Packet::Message {
            auth_tag,
            ciphertext: ciphertext.into(),
        }
        .encode(tag)
    }

    /// Decrypts an ordinary post-handshake packet. Failure demotes the
    /// session to `Closed`, so the next outgoing send triggers a fresh
    /// handshake.
    pub fn decrypt(
        &mut self,
        auth_tag: [u8; packet::AUTH_TAG_SIZE],
        ciphertext: &[u8],
        local_node_id: NodeId,
    ) -> Result<Message, SessionError> {
        let State::AfterHandshake { keys } = &self.state else {
            return Err(SessionError::DecryptionFailed);
        };
        let tag = packet::compute_tag(local_node_id, self.remote_node_id);
        match crypto::open(&keys.recipient_key, &auth_tag, &tag, ciphertext) {
            Some(plaintext) => Ok(Message::decode(&plaintext)?),
            None => {
                self.state = State::Closed;
                Err(SessionError::DecryptionFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::Pairs;
    use crate::message::{Ping, RequestId};
    use ethereum_types::H256;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint() -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000)
    }

    fn enr_for(signer: &SecretKey, seq: u64) -> NodeRecord {
        let pubkey = PublicKey::from_secret_key(SECP256K1, signer);
        NodeRecord::sign(
            seq,
            Pairs {
                id: Some("v4".into()),
                secp256k1: Some(ethereum_types::H264::from_slice(&pubkey.serialize())),
                ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
                udp_port: Some(9000),
            },
            signer,
        )
        .unwrap()
    }

    #[test]
    fn sending_before_handshake_starts_one_and_buffers_the_message() {
        let local_node_id = H256::random();
        let mut session = Session::new(H256::random(), endpoint());
        let ping = Message::Ping(Ping {
            request_id: RequestId::random(),
            enr_seq: 1,
        });
        let outcome = session.enqueue_outgoing(ping, local_node_id);
        match outcome {
            Outcome::Send(datagrams) => assert_eq!(datagrams.len(), 1),
            other => panic!("expected a decoy datagram, got {other:?}"),
        }
        assert!(!session.is_established());
    }

    #[test]
    fn second_send_during_handshake_just_buffers() {
        let local_node_id = H256::random();
        let mut session = Session::new(H256::random(), endpoint());
        let msg = || {
            Message::Ping(Ping {
                request_id: RequestId::random(),
                enr_seq: 1,
            })
        };
        session.enqueue_outgoing(msg(), local_node_id);
        let outcome = session.enqueue_outgoing(msg(), local_node_id);
        assert!(matches!(outcome, Outcome::Buffered));
    }

    #[test]
    fn pending_queue_drops_oldest_past_capacity() {
        let local_node_id = H256::random();
        let mut session = Session::new(H256::random(), endpoint());
        for i in 0..(PENDING_QUEUE_CAPACITY as u64 + 2) {
            session.enqueue_outgoing(
                Message::Ping(Ping {
                    request_id: RequestId::random(),
                    enr_seq: i,
                }),
                local_node_id,
            );
        }
        assert_eq!(session.pending.len(), PENDING_QUEUE_CAPACITY);
    }

    #[test]
    fn full_handshake_round_trip_delivers_the_triggering_message() {
        let initiator_node_id = H256::random();
        let responder_secret = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let responder_pubkey = PublicKey::from_secret_key(SECP256K1, &responder_secret);
        let responder_enr = enr_for(&responder_secret, 1);
        let responder_node_id = responder_enr.node_id().unwrap();

        let initiator_secret = SecretKey::from_slice(&[11u8; 32]).unwrap();
        let initiator_enr = enr_for(&initiator_secret, 5);

        let mut initiator_session = Session::new(responder_node_id, endpoint());
        let ping = Message::Ping(Ping {
            request_id: RequestId::random(),
            enr_seq: 5,
        });
        initiator_session.enqueue_outgoing(ping.clone(), initiator_node_id);

        let mut responder_session = Session::new(initiator_node_id, endpoint());
        let challenge_id_nonce = {
            let datagram = responder_session.challenge(responder_node_id, 0);
            let (_, packet) = Packet::decode(&datagram, initiator_node_id).unwrap();
            match packet {
                Packet::WhoAreYou { id_nonce, .. } => id_nonce,
                other => panic!("expected whoareyou, got {other:?}"),
            }
        };

        let outcome = initiator_session
            .handle_whoareyou(
                challenge_id_nonce,
                0,
                Some(responder_pubkey),
                &initiator_secret,
                initiator_node_id,
                &initiator_enr,
            )
            .unwrap();
        let Outcome::HandshakeComplete { to_send, .. } = outcome else {
            panic!("expected handshake completion");
        };
        assert!(initiator_session.is_established());

        let (_, handshake_packet) = Packet::decode(&to_send[0], responder_node_id).unwrap();
        let Packet::HandshakeResponse {
            nonce,
            id_nonce_sig,
            ephemeral_pubkey,
            enr,
            ciphertext,
        } = handshake_packet
        else {
            panic!("expected handshake response packet");
        };

        let outcome = responder_session
            .handle_handshake_response(
                nonce,
                id_nonce_sig,
                ephemeral_pubkey,
                enr,
                &ciphertext,
                &responder_secret,
                responder_node_id,
                None,
            )
            .unwrap();
        let Outcome::HandshakeComplete { delivered, .. } = outcome else {
            panic!("expected handshake completion");
        };
        assert!(responder_session.is_established());
        assert_eq!(delivered, vec![ping]);
    }

    #[test]
    fn decrypt_failure_closes_the_session() {
        let local_node_id = H256::random();
        let remote_node_id = H256::random();
        let mut session = Session::new(remote_node_id, endpoint());
        session.state = State::AfterHandshake {
            keys: SessionKeys {
                initiator_key: [1u8; 16],
                recipient_key: [2u8; 16],
                auth_response_key: [3u8; 16],
            },
        };
        let err = session
            .decrypt([0u8; packet::AUTH_TAG_SIZE], b"not-really-ciphertext", local_node_id)
            .unwrap_err();
        assert!(matches!(err, SessionError::DecryptionFailed));
        assert!(!session.is_established());
        assert!(matches!(session.state, State::Closed));
    }
}
