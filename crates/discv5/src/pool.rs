//! Component F: the session pool.
//!
//! Owns every live [`Session`], keyed by `(remote_node_id, remote_endpoint)`,
//! and is the single place that turns an inbound datagram into a decoded
//! message (or a reply datagram to send back) and an outbound message into
//! wire bytes. Callers never touch [`Session`] directly.

use crate::enr::NodeRecord;
use crate::enr_db::EnrDatabase;
use crate::message::Message;
use crate::node::{Endpoint, NodeId, Peer};
use crate::packet::Packet;
use crate::session::{Outcome as SessionOutcome, Session};
use indexmap::IndexMap;
use secp256k1::SecretKey;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Everything a handshake needs besides the packet itself.
pub struct HandshakeContext<'a> {
    pub local_signer: &'a SecretKey,
    pub local_enr: &'a NodeRecord,
    pub enr_db: &'a dyn EnrDatabase,
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    SessionHandshakeComplete { peer: Peer },
    PacketDiscarded { from: Endpoint, reason: String },
}

/// A datagram queued for delivery, paired with the endpoint to send it to.
pub type Outbound = (Endpoint, Vec<u8>);

#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub to_send: Vec<Outbound>,
    pub delivered: Vec<(Peer, Message)>,
}

pub struct Pool {
    local_node_id: NodeId,
    sessions: Mutex<IndexMap<(NodeId, Endpoint), Session>>,
    max_sessions: Option<usize>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl Pool {
    /// `max_sessions`: when set, the oldest idle session is evicted whenever
    /// a new one would exceed the cap. `None` disables eviction entirely.
    pub fn new(
        local_node_id: NodeId,
        max_sessions: Option<usize>,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                local_node_id,
                sessions: Mutex::new(IndexMap::new()),
                max_sessions,
                events: tx,
            },
            rx,
        )
    }

    fn emit(&self, event: PoolEvent) {
        // The event channel only drops if nothing still listens to it, which
        // is harmless at shutdown.
        let _ = self.events.send(event);
    }

    fn evict_if_over_capacity(sessions: &mut IndexMap<(NodeId, Endpoint), Session>, cap: Option<usize>) {
        if let Some(cap) = cap {
            while sessions.len() > cap {
                if let Some((key, _)) = sessions.shift_remove_index(0) {
                    trace!(?key, "evicting idle session to respect session cap");
                } else {
                    break;
                }
            }
        }
    }

    /// Encodes `message` for `peer`, driving the handshake if needed. The
    /// returned datagrams (zero, one, or more) must be sent to `peer`'s
    /// endpoint by the caller.
    pub fn send_message(&self, peer: Peer, message: Message) -> Vec<Outbound> {
        let mut sessions = self.sessions.lock().expect("session pool lock poisoned");
        let key = (peer.id, peer.endpoint);
        let session = sessions
            .entry(key)
            .or_insert_with(|| Session::new(peer.id, peer.endpoint));
        let outcome = session.enqueue_outgoing(message, self.local_node_id);
        Self::evict_if_over_capacity(&mut sessions, self.max_sessions);
        match outcome {
            SessionOutcome::Send(datagrams) => datagrams
                .into_iter()
                .map(|d| (peer.endpoint, d))
                .collect(),
            SessionOutcome::Buffered => Vec::new(),
            SessionOutcome::HandshakeComplete { to_send, .. } => {
                // enqueue_outgoing never itself completes a handshake; kept
                // for exhaustiveness against future state-machine changes.
                to_send.into_iter().map(|d| (peer.endpoint, d)).collect()
            }
        }
    }

    /// Processes one inbound datagram, returning any reply datagrams to
    /// send and any application messages ready for the dispatcher.
    pub fn handle_datagram(&self, datagram: &[u8], from: Endpoint, ctx: &HandshakeContext) -> PoolOutcome {
        let (remote_node_id, packet) = match Packet::decode(datagram, self.local_node_id) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.emit(PoolEvent::PacketDiscarded {
                    from,
                    reason: err.to_string(),
                });
                return PoolOutcome::default();
            }
        };

        let mut sessions = self.sessions.lock().expect("session pool lock poisoned");
        let key = (remote_node_id, from);

        match packet {
            Packet::WhoAreYou { id_nonce, enr_seq, .. } => {
                let Some(session) = sessions.get_mut(&key) else {
                    self.emit(PoolEvent::PacketDiscarded {
                        from,
                        reason: "whoareyou for a session we never started".into(),
                    });
                    return PoolOutcome::default();
                };
                let remote_pubkey = ctx
                    .enr_db
                    .get(&remote_node_id)
                    .and_then(|enr| enr.public_key());
                match session.handle_whoareyou(
                    id_nonce,
                    enr_seq,
                    remote_pubkey,
                    ctx.local_signer,
                    self.local_node_id,
                    ctx.local_enr,
                ) {
                    Ok(SessionOutcome::HandshakeComplete { delivered, to_send }) => {
                        self.emit(PoolEvent::SessionHandshakeComplete {
                            peer: Peer::new(remote_node_id, from),
                        });
                        Self::evict_if_over_capacity(&mut sessions, self.max_sessions);
                        PoolOutcome {
                            to_send: to_send.into_iter().map(|d| (from, d)).collect(),
                            delivered: delivered
                                .into_iter()
                                .map(|m| (Peer::new(remote_node_id, from), m))
                                .collect(),
                        }
                    }
                    Ok(_) => PoolOutcome::default(),
                    Err(err) => {
                        self.emit(PoolEvent::PacketDiscarded {
                            from,
                            reason: err.to_string(),
                        });
                        PoolOutcome::default()
                    }
                }
            }
            Packet::HandshakeResponse {
                nonce,
                id_nonce_sig,
                ephemeral_pubkey,
                enr,
                ciphertext,
            } => {
                let Some(session) = sessions.get_mut(&key) else {
                    self.emit(PoolEvent::PacketDiscarded {
                        from,
                        reason: "handshake response for a session we never challenged".into(),
                    });
                    return PoolOutcome::default();
                };
                let remote_pubkey_from_db = ctx
                    .enr_db
                    .get(&remote_node_id)
                    .and_then(|e| e.public_key());
                match session.handle_handshake_response(
                    nonce,
                    id_nonce_sig,
                    ephemeral_pubkey,
                    enr,
                    &ciphertext,
                    ctx.local_signer,
                    self.local_node_id,
                    remote_pubkey_from_db,
                ) {
                    Ok(SessionOutcome::HandshakeComplete { delivered, to_send }) => {
                        self.emit(PoolEvent::SessionHandshakeComplete {
                            peer: Peer::new(remote_node_id, from),
                        });
                        Self::evict_if_over_capacity(&mut sessions, self.max_sessions);
                        PoolOutcome {
                            to_send: to_send.into_iter().map(|d| (from, d)).collect(),
                            delivered: delivered
                                .into_iter()
                                .map(|m| (Peer::new(remote_node_id, from), m))
                                .collect(),
                        }
                    }
                    Ok(_) => PoolOutcome::default(),
                    Err(err) => {
                        self.emit(PoolEvent::PacketDiscarded {
                            from,
                            reason: err.to_string(),
                        });
                        PoolOutcome::default()
                    }
                }
            }
            Packet::Message { auth_tag, ciphertext } => {
                if let Some(session) = sessions.get_mut(&key) {
                    if session.is_established() {
                        match session.decrypt(auth_tag, &ciphertext, self.local_node_id) {
                            Ok(message) => {
                                return PoolOutcome {
                                    to_send: Vec::new(),
                                    delivered: vec![(Peer::new(remote_node_id, from), message)],
                                };
                            }
                            Err(err) => {
                                debug!(%remote_node_id, %err, "undecryptable packet on an established session, challenging for a fresh handshake");
                                // `decrypt` already demoted the session to Closed; fall through
                                // to the challenge path below instead of dropping the packet.
                            }
                        }
                    }
                }
                // No established session (or one that just failed to decrypt above):
                // challenge the sender. A session row is created even for peers we know
                // nothing about yet, since a WHOAREYOU must come from *somewhere*.
                let last_known_enr_seq = ctx
                    .enr_db
                    .get(&remote_node_id)
                    .map(|enr| enr.seq)
                    .unwrap_or(0);
                let session = sessions
                    .entry(key)
                    .or_insert_with(|| Session::new(remote_node_id, from));
                let datagram = session.challenge(self.local_node_id, last_known_enr_seq);
                Self::evict_if_over_capacity(&mut sessions, self.max_sessions);
                PoolOutcome {
                    to_send: vec![(from, datagram)],
                    delivered: Vec::new(),
                }
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session pool lock poisoned").len()
    }

    pub fn has_session_with(&self, peer: Peer) -> bool {
        self.sessions
            .lock()
            .expect("session pool lock poisoned")
            .contains_key(&(peer.id, peer.endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::Pairs;
    use crate::enr_db::InMemoryEnrDatabase;
    use crate::message::{Ping, RequestId};
    use ethereum_types::H256;
    use secp256k1::{PublicKey, SECP256K1};
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn enr_for(signer: &SecretKey, seq: u64, port: u16) -> NodeRecord {
        let pubkey = PublicKey::from_secret_key(SECP256K1, signer);
        NodeRecord::sign(
            seq,
            Pairs {
                id: Some("v4".into()),
                secp256k1: Some(ethereum_types::H264::from_slice(&pubkey.serialize())),
                ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
                udp_port: Some(port),
            },
            signer,
        )
        .unwrap()
    }

    #[test]
    fn full_handshake_across_two_pools_delivers_the_message() {
        let initiator_secret = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let responder_secret = SecretKey::from_slice(&[2u8; 32]).unwrap();
        let initiator_enr = enr_for(&initiator_secret, 1, 9000);
        let responder_enr = enr_for(&responder_secret, 1, 9001);
        let initiator_id = initiator_enr.node_id().unwrap();
        let responder_id = responder_enr.node_id().unwrap();

        let initiator_db = InMemoryEnrDatabase::default();
        initiator_db.set(responder_enr.clone()).unwrap();
        let responder_db = InMemoryEnrDatabase::default();
        responder_db.set(initiator_enr.clone()).unwrap();

        let (initiator_pool, _initiator_events) = Pool::new(initiator_id, None);
        let (responder_pool, _responder_events) = Pool::new(responder_id, None);

        let initiator_ctx = HandshakeContext {
            local_signer: &initiator_secret,
            local_enr: &initiator_enr,
            enr_db: &initiator_db,
        };
        let responder_ctx = HandshakeContext {
            local_signer: &responder_secret,
            local_enr: &responder_enr,
            enr_db: &responder_db,
        };

        let responder_peer = Peer::new(responder_id, endpoint(9001));
        let initiator_peer = Peer::new(initiator_id, endpoint(9000));

        let ping = Message::Ping(Ping {
            request_id: RequestId::random(),
            enr_seq: 1,
        });
        let decoy = initiator_pool.send_message(responder_peer, ping.clone());
        assert_eq!(decoy.len(), 1);

        let challenge = responder_pool.handle_datagram(&decoy[0].1, endpoint(9000), &responder_ctx);
        assert_eq!(challenge.to_send.len(), 1);
        assert!(challenge.delivered.is_empty());

        let handshake = initiator_pool.handle_datagram(&challenge.to_send[0].1, endpoint(9001), &initiator_ctx);
        assert_eq!(handshake.to_send.len(), 1);

        let delivered = responder_pool.handle_datagram(&handshake.to_send[0].1, endpoint(9000), &responder_ctx);
        assert_eq!(delivered.delivered.len(), 1);
        assert_eq!(delivered.delivered[0].0, initiator_peer);
        assert_eq!(delivered.delivered[0].1, ping);
    }

    #[test]
    fn eviction_drops_the_oldest_session_past_capacity() {
        let local_id = H256::random();
        let (pool, _events) = Pool::new(local_id, Some(1));
        let ping = || {
            Message::Ping(Ping {
                request_id: RequestId::random(),
                enr_seq: 0,
            })
        };
        let first = Peer::new(H256::random(), endpoint(1));
        let second = Peer::new(H256::random(), endpoint(2));
        pool.send_message(first, ping());
        assert_eq!(pool.session_count(), 1);
        pool.send_message(second, ping());
        assert_eq!(pool.session_count(), 1);
        assert!(!pool.has_session_with(first));
        assert!(pool.has_session_with(second));
    }
}
