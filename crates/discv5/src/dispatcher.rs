//! Component G: correlates outbound requests with inbound responses and
//! fans unsolicited/incoming messages out to whoever subscribed to that
//! message kind (the maintenance loop's `serve_ping`, `serve_find_nodes`
//! and `serve_talk` handlers, chiefly).

use crate::message::{Message, RequestId};
use crate::node::{Endpoint, Peer};
use crate::pool::Pool;
use crate::Discv5Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// How long a subscriber's channel is given to accept a message before the
/// dispatcher gives up on that one subscriber and moves on; it never blocks
/// the whole dispatch loop waiting for a slow consumer.
const SUBSCRIBER_BACKPRESSURE_TIMEOUT: Duration = Duration::from_millis(100);

/// Depth of each per-subscriber channel.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 32;

/// How many times `send_request` will redraw a colliding request id before
/// giving up; with an 8-byte random id, a single collision against a
/// handful of outstanding requests is already astronomically unlikely.
const MAX_REQUEST_ID_COLLISION_RETRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    FindNode,
    Nodes,
    TalkRequest,
    TalkResponse,
}

impl MessageType {
    pub fn of(message: &Message) -> Self {
        match message {
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::FindNode(_) => MessageType::FindNode,
            Message::Nodes(_) => MessageType::Nodes,
            Message::TalkRequest(_) => MessageType::TalkRequest,
            Message::TalkResponse(_) => MessageType::TalkResponse,
        }
    }
}

pub struct Dispatcher {
    pool: Arc<Pool>,
    /// Datagrams produced by the pool land here; the socket's write task
    /// drains this channel. The dispatcher never touches a socket directly.
    outbound: mpsc::UnboundedSender<(Endpoint, Vec<u8>)>,
    /// Responses for an in-flight request arrive here, one send per
    /// response packet. A request expecting a single reply (PING, TALKREQ)
    /// reads one and is done; FINDNODE keeps reading until it has collected
    /// every NODES packet or times out, since a NODES response may be split
    /// across several packets.
    pending: Mutex<HashMap<(Peer, RequestId), mpsc::UnboundedSender<Message>>>,
    subscribers: Mutex<HashMap<MessageType, Vec<mpsc::Sender<(Peer, Message)>>>>,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>, outbound: mpsc::UnboundedSender<(Endpoint, Vec<u8>)>) -> Self {
        Self {
            pool,
            outbound,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in every message of `message_type`. Multiple
    /// subscribers to the same type are all fanned out to independently.
    pub fn subscribe(&self, message_type: MessageType) -> mpsc::Receiver<(Peer, Message)> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .expect("subscriber table lock poisoned")
            .entry(message_type)
            .or_default()
            .push(tx);
        rx
    }

    /// Feeds one inbound, already-decrypted message into the dispatcher.
    /// If it matches a pending request it is routed there; otherwise it
    /// fans out to subscribers of its message type.
    pub async fn dispatch_inbound(&self, peer: Peer, message: Message) {
        if message.is_response() {
            let key = (peer, message.request_id().clone());
            let stale = {
                let pending = self.pending.lock().expect("pending table lock poisoned");
                match pending.get(&key) {
                    Some(sender) => sender.send(message.clone()).is_err(),
                    None => false,
                }
            };
            if stale {
                self.pending
                    .lock()
                    .expect("pending table lock poisoned")
                    .remove(&key);
            }
            if self
                .pending
                .lock()
                .expect("pending table lock poisoned")
                .contains_key(&key)
            {
                return;
            }
        }

        let senders: Vec<mpsc::Sender<(Peer, Message)>> = self
            .subscribers
            .lock()
            .expect("subscriber table lock poisoned")
            .get(&MessageType::of(&message))
            .cloned()
            .unwrap_or_default();

        for sender in senders {
            match tokio::time::timeout(
                SUBSCRIBER_BACKPRESSURE_TIMEOUT,
                sender.send((peer, message.clone())),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(_)) => trace!("subscriber channel closed, dropping for it"),
                Err(_) => trace!("subscriber too slow, dropping message for it"),
            }
        }
    }

    /// Reserves a fresh request id for `peer` and returns it along with the
    /// channel any matching responses will arrive on.
    fn open_pending(&self, peer: Peer) -> Result<(RequestId, mpsc::UnboundedReceiver<Message>), Discv5Error> {
        let mut pending = self.pending.lock().expect("pending table lock poisoned");
        let mut request_id = RequestId::random();
        let mut attempts = 0;
        while pending.contains_key(&(peer, request_id.clone())) {
            attempts += 1;
            if attempts >= MAX_REQUEST_ID_COLLISION_RETRIES {
                return Err(Discv5Error::Validation(
                    "could not draw a free request id".into(),
                ));
            }
            request_id = RequestId::random();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        pending.insert((peer, request_id.clone()), tx);
        Ok((request_id, rx))
    }

    fn close_pending(&self, peer: Peer, request_id: RequestId) {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(&(peer, request_id));
    }

    fn flush_outbound(&self, datagrams: Vec<(Endpoint, Vec<u8>)>) {
        for datagram in datagrams {
            trace!(endpoint = %datagram.0, "queued outbound datagram for request");
            // Only fails if the socket's write task has shut down, in which
            // case there is nothing left to do but let the request time out.
            let _ = self.outbound.send(datagram);
        }
    }

    /// Sends a message that is itself a reply (PONG, NODES, TALKRESP) and
    /// expects no further correlation; fire-and-forget from the dispatcher's
    /// point of view.
    pub fn reply(&self, peer: Peer, message: Message) {
        let datagrams = self.pool.send_message(peer, message);
        self.flush_outbound(datagrams);
    }

    /// Sends `build_message(request_id)` to `peer` and waits up to
    /// `timeout` for a single correlated response. Appropriate for PING and
    /// TALKREQ; FINDNODE uses [`Dispatcher::find_node`] instead, since its
    /// NODES reply may span several packets.
    pub async fn send_request(
        &self,
        peer: Peer,
        build_message: impl FnOnce(RequestId) -> Message,
        timeout: Duration,
    ) -> Result<Message, Discv5Error> {
        let (request_id, mut rx) = self.open_pending(peer)?;
        let message = build_message(request_id.clone());
        let datagrams = self.pool.send_message(peer, message);
        self.flush_outbound(datagrams);

        let result = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) | Err(_) => Err(Discv5Error::TooSlow(peer.id)),
        };
        self.close_pending(peer, request_id);
        result
    }

    /// Sends a FINDNODE for `distances` and collects every NODES packet in
    /// the response, honoring each packet's declared `total` count.
    pub async fn find_node(
        &self,
        peer: Peer,
        distances: Vec<u16>,
        timeout: Duration,
    ) -> Result<Vec<crate::enr::NodeRecord>, Discv5Error> {
        let (request_id, mut rx) = self.open_pending(peer)?;
        let message = Message::FindNode(crate::message::FindNode {
            request_id: request_id.clone(),
            distances,
        });
        let datagrams = self.pool.send_message(peer, message);
        self.flush_outbound(datagrams);

        let deadline = Instant::now() + timeout;
        let mut enrs = Vec::new();
        let mut expected_packets: Option<u8> = None;
        let mut packets_received: u8 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(Message::Nodes(nodes))) => {
                    expected_packets.get_or_insert(nodes.total);
                    packets_received += 1;
                    enrs.extend(nodes.enrs);
                    if Some(packets_received) >= expected_packets {
                        break;
                    }
                }
                Ok(Some(_unexpected)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        self.close_pending(peer, request_id);

        if packets_received == 0 {
            Err(Discv5Error::TooSlow(peer.id))
        } else {
            Ok(enrs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::Pairs;
    use crate::message::{Nodes, Ping};
    use ethereum_types::H256;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> Peer {
        Peer::new(
            H256::random(),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000),
        )
    }

    fn sample_record(key_byte: u8) -> crate::enr::NodeRecord {
        let signer = secp256k1::SecretKey::from_slice(&[key_byte; 32]).unwrap();
        let pubkey = secp256k1::PublicKey::from_secret_key(secp256k1::SECP256K1, &signer);
        crate::enr::NodeRecord::sign(
            1,
            Pairs {
                id: Some("v4".into()),
                secp256k1: Some(ethereum_types::H264::from_slice(&pubkey.serialize())),
                ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
                udp_port: Some(9000),
            },
            &signer,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_inbound_fans_out_to_subscribers_of_the_right_type() {
        let (pool, _events) = Pool::new(H256::random(), None);
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::new(pool), outbound_tx);

        let mut pings = dispatcher.subscribe(MessageType::Ping);
        let mut pongs = dispatcher.subscribe(MessageType::Pong);

        let message = Message::Ping(Ping {
            request_id: RequestId::random(),
            enr_seq: 1,
        });
        dispatcher.dispatch_inbound(peer(), message.clone()).await;

        let (_, received) = pings.try_recv().expect("ping subscriber should have it");
        assert_eq!(received, message);
        assert!(pongs.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_request_times_out_when_nobody_answers() {
        let (pool, _events) = Pool::new(H256::random(), None);
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::new(pool), outbound_tx);

        let result = dispatcher
            .send_request(
                peer(),
                |request_id| Message::Ping(Ping { request_id, enr_seq: 0 }),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(Discv5Error::TooSlow(_))));
    }

    #[tokio::test]
    async fn find_node_collects_every_nodes_packet_before_returning() {
        let (pool, _events) = Pool::new(H256::random(), None);
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(pool), outbound_tx));
        let target_peer = peer();

        let dispatcher_clone = dispatcher.clone();
        let handle = tokio::spawn(async move {
            dispatcher_clone
                .find_node(target_peer, vec![255], Duration::from_millis(500))
                .await
        });

        // Give the request a moment to register before replying, matching
        // how a real round trip interleaves with the receive loop.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let pending_key = {
            let pending = dispatcher.pending.lock().unwrap();
            pending.keys().next().cloned().expect("a pending find_node request")
        };
        let (_, request_id) = pending_key;

        dispatcher
            .dispatch_inbound(
                target_peer,
                Message::Nodes(Nodes {
                    request_id: request_id.clone(),
                    total: 2,
                    enrs: vec![sample_record(1)],
                }),
            )
            .await;
        dispatcher
            .dispatch_inbound(
                target_peer,
                Message::Nodes(Nodes {
                    request_id,
                    total: 2,
                    enrs: vec![sample_record(2)],
                }),
            )
            .await;

        let enrs = handle.await.unwrap().unwrap();
        assert_eq!(enrs.len(), 2);
    }
}
