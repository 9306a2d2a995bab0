//! Component H: the high-level network API, and the single owner of the
//! routing table (per the cycle-breaking design in the spec's redesign
//! notes: the routing table, the pool and the dispatcher all answer to this
//! one component, never to each other directly).
//!
//! [`Network`] wires together the pieces built elsewhere in this crate — the
//! [`RoutingTable`], the [`EnrDatabase`], the session [`Pool`] and the
//! [`Dispatcher`] — behind the request/response surface a caller actually
//! wants: `ping`, `find_nodes`, `talk`, `bond`, `lookup_enr` and the
//! iterative [`Network::recursive_find_nodes`] lookup. [`crate::maintenance`]
//! drives this surface from background tasks; the two are split because one
//! is "what the node can be asked to do" and the other is "what the node
//! does on its own schedule."

use crate::config::Config;
use crate::dispatcher::{Dispatcher, MessageType};
use crate::enr::NodeRecord;
use crate::enr_db::{EnrDatabase, FileEnrDatabase};
use crate::identity::{build_local_enr, load_or_generate_static_key};
use crate::kademlia::RoutingTable;
use crate::lookup::{self, LookupConfig};
use crate::message::{FindNode, Message, Ping, Pong, TalkRequest, TalkResponse};
use crate::node::{log_distance, Endpoint, NodeId, Peer};
use crate::pool::{HandshakeContext, Pool, PoolEvent};
use crate::socket::Transport;
use crate::unresponsive::UnresponsivePeers;
use crate::Discv5Error;
use bytes::Bytes;
use futures::future::BoxFuture;
use secp256k1::SecretKey;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

/// Bound on the request/response round trip for everything except a
/// recursive lookup's adaptively-timed FINDNODE calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Pool capacity ceiling; `None` below would disable eviction entirely.
const MAX_SESSIONS: usize = 1024;

/// A registered handler for a TALKREQ protocol. Returns the bytes to embed
/// in the TALKRESP; an empty TALKRESP is indistinguishable to the caller
/// from "protocol unsupported," which is also what happens when no handler
/// is registered at all.
pub type TalkHandler = Arc<dyn Fn(Peer, Bytes) -> BoxFuture<'static, Bytes> + Send + Sync>;

/// The live node: identity, routing table, ENR store, session pool and
/// dispatcher, plus the bookkeeping ([`UnresponsivePeers`], last-pong
/// timestamps, the `routing_table_ready` flag) the maintenance loops read.
pub struct Network {
    pub(crate) config: Config,
    local_node_id: NodeId,
    local_signer: SecretKey,
    local_enr: Mutex<NodeRecord>,
    pub(crate) routing_table: Mutex<RoutingTable>,
    pub(crate) enr_db: Arc<dyn EnrDatabase>,
    pub(crate) pool: Arc<Pool>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    transport: Transport,
    pub(crate) unresponsive: Arc<UnresponsivePeers>,
    last_pong_at: Mutex<HashMap<NodeId, Instant>>,
    routing_table_ready: AtomicBool,
    talk_handlers: Mutex<HashMap<Vec<u8>, TalkHandler>>,
    lookup_config: LookupConfig,
}

impl Network {
    /// Binds the UDP socket, builds or loads the local identity, and wires
    /// the pool/dispatcher/routing-table together. Does not yet run
    /// anything; call [`Network::run`] to spawn the receive loop.
    pub async fn new(config: Config) -> Result<Arc<Self>, Discv5Error> {
        let enr_db: Arc<dyn EnrDatabase> = Arc::new(FileEnrDatabase::open(&config.base_dir)?);

        let local_signer = match config.private_key {
            Some(key) => key,
            None => load_or_generate_static_key(&config.base_dir)?,
        };

        let local_pubkey = secp256k1::PublicKey::from_secret_key(secp256k1::SECP256K1, &local_signer);
        let local_node_id = crate::enr::node_id_from_public_key(&ethereum_types::H512::from_slice(
            &local_pubkey.serialize_uncompressed()[1..],
        ));
        let existing = enr_db.get(&local_node_id);
        let local_enr = build_local_enr(
            &local_signer,
            Some(match config.listen_on {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            }),
            config.port,
            existing,
        )
        .map_err(|err| Discv5Error::Validation(err.to_string()))?;
        let _ = enr_db.set(local_enr.clone());

        let transport = Transport::bind(config.listen_endpoint()).await?;
        let (pool, mut pool_events) = Pool::new(local_node_id, Some(MAX_SESSIONS));
        let pool = Arc::new(pool);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), outbound_tx));

        let network = Arc::new(Self {
            config,
            local_node_id,
            local_signer,
            local_enr: Mutex::new(local_enr),
            routing_table: Mutex::new(RoutingTable::new(local_node_id)),
            enr_db,
            pool,
            dispatcher,
            transport: transport.clone(),
            unresponsive: Arc::new(UnresponsivePeers::new()),
            last_pong_at: Mutex::new(HashMap::new()),
            routing_table_ready: AtomicBool::new(false),
            talk_handlers: Mutex::new(HashMap::new()),
            lookup_config: LookupConfig::default(),
        });

        // Drains the pool's outbound queue onto the wire.
        let write_transport = transport.clone();
        tokio::spawn(async move {
            while let Some((to, datagram)) = outbound_rx.recv().await {
                if let Err(err) = write_transport.send_to(&datagram, to).await {
                    warn!(%err, %to, "failed to send datagram");
                }
            }
        });

        // Surfaces pool events (handshake completion, discarded packets) as
        // tracing output; nothing downstream currently needs to act on them
        // beyond observability.
        tokio::spawn(async move {
            while let Some(event) = pool_events.recv().await {
                match event {
                    PoolEvent::SessionHandshakeComplete { peer } => {
                        trace!(%peer, "session handshake complete");
                    }
                    PoolEvent::PacketDiscarded { from, reason } => {
                        debug!(%from, %reason, "packet discarded");
                    }
                }
            }
        });

        Ok(network)
    }

    /// Spawns the inbound receive loop. Returns immediately; the loop itself
    /// runs for the lifetime of the returned join handle.
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move { network.receive_loop().await })
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = [0u8; crate::packet::MAX_PACKET_SIZE];
        loop {
            let (len, from) = match self.transport.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(err) => {
                    warn!(%err, "socket read error");
                    continue;
                }
            };
            let local_enr = self.local_enr.lock().expect("local enr lock poisoned").clone();
            let ctx = HandshakeContext {
                local_signer: &self.local_signer,
                local_enr: &local_enr,
                enr_db: self.enr_db.as_ref(),
            };
            let outcome = self.pool.handle_datagram(&buf[..len], from, &ctx);
            for (to, datagram) in outcome.to_send {
                if let Err(err) = self.transport.send_to(&datagram, to).await {
                    warn!(%err, %to, "failed to send reply datagram");
                }
            }
            for (peer, message) in outcome.delivered {
                self.dispatcher.dispatch_inbound(peer, message).await;
            }
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn local_enr(&self) -> NodeRecord {
        self.local_enr.lock().expect("local enr lock poisoned").clone()
    }

    pub fn routing_table_ready(&self) -> bool {
        self.routing_table_ready.load(Ordering::Relaxed)
    }

    pub fn last_pong_at(&self, node_id: NodeId) -> Option<Instant> {
        self.last_pong_at
            .lock()
            .expect("last-pong table lock poisoned")
            .get(&node_id)
            .copied()
    }

    /// Registers a handler for `protocol`'s TALKREQ messages. Registering
    /// the same protocol twice is a programmer error, fatal at
    /// initialization (per the spec's error-handling design), not a
    /// steady-state condition.
    pub fn register_talk_protocol<F, Fut>(&self, protocol: Vec<u8>, handler: F) -> Result<(), Discv5Error>
    where
        F: Fn(Peer, Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Bytes> + Send + 'static,
    {
        let mut handlers = self.talk_handlers.lock().expect("talk handler table lock poisoned");
        if handlers.contains_key(&protocol) {
            return Err(Discv5Error::DuplicateProtocol(protocol));
        }
        handlers.insert(
            protocol,
            Arc::new(move |peer, payload| Box::pin(handler(peer, payload))),
        );
        Ok(())
    }

    pub(crate) fn talk_handler(&self, protocol: &[u8]) -> Option<TalkHandler> {
        self.talk_handlers
            .lock()
            .expect("talk handler table lock poisoned")
            .get(protocol)
            .cloned()
    }

    /// Witnesses `node_id` in the routing table, probing and evicting the
    /// bucket head if the witness pushed it out.
    pub(crate) fn witness(self: &Arc<Self>, node_id: NodeId) {
        let evicted = self
            .routing_table
            .lock()
            .expect("routing table lock poisoned")
            .update(node_id);
        if let Some(evicted_id) = evicted {
            let network = self.clone();
            tokio::spawn(async move { network.probe_eviction_candidate(evicted_id).await });
        }
    }

    async fn probe_eviction_candidate(self: Arc<Self>, node_id: NodeId) {
        let Some(peer) = self.peer_for(node_id) else {
            self.routing_table.lock().expect("routing table lock poisoned").remove(node_id);
            return;
        };
        match self.ping(peer).await {
            Ok(_) => {
                self.routing_table.lock().expect("routing table lock poisoned").update(node_id);
            }
            Err(_) => {
                self.routing_table.lock().expect("routing table lock poisoned").remove(node_id);
            }
        }
    }

    fn peer_for(&self, node_id: NodeId) -> Option<Peer> {
        let enr = self.enr_db.get(&node_id)?;
        let (ip, port) = enr.udp_endpoint()?;
        Some(Peer::new(node_id, Endpoint::new(IpAddr::V4(ip), port)))
    }

    /// Single request/response: sends a PING, returns the matching PONG.
    pub async fn ping(&self, peer: Peer) -> Result<Pong, Discv5Error> {
        let enr_seq = self.local_enr().seq;
        let message = self
            .dispatcher
            .send_request(
                peer,
                |request_id| Message::Ping(Ping { request_id, enr_seq }),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        match message {
            Message::Pong(pong) => {
                self.last_pong_at
                    .lock()
                    .expect("last-pong table lock poisoned")
                    .insert(peer.id, Instant::now());
                Ok(pong)
            }
            other => Err(Discv5Error::Validation(format!(
                "expected PONG in reply to PING, got {other:?}"
            ))),
        }
    }

    /// Sends FINDNODE for `distances` and returns every returned ENR that
    /// actually satisfies `log_distance(peer.id, enr.id) ∈ distances`;
    /// violators are discarded and logged rather than propagated.
    pub async fn find_nodes(&self, peer: Peer, distances: Vec<u16>) -> Result<Vec<NodeRecord>, Discv5Error> {
        let enrs = self
            .dispatcher
            .find_node(peer, distances.clone(), DEFAULT_REQUEST_TIMEOUT)
            .await?;
        let mut valid = Vec::with_capacity(enrs.len());
        for enr in enrs {
            match enr.node_id() {
                Some(id) if distances.contains(&(log_distance(peer.id, id) as u16)) => {
                    valid.push(enr);
                }
                Some(id) => {
                    debug!(%id, ?distances, "discarding enr outside requested distances");
                }
                None => debug!("discarding enr with no usable node id"),
            }
        }
        Ok(valid)
    }

    /// Generic sub-protocol RPC. An empty TALKRESP means "unsupported,"
    /// surfaced to the caller as [`Discv5Error::ProtocolNotSupported`].
    pub async fn talk(&self, peer: Peer, protocol: Bytes, payload: Bytes) -> Result<Bytes, Discv5Error> {
        let message = self
            .dispatcher
            .send_request(
                peer,
                |request_id| {
                    Message::TalkRequest(TalkRequest {
                        request_id,
                        protocol,
                        payload,
                    })
                },
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        match message {
            Message::TalkResponse(resp) if resp.payload.is_empty() => Err(Discv5Error::ProtocolNotSupported),
            Message::TalkResponse(resp) => Ok(resp.payload),
            other => Err(Discv5Error::Validation(format!(
                "expected TALKRESP in reply to TALKREQ, got {other:?}"
            ))),
        }
    }

    /// Ping, then look up the peer's ENR; on success, admits it to the
    /// routing table and marks `routing_table_ready`.
    pub async fn bond(self: &Arc<Self>, peer: Peer) -> Result<(), Discv5Error> {
        self.ping(peer).await?;
        self.lookup_enr(peer.id, 0).await?;
        self.witness(peer.id);
        self.routing_table_ready.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Returns a cached ENR if its sequence number is already `>= min_seq`;
    /// otherwise fetches it directly (if an endpoint is known) or falls back
    /// to a full recursive lookup.
    pub async fn lookup_enr(self: &Arc<Self>, node_id: NodeId, min_seq: u64) -> Result<NodeRecord, Discv5Error> {
        if let Some(enr) = self.enr_db.get(&node_id) {
            if enr.seq >= min_seq {
                return Ok(enr);
            }
            if let Some((ip, port)) = enr.udp_endpoint() {
                let peer = Peer::new(node_id, Endpoint::new(IpAddr::V4(ip), port));
                if let Ok(enrs) = self.find_nodes(peer, vec![0]).await {
                    if let Some(found) = enrs.into_iter().find(|e| e.node_id() == Some(node_id)) {
                        let _ = self.enr_db.set(found.clone());
                        if found.seq >= min_seq {
                            return Ok(found);
                        }
                    }
                }
            }
        }

        let found = self.run_lookup(node_id, None).await;
        found
            .into_iter()
            .find(|e| e.node_id() == Some(node_id))
            .ok_or(Discv5Error::EmptyFindNodesResponse)
    }

    /// Streams the `k` closest nodes to `target` as they are discovered.
    /// Dropping the stream cancels outstanding work within one scheduling
    /// tick.
    pub fn recursive_find_nodes(self: &Arc<Self>, target: NodeId) -> ReceiverStream<NodeRecord> {
        let (tx, rx) = mpsc::channel(256);
        let network = self.clone();
        tokio::spawn(async move {
            network.run_lookup(target, Some(tx)).await;
        });
        ReceiverStream::new(rx)
    }

    /// Shared implementation behind [`Network::lookup_enr`] and
    /// [`Network::recursive_find_nodes`]: seeds from the routing table,
    /// excludes the local id and anyone in the shared unresponsive cache,
    /// and marks failures as unresponsive as they happen.
    async fn run_lookup(
        self: &Arc<Self>,
        target: NodeId,
        results: Option<mpsc::Sender<NodeRecord>>,
    ) -> Vec<NodeRecord> {
        let seeds = {
            let table = self.routing_table.lock().expect("routing table lock poisoned");
            table
                .iter_closest(target)
                .into_iter()
                .take(table.bucket_size())
                .filter_map(|id| self.enr_db.get(&id))
                .collect::<Vec<_>>()
        };

        let local_node_id = self.local_node_id;
        let unresponsive = self.unresponsive.clone();
        let exclude = move |id: NodeId| id == local_node_id || unresponsive.is_unresponsive(id);

        let network = self.clone();
        let query = move |record: NodeRecord, timeout: Duration| {
            let network = network.clone();
            async move { network.query_for_lookup(record, target, timeout).await }
        };

        lookup::recursive_find_nodes(target, seeds, &self.lookup_config, exclude, results, query).await
    }

    async fn query_for_lookup(
        &self,
        record: NodeRecord,
        target: NodeId,
        timeout: Duration,
    ) -> Result<Vec<NodeRecord>, Discv5Error> {
        let Some(node_id) = record.node_id() else {
            return Err(Discv5Error::Validation("seed enr has no usable node id".into()));
        };
        let Some((ip, port)) = record.udp_endpoint() else {
            self.unresponsive.mark_unresponsive(node_id);
            return Err(Discv5Error::Validation("seed enr has no advertised endpoint".into()));
        };
        let peer = Peer::new(node_id, Endpoint::new(IpAddr::V4(ip), port));
        let distance = log_distance(node_id, target) as u16;

        let result = self
            .dispatcher
            .find_node(peer, vec![distance], timeout)
            .await;
        match result {
            Ok(enrs) => {
                let mut valid = Vec::with_capacity(enrs.len());
                for enr in enrs {
                    match enr.node_id() {
                        Some(id) if log_distance(node_id, id) as u16 == distance => {
                            let _ = self.enr_db.set(enr.clone());
                            valid.push(enr);
                        }
                        _ => debug!(%node_id, "discarding enr outside the requested distance during lookup"),
                    }
                }
                Ok(valid)
            }
            Err(err) => {
                self.unresponsive.mark_unresponsive(node_id);
                Err(err)
            }
        }
    }

    /// Handles an inbound PING: replies with a PONG and asynchronously
    /// looks up the sender's ENR to admit it to the routing table.
    pub(crate) async fn serve_ping(self: &Arc<Self>, peer: Peer, ping: Ping) {
        let pong = Pong {
            request_id: ping.request_id,
            enr_seq: self.local_enr().seq,
            observed_ip: peer.endpoint.ip,
            observed_udp_port: peer.endpoint.udp_port,
        };
        self.dispatcher.reply(peer, Message::Pong(pong));

        let network = self.clone();
        tokio::spawn(async move {
            match network.lookup_enr(peer.id, 0).await {
                Ok(_) => network.witness(peer.id),
                Err(err) => debug!(%peer, %err, "could not look up enr for ping sender"),
            }
        });
    }

    /// Handles an inbound FINDNODE: validates `distances`, gathers matching
    /// ENRs from the routing table (or our own record for distance 0), and
    /// replies with one or more NODES packets chunked to respect the wire
    /// size limit.
    pub(crate) async fn serve_find_nodes(&self, peer: Peer, request: FindNode) {
        const MAX_ENRS_PER_PACKET: usize = 16;

        if request.distances.is_empty() {
            debug!(%peer, "rejecting findnode with no distances");
            return;
        }
        let mut seen_distances = std::collections::HashSet::new();
        for &d in &request.distances {
            if d > 256 || !seen_distances.insert(d) {
                debug!(%peer, "rejecting findnode with invalid or duplicate distance {d}");
                return;
            }
        }

        let mut enrs = Vec::new();
        for &distance in &request.distances {
            if distance == 0 {
                enrs.push(self.local_enr());
                continue;
            }
            let node_ids = {
                self.routing_table
                    .lock()
                    .expect("routing table lock poisoned")
                    .get_nodes_at_log_distance(distance as usize)
            };
            enrs.extend(node_ids.into_iter().filter_map(|id| self.enr_db.get(&id)));
        }

        let chunks: Vec<Vec<NodeRecord>> = if enrs.is_empty() {
            vec![Vec::new()]
        } else {
            enrs.chunks(MAX_ENRS_PER_PACKET)
                .map(|chunk| chunk.to_vec())
                .collect()
        };
        let total = chunks.len() as u8;
        for chunk in chunks {
            self.dispatcher.reply(
                peer,
                Message::Nodes(crate::message::Nodes {
                    request_id: request.request_id.clone(),
                    total,
                    enrs: chunk,
                }),
            );
        }
    }

    /// Handles an inbound TALKREQ: dispatches to a registered protocol
    /// handler, or replies with an empty payload if none is registered.
    pub(crate) async fn serve_talk(self: &Arc<Self>, peer: Peer, request: TalkRequest) {
        let payload = match self.talk_handler(&request.protocol) {
            Some(handler) => handler(peer, request.payload).await,
            None => Bytes::new(),
        };
        self.dispatcher.reply(
            peer,
            Message::TalkResponse(TalkResponse {
                request_id: request.request_id,
                payload,
            }),
        );
    }

    /// Subscribes to inbound request types and drives the serve_* handlers
    /// for the lifetime of the node. Spawned once by [`crate::maintenance`].
    pub(crate) async fn serve_requests(self: Arc<Self>) {
        let mut pings = self.dispatcher.subscribe(MessageType::Ping);
        let mut find_nodes = self.dispatcher.subscribe(MessageType::FindNode);
        let mut talks = self.dispatcher.subscribe(MessageType::TalkRequest);

        loop {
            tokio::select! {
                Some((peer, Message::Ping(ping))) = pings.recv() => {
                    self.serve_ping(peer, ping).await;
                }
                Some((peer, Message::FindNode(request))) = find_nodes.recv() => {
                    self.serve_find_nodes(peer, request).await;
                }
                Some((peer, Message::TalkRequest(request))) = talks.recv() => {
                    self.serve_talk(peer, request).await;
                }
                else => break,
            }
        }
    }
}
