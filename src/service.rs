//! # Discovery Service
//!
//! [`Discv5`] is the handle; a private actor owns every piece of mutable
//! protocol state and processes commands one at a time:
//!
//! | State | Keyed by |
//! |-------|----------|
//! | Routing table | node id |
//! | Sessions and outstanding challenges | node address |
//! | In-flight request (at most one) and queued requests | node address |
//! | Request timeouts and eviction probes | timer key |
//! | External address votes | voter id |
//!
//! Inbound datagrams are forwarded into the same command channel, so packets
//! from one address are handled in receipt order and session installation is
//! never concurrent.
//!
//! ## Request Lifecycle
//!
//! ```text
//! no session:  random Message ──► Challenge ──► Handshake(+request) ──► response
//! session:     Message(request) ──────────────────────────────────────► response
//! ```
//!
//! A request that times out fails its caller, ends the session, and marks the
//! peer Disconnected; requests queued behind it fail with the same error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::addr_votes::AddrVotes;
use crate::config::{Config, NodeLookupConfig};
use crate::crypto::MAC_LENGTH;
use crate::identity::{Keypair, MAX_RECORD_SIZE, NodeAddress, NodeId, NodeRecord, distance_cmp};
use crate::lookup::{self, LookupOutcome};
use crate::messages::{
    MAX_NODES_RESPONSES, Message, Request, RequestBody, RequestId, Response, ResponseBody, TalkRequest,
    TalkRequestSender, request_matches_response,
};
use crate::packet::{
    AuthData, ID_NONCE_SIZE, MASKING_IV_SIZE, MAX_PACKET_SIZE, MESSAGE_AUTHDATA_SIZE, MIN_HANDSHAKE_AUTHDATA_SIZE,
    Nonce, Packet, PacketKind, STATIC_HEADER_SIZE,
};
use crate::protocols::{DiscoveryRpc, InboundPacket, Transport};
use crate::routing::{EntryStatus, InsertResult, PendingHandle, PendingResolution, RoutingTable};
use crate::session::{Challenge, Session, SessionError, SessionStore};
use crate::timer::TimerTasks;

const COMMAND_QUEUE_SIZE: usize = 256;
const EVENT_QUEUE_SIZE: usize = 256;
const TALK_QUEUE_SIZE: usize = 64;
const SESSION_PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Largest plaintext that fits in a Message packet.
const MAX_MESSAGE_SIZE: usize =
    MAX_PACKET_SIZE - MASKING_IV_SIZE - STATIC_HEADER_SIZE - MESSAGE_AUTHDATA_SIZE - MAC_LENGTH;

/// Largest request plaintext; it must also fit a Handshake packet carrying
/// the signature, ephemeral key and a full record.
const MAX_REQUEST_SIZE: usize =
    MAX_MESSAGE_SIZE - (MIN_HANDSHAKE_AUTHDATA_SIZE - MESSAGE_AUTHDATA_SIZE) - 64 - 32 - MAX_RECORD_SIZE;

// ============================================================================
// Errors and Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No response within the request timeout.
    Timeout,
    /// The request was addressed to the local node.
    SelfRequest,
    /// The remote sent something that does not answer the request.
    InvalidRemotePacket,
    /// The remote record does not verify.
    InvalidRemoteRecord,
    HandshakeFailed(SessionError),
    /// The service has shut down.
    ChannelClosed,
    /// The record has no socket address.
    Unroutable,
    /// The encoded request would not fit in a packet.
    MessageTooLarge,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "request timed out"),
            RequestError::SelfRequest => write!(f, "request addressed to the local node"),
            RequestError::InvalidRemotePacket => write!(f, "remote sent an invalid response"),
            RequestError::InvalidRemoteRecord => write!(f, "remote record is invalid"),
            RequestError::HandshakeFailed(e) => write!(f, "handshake failed: {}", e),
            RequestError::ChannelClosed => write!(f, "discovery service is not running"),
            RequestError::Unroutable => write!(f, "record has no socket address"),
            RequestError::MessageTooLarge => {
                write!(f, "request exceeds {} bytes", MAX_REQUEST_SIZE)
            }
        }
    }
}

impl std::error::Error for RequestError {}

/// Notifications from the service. Delivery is best effort: events are
/// dropped when the receiver falls behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A record learned from a NODES response.
    Discovered(NodeRecord),
    /// A node entered the routing table, possibly replacing another.
    RecordAdded {
        inserted: NodeRecord,
        evicted: Option<NodeRecord>,
    },
    SessionEstablished(NodeId),
    SessionEnded(NodeId),
    /// Enough peers agreed on our external address to update the local record.
    ExternalAddressUpdated(SocketAddr),
}

type Responder = oneshot::Sender<Result<ResponseBody, RequestError>>;

fn reply(responder: Option<Responder>, result: Result<ResponseBody, RequestError>) {
    if let Some(responder) = responder {
        let _ = responder.send(result);
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct Discv5 {
    cmd_tx: mpsc::Sender<Command>,
    local_id: NodeId,
    config: Arc<Config>,
}

impl std::fmt::Debug for Discv5 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discv5").field("local_id", &self.local_id).finish_non_exhaustive()
    }
}

enum Command {
    Packet(InboundPacket),
    Request {
        contact: NodeRecord,
        body: RequestBody,
        responder: Responder,
    },
    AddNode(NodeRecord, oneshot::Sender<bool>),
    RemoveNode(NodeId, oneshot::Sender<bool>),
    FindRecord(NodeId, oneshot::Sender<Option<NodeRecord>>),
    Nearest(NodeId, usize, oneshot::Sender<Vec<NodeRecord>>),
    TableEntries(oneshot::Sender<Vec<(NodeRecord, EntryStatus)>>),
    LocalRecord(oneshot::Sender<NodeRecord>),
    SetTalkHandler(Option<TalkRequestSender>),
    TalkResponse {
        addr: NodeAddress,
        id: RequestId,
        payload: Vec<u8>,
    },
    Shutdown,
}

impl Discv5 {
    /// Start the service on `transport`, reading datagrams from `inbound`.
    ///
    /// The service stops on [`Discv5::shutdown`] or once every handle is
    /// dropped.
    pub fn new(
        keypair: Keypair,
        local_record: NodeRecord,
        config: Config,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundPacket>,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let local_id = keypair.node_id();
        let config = Arc::new(config);

        let actor = ServiceActor {
            local_id,
            keypair,
            local_record,
            routing: RoutingTable::new(local_id, config.bucket_size),
            sessions: SessionStore::new(
                config.session_cache_capacity,
                config.session_timeout,
                config.challenge_timeout,
            ),
            active_requests: HashMap::new(),
            active_nonces: HashMap::new(),
            queued_requests: HashMap::new(),
            timers: TimerTasks::new(),
            addr_votes: AddrVotes::new(config.addr_votes_to_update_enr),
            talk_handler: None,
            transport,
            events: event_tx,
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            config: config.clone(),
        };
        tokio::spawn(actor.run());
        tokio::spawn(forward_inbound(inbound, cmd_tx.downgrade()));

        let service = Self {
            cmd_tx,
            local_id,
            config,
        };
        (service, event_rx)
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RequestError::ChannelClosed)?;
        rx.await.map_err(|_| RequestError::ChannelClosed)
    }

    async fn request(&self, contact: &NodeRecord, body: RequestBody) -> Result<ResponseBody, RequestError> {
        self.query(|responder| Command::Request {
            contact: contact.clone(),
            body,
            responder,
        })
        .await?
    }

    /// Check liveness. Returns the sequence number of the peer's record.
    pub async fn ping(&self, contact: &NodeRecord) -> Result<u64, RequestError> {
        // The actor fills in the current local sequence number.
        match self.request(contact, RequestBody::Ping { enr_seq: 0 }).await? {
            ResponseBody::Pong { enr_seq, .. } => Ok(enr_seq),
            _ => Err(RequestError::InvalidRemotePacket),
        }
    }

    /// Ask `contact` for the records it holds at the given log2 distances
    /// from itself. Distance 0 asks for its own record.
    pub async fn find_node(&self, contact: &NodeRecord, distances: Vec<u16>) -> Result<Vec<NodeRecord>, RequestError> {
        match self.request(contact, RequestBody::FindNode { distances }).await? {
            ResponseBody::Nodes { records, .. } => Ok(records),
            _ => Err(RequestError::InvalidRemotePacket),
        }
    }

    pub async fn talk_req(
        &self,
        contact: &NodeRecord,
        protocol: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RequestError> {
        match self.request(contact, RequestBody::TalkReq { protocol, payload }).await? {
            ResponseBody::TalkResp { payload } => Ok(payload),
            _ => Err(RequestError::InvalidRemotePacket),
        }
    }

    /// Iterative lookup of the nodes closest to `target`.
    pub async fn find_node_lookup(&self, target: NodeId) -> Vec<NodeRecord> {
        let seeds = self.nearest(target, self.config.lookup_num_results).await;
        let outcome = lookup::run(
            self.clone(),
            target,
            self.config.lookup_config(),
            seeds,
            None,
            self.config.lookup_timeout,
        )
        .await;
        debug!(
            target = ?hex::encode(&target.as_bytes()[..8]),
            found = outcome.closest.len(),
            discovered = outcome.discovered.len(),
            "lookup complete"
        );
        outcome.closest
    }

    /// Lookup with per-peer timeouts that also pings every discovered node
    /// it did not query, keeping only the ones that answer.
    ///
    /// Nodes that answer establish sessions and so enter the routing table.
    pub async fn node_lookup(&self, target: NodeId, settings: NodeLookupConfig) -> Vec<NodeRecord> {
        let seeds = self.nearest(target, settings.max_peers).await;
        let LookupOutcome { closest, discovered } = lookup::run(
            self.clone(),
            target,
            settings.lookup_config(),
            seeds,
            Some(settings.per_peer_timeout),
            self.config.lookup_timeout,
        )
        .await;

        let answered: HashSet<NodeId> = closest.iter().map(NodeRecord::node_id).collect();
        let mut candidates: Vec<NodeRecord> = discovered
            .into_values()
            .filter(|r| r.node_id() != self.local_id && !answered.contains(&r.node_id()))
            .collect();
        candidates.sort_by(|a, b| distance_cmp(&a.node_id().xor_distance(&target), &b.node_id().xor_distance(&target)));
        candidates.truncate(settings.max_peers);

        let mut found = closest;
        let mut candidates = candidates.into_iter();
        let mut probes = JoinSet::new();
        loop {
            while probes.len() < settings.parallelism.max(1) {
                let Some(record) = candidates.next() else { break };
                let service = self.clone();
                probes.spawn(async move {
                    let alive = tokio::time::timeout(settings.per_peer_timeout, service.ping(&record))
                        .await
                        .is_ok_and(|r| r.is_ok());
                    (record, alive)
                });
            }
            match probes.join_next().await {
                Some(Ok((record, true))) => found.push(record),
                Some(_) => {}
                None => break,
            }
        }

        found.sort_by(|a, b| distance_cmp(&a.node_id().xor_distance(&target), &b.node_id().xor_distance(&target)));
        found.truncate(settings.max_peers);
        found
    }

    /// Offer a record to the routing table. Returns false if it was rejected.
    pub async fn add_node(&self, record: NodeRecord) -> bool {
        self.query(|tx| Command::AddNode(record, tx)).await.unwrap_or(false)
    }

    pub async fn remove_node(&self, node_id: NodeId) -> bool {
        self.query(|tx| Command::RemoveNode(node_id, tx)).await.unwrap_or(false)
    }

    pub async fn find_record(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.query(|tx| Command::FindRecord(node_id, tx)).await.ok().flatten()
    }

    /// Routing-table records closest to `target`.
    pub async fn nearest(&self, target: NodeId, limit: usize) -> Vec<NodeRecord> {
        self.query(|tx| Command::Nearest(target, limit, tx)).await.unwrap_or_default()
    }

    pub async fn table_entries(&self) -> Vec<(NodeRecord, EntryStatus)> {
        self.query(Command::TableEntries).await.unwrap_or_default()
    }

    pub async fn local_record(&self) -> Result<NodeRecord, RequestError> {
        self.query(Command::LocalRecord).await
    }

    /// Route inbound TALKREQs to the returned channel, replacing any earlier
    /// handler.
    pub async fn talk_requests(&self) -> Result<mpsc::Receiver<TalkRequest>, RequestError> {
        let (tx, rx) = mpsc::channel(TALK_QUEUE_SIZE);
        self.cmd_tx
            .send(Command::SetTalkHandler(Some(tx)))
            .await
            .map_err(|_| RequestError::ChannelClosed)?;
        Ok(rx)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

#[async_trait]
impl DiscoveryRpc for Discv5 {
    async fn ping(&self, to: &NodeRecord) -> Result<u64> {
        Ok(Discv5::ping(self, to).await?)
    }

    async fn find_node(&self, to: &NodeRecord, distances: Vec<u16>) -> Result<Vec<NodeRecord>> {
        Ok(Discv5::find_node(self, to, distances).await?)
    }

    async fn talk_req(&self, to: &NodeRecord, protocol: Vec<u8>, payload: Vec<u8>) -> Result<Vec<u8>> {
        Ok(Discv5::talk_req(self, to, protocol, payload).await?)
    }
}

async fn forward_inbound(mut inbound: mpsc::Receiver<InboundPacket>, cmd_tx: mpsc::WeakSender<Command>) {
    while let Some(packet) = inbound.recv().await {
        let Some(cmd_tx) = cmd_tx.upgrade() else { break };
        if cmd_tx.send(Command::Packet(packet)).await.is_err() {
            break;
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    Request(NodeAddress),
    Eviction(PendingHandle),
}

struct ActiveRequest {
    contact: NodeRecord,
    request: Request,
    /// Nonce of the last packet carrying this request.
    nonce: Nonce,
    handshake_sent: bool,
    responder: Option<Responder>,
    /// NODES pages received so far.
    pages: u64,
    total: u64,
    nodes: Vec<NodeRecord>,
}

struct QueuedRequest {
    contact: NodeRecord,
    request: Request,
    responder: Option<Responder>,
}

struct ServiceActor {
    local_id: NodeId,
    keypair: Keypair,
    local_record: NodeRecord,
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    routing: RoutingTable,
    sessions: SessionStore,
    active_requests: HashMap<NodeAddress, ActiveRequest>,
    /// Maps packet nonces to the request they carry, to match challenges.
    active_nonces: HashMap<Nonce, NodeAddress>,
    queued_requests: HashMap<NodeAddress, VecDeque<QueuedRequest>>,
    timers: TimerTasks<TimerKey>,
    addr_votes: AddrVotes,
    talk_handler: Option<TalkRequestSender>,
    events: mpsc::Sender<Event>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::WeakSender<Command>,
}

impl ServiceActor {
    async fn run(mut self) {
        let mut ping_tick =
            tokio::time::interval_at(Instant::now() + self.config.ping_interval, self.config.ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune_tick =
            tokio::time::interval_at(Instant::now() + SESSION_PRUNE_INTERVAL, SESSION_PRUNE_INTERVAL);

        debug!(node_id = %self.local_id.short(), addr = ?self.local_record.addr, "discovery service started");
        loop {
            let next_timer = self.timers.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                _ = tokio::time::sleep_until(next_timer.unwrap_or_else(Instant::now)), if next_timer.is_some() => {
                    for key in self.timers.poll_expired(Instant::now()) {
                        self.handle_timer(key).await;
                    }
                }
                _ = ping_tick.tick() => self.ping_connected().await,
                _ = prune_tick.tick() => self.prune_sessions(),
            }
        }

        for (_, active) in self.active_requests.drain() {
            reply(active.responder, Err(RequestError::ChannelClosed));
        }
        for (_, queue) in self.queued_requests.drain() {
            for queued in queue {
                reply(queued.responder, Err(RequestError::ChannelClosed));
            }
        }
        debug!(node_id = %self.local_id.short(), "discovery service stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Packet((from, bytes)) => self.handle_packet(from, &bytes).await,
            Command::Request {
                contact,
                mut body,
                responder,
            } => {
                if let RequestBody::Ping { enr_seq } = &mut body {
                    *enr_seq = self.local_record.seq;
                }
                self.send_request(contact, Request::new(body), Some(responder)).await;
            }
            Command::AddNode(record, tx) => {
                let accepted = self.add_node(record).await;
                let _ = tx.send(accepted);
            }
            Command::RemoveNode(node_id, tx) => {
                let removed = self.routing.evict_node(&node_id).is_some();
                let _ = tx.send(removed);
            }
            Command::FindRecord(node_id, tx) => {
                let record = self.routing.get_with_pending(&node_id).map(|e| e.record.clone());
                let _ = tx.send(record);
            }
            Command::Nearest(target, limit, tx) => {
                let _ = tx.send(self.routing.nearest(&target, limit));
            }
            Command::TableEntries(tx) => {
                let entries = self.routing.iter().map(|e| (e.record.clone(), e.status)).collect();
                let _ = tx.send(entries);
            }
            Command::LocalRecord(tx) => {
                let _ = tx.send(self.local_record.clone());
            }
            Command::SetTalkHandler(handler) => {
                self.talk_handler = handler;
            }
            Command::TalkResponse { addr, id, payload } => {
                let response = Response {
                    id,
                    body: ResponseBody::TalkResp { payload },
                };
                self.send_response(addr, response).await;
            }
            Command::Shutdown => {}
        }
    }

    fn emit(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            trace!("event receiver full or closed, dropping event");
        }
    }

    async fn send(&self, to: SocketAddr, bytes: Vec<u8>) {
        if let Err(e) = self.transport.send(to, bytes).await {
            debug!(to = %to, error = %e, "packet send failed");
        }
    }

    // ------------------------------------------------------------------------
    // Routing table admission
    // ------------------------------------------------------------------------

    async fn add_node(&mut self, record: NodeRecord) -> bool {
        if record.verify().is_err() {
            warn!(node = %record.node_id().short(), "rejecting record with invalid signature");
            return false;
        }
        if record.addr.is_none() {
            return false;
        }
        let status = self
            .routing
            .get(&record.node_id())
            .map_or(EntryStatus::Disconnected, |e| e.status);
        self.admit(record, status).await
    }

    async fn admit(&mut self, record: NodeRecord, status: EntryStatus) -> bool {
        match self.routing.insert_or_update(record.clone(), status) {
            InsertResult::Inserted => {
                debug!(node = %record.node_id().short(), ?status, "node added to routing table");
                self.emit(Event::RecordAdded {
                    inserted: record,
                    evicted: None,
                });
                true
            }
            InsertResult::Updated | InsertResult::UpdatedPending => true,
            InsertResult::Pending { handle, disconnected } => {
                trace!(
                    node = %record.node_id().short(),
                    probe = %disconnected.node_id().short(),
                    "bucket full, probing disconnected entry"
                );
                let deadline = Instant::now() + self.config.pending_eviction_timeout;
                self.timers.insert(TimerKey::Eviction(handle), deadline);
                let ping = Request::new(RequestBody::Ping {
                    enr_seq: self.local_record.seq,
                });
                self.send_request(disconnected, ping, None).await;
                true
            }
            InsertResult::Full | InsertResult::SelfInsert => false,
        }
    }

    /// A record for `node_id` from the routing table or an outgoing request.
    fn known_record(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.routing
            .get_with_pending(node_id)
            .map(|e| e.record.clone())
            .or_else(|| {
                self.active_requests
                    .values()
                    .find(|a| a.contact.node_id() == *node_id)
                    .map(|a| a.contact.clone())
            })
    }

    // ------------------------------------------------------------------------
    // Outbound requests
    // ------------------------------------------------------------------------

    async fn send_request(&mut self, contact: NodeRecord, request: Request, responder: Option<Responder>) {
        let node_id = contact.node_id();
        if node_id == self.local_id {
            return reply(responder, Err(RequestError::SelfRequest));
        }
        let Some(socket_addr) = contact.addr else {
            return reply(responder, Err(RequestError::Unroutable));
        };
        let addr = NodeAddress::new(node_id, socket_addr);

        if self.active_requests.contains_key(&addr) {
            trace!(peer = %addr, kind = request.kind(), "request queued behind active request");
            self.queued_requests.entry(addr).or_default().push_back(QueuedRequest {
                contact,
                request,
                responder,
            });
            return;
        }

        let message = match Message::Request(request.clone()).encode() {
            Ok(message) if message.len() <= MAX_REQUEST_SIZE => message,
            _ => {
                debug!(peer = %addr, kind = request.kind(), "request too large to send");
                return reply(responder, Err(RequestError::MessageTooLarge));
            }
        };

        let packet = match self.sessions.get_mut(&addr) {
            Some(session) => match session.encrypt_message(self.local_id, &message) {
                Ok(packet) => packet,
                Err(e) => return reply(responder, Err(RequestError::HandshakeFailed(e))),
            },
            // The remote answers undecryptable packets with a challenge.
            None => Packet::new_random(self.local_id),
        };

        trace!(peer = %addr, kind = request.kind(), id = request.id, "sending request");
        let nonce = packet.nonce;
        let bytes = match packet.encode(&node_id) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %addr, error = %e, "failed to encode request packet");
                return reply(responder, Err(RequestError::MessageTooLarge));
            }
        };
        self.active_nonces.insert(nonce, addr);
        self.active_requests.insert(
            addr,
            ActiveRequest {
                contact,
                request,
                nonce,
                handshake_sent: false,
                responder,
                pages: 0,
                total: 0,
                nodes: Vec::new(),
            },
        );
        self.timers
            .insert(TimerKey::Request(addr), Instant::now() + self.config.request_timeout);
        self.send(socket_addr, bytes).await;
    }

    async fn send_next_queued(&mut self, addr: NodeAddress) {
        let next = self.queued_requests.get_mut(&addr).and_then(VecDeque::pop_front);
        if self.queued_requests.get(&addr).is_some_and(VecDeque::is_empty) {
            self.queued_requests.remove(&addr);
        }
        if let Some(queued) = next {
            self.send_request(queued.contact, queued.request, queued.responder).await;
        }
    }

    async fn complete_request(&mut self, addr: NodeAddress, body: ResponseBody) {
        let Some(active) = self.active_requests.remove(&addr) else {
            return;
        };
        self.active_nonces.remove(&active.nonce);
        self.timers.remove(&TimerKey::Request(addr));
        self.routing.update_status(&addr.node_id, EntryStatus::Connected);
        if let ResponseBody::Nodes { records, .. } = &body {
            self.process_discovered(records);
        }
        reply(active.responder, Ok(body));
        self.send_next_queued(addr).await;
    }

    fn fail_request(&mut self, addr: NodeAddress, error: RequestError) {
        let Some(active) = self.active_requests.remove(&addr) else {
            return;
        };
        self.active_nonces.remove(&active.nonce);
        self.timers.remove(&TimerKey::Request(addr));
        debug!(peer = %addr, kind = active.request.kind(), error = %error, "request failed");

        self.end_session(&addr);
        self.routing.update_status(&addr.node_id, EntryStatus::Disconnected);
        reply(active.responder, Err(error.clone()));
        if let Some(queue) = self.queued_requests.remove(&addr) {
            for queued in queue {
                reply(queued.responder, Err(error.clone()));
            }
        }
    }

    fn end_session(&mut self, addr: &NodeAddress) {
        if self.sessions.remove(addr).is_some() {
            self.emit(Event::SessionEnded(addr.node_id));
        }
    }

    // ------------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------------

    async fn handle_packet(&mut self, from: SocketAddr, bytes: &[u8]) {
        let packet = match Packet::decode(&self.local_id, bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping malformed packet");
                return;
            }
        };
        match (packet.kind(), packet.src_id()) {
            (PacketKind::Challenge, _) => self.handle_challenge(from, packet).await,
            (PacketKind::Message, Some(src_id)) => {
                self.handle_message_packet(NodeAddress::new(src_id, from), packet).await
            }
            (PacketKind::Handshake, Some(src_id)) => {
                self.handle_handshake(NodeAddress::new(src_id, from), packet).await
            }
            _ => {}
        }
    }

    async fn handle_challenge(&mut self, from: SocketAddr, packet: Packet) {
        let AuthData::Challenge { enr_seq, .. } = &packet.authdata else {
            return;
        };
        let enr_seq = *enr_seq;
        let Some(addr) = self.active_nonces.get(&packet.nonce).copied() else {
            trace!(from = %from, "unsolicited challenge");
            return;
        };
        if addr.socket_addr != from {
            debug!(from = %from, expected = %addr.socket_addr, "challenge from unexpected address");
            return;
        }
        if self.active_requests.get(&addr).is_none_or(|a| a.handshake_sent) {
            debug!(peer = %addr, "repeated challenge, ignoring");
            return;
        }
        self.active_nonces.remove(&packet.nonce);

        // A challenge to a packet sent under a session means the remote lost it.
        self.end_session(&addr);

        let updated_record = (enr_seq < self.local_record.seq).then(|| self.local_record.encode());
        let challenge_data = packet.challenge_data();
        let Some(active) = self.active_requests.get_mut(&addr) else {
            return;
        };
        let Ok(message) = Message::Request(active.request.clone()).encode() else {
            return self.fail_request(addr, RequestError::MessageTooLarge);
        };
        let sealed = Session::encrypt_with_header(&active.contact, &self.keypair, updated_record, &challenge_data, &message)
            .map_err(RequestError::HandshakeFailed)
            .and_then(|(handshake, session)| match handshake.encode(&addr.node_id) {
                Ok(bytes) => Ok((handshake, bytes, session)),
                Err(e) => {
                    warn!(peer = %addr, error = %e, "failed to encode handshake");
                    Err(RequestError::MessageTooLarge)
                }
            });
        match sealed {
            Ok((handshake, bytes, session)) => {
                active.nonce = handshake.nonce;
                active.handshake_sent = true;
                let contact = active.contact.clone();
                self.active_nonces.insert(handshake.nonce, addr);
                self.timers
                    .insert(TimerKey::Request(addr), Instant::now() + self.config.request_timeout);
                trace!(peer = %addr, "answering challenge with handshake");
                self.send(from, bytes).await;
                self.session_established(addr, session, contact).await;
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "failed to build handshake");
                self.fail_request(addr, e);
            }
        }
    }

    async fn handle_message_packet(&mut self, addr: NodeAddress, packet: Packet) {
        let aad = packet.challenge_data();
        let decrypted = self
            .sessions
            .get_mut(&addr)
            .map(|session| session.decrypt_message(&packet.nonce, &packet.message, &aad));
        match decrypted {
            Some(Ok(plaintext)) => self.handle_plaintext(addr, &plaintext).await,
            Some(Err(e)) => {
                debug!(peer = %addr, error = %e, "message decryption failed, sending challenge");
                self.end_session(&addr);
                self.send_challenge(addr, packet.nonce).await;
            }
            None => {
                trace!(peer = %addr, "message without session, sending challenge");
                self.send_challenge(addr, packet.nonce).await;
            }
        }
    }

    async fn send_challenge(&mut self, addr: NodeAddress, request_nonce: Nonce) {
        if self.sessions.has_challenge(&addr) {
            trace!(peer = %addr, "challenge already outstanding");
            return;
        }
        let remote_record = self.known_record(&addr.node_id);
        let enr_seq = remote_record.as_ref().map_or(0, |r| r.seq);
        let mut id_nonce = [0u8; ID_NONCE_SIZE];
        OsRng.fill_bytes(&mut id_nonce);

        let packet = Packet::new_challenge(request_nonce, id_nonce, enr_seq);
        let data = packet.challenge_data();
        let Ok(bytes) = packet.encode(&addr.node_id) else {
            return;
        };
        self.sessions.insert_challenge(addr, Challenge { data, remote_record });
        self.send(addr.socket_addr, bytes).await;
    }

    async fn handle_handshake(&mut self, addr: NodeAddress, packet: Packet) {
        let AuthData::Handshake {
            id_signature,
            ephemeral_public,
            record,
            ..
        } = &packet.authdata
        else {
            return;
        };
        let Some(challenge) = self.sessions.take_challenge(&addr) else {
            debug!(peer = %addr, "handshake without outstanding challenge");
            return;
        };
        let established = Session::establish_from_challenge(
            &self.keypair,
            &addr.node_id,
            &challenge,
            id_signature,
            ephemeral_public,
            record.as_deref(),
        );
        let (mut session, remote_record) = match established {
            Ok(established) => established,
            Err(e) => {
                warn!(peer = %addr, error = %e, "handshake verification failed");
                return;
            }
        };
        let aad = packet.challenge_data();
        let plaintext = match session.decrypt_message(&packet.nonce, &packet.message, &aad) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(peer = %addr, error = %e, "handshake message does not decrypt");
                return;
            }
        };
        self.session_established(addr, session, remote_record).await;
        self.handle_plaintext(addr, &plaintext).await;
    }

    async fn session_established(&mut self, addr: NodeAddress, session: Session, record: NodeRecord) {
        if self.sessions.establish(addr, session) {
            debug!(peer = %addr, "session established");
            self.emit(Event::SessionEstablished(addr.node_id));
        }
        if record.addr == Some(addr.socket_addr) {
            self.admit(record, EntryStatus::Connected).await;
        } else {
            debug!(peer = %addr, advertised = ?record.addr, "record address differs from source, not admitting");
        }
    }

    async fn handle_plaintext(&mut self, addr: NodeAddress, plaintext: &[u8]) {
        match Message::decode(plaintext) {
            Ok(Message::Request(request)) => self.handle_request(addr, request).await,
            Ok(Message::Response(response)) => self.handle_response(addr, response).await,
            Err(e) => debug!(peer = %addr, error = %e, "undecodable message"),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------------

    async fn handle_request(&mut self, addr: NodeAddress, request: Request) {
        trace!(peer = %addr, kind = request.kind(), id = request.id, "request received");
        match request.body {
            RequestBody::Ping { enr_seq } => {
                let pong = ResponseBody::Pong {
                    enr_seq: self.local_record.seq,
                    recipient: addr.socket_addr,
                };
                self.send_response(addr, Response { id: request.id, body: pong }).await;
                self.refresh_if_stale(&addr.node_id, enr_seq).await;
            }
            RequestBody::FindNode { distances } => {
                let records = self.records_at_distances(&distances);
                for response in nodes_responses(request.id, records) {
                    self.send_response(addr, response).await;
                }
            }
            RequestBody::TalkReq { protocol, payload } => {
                self.handle_talk_req(addr, request.id, protocol, payload).await;
            }
        }
    }

    fn records_at_distances(&self, distances: &[u16]) -> Vec<NodeRecord> {
        let limit = self.config.max_nodes_response;
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for &distance in distances {
            if records.len() >= limit {
                break;
            }
            if distance > 256 || !seen.insert(distance) {
                continue;
            }
            if distance == 0 {
                records.push(self.local_record.clone());
            } else {
                records.extend(self.routing.values_of_distance(distance));
            }
        }
        records.truncate(limit);
        records
    }

    async fn handle_talk_req(&mut self, addr: NodeAddress, id: RequestId, protocol: Vec<u8>, payload: Vec<u8>) {
        let empty = Response {
            id,
            body: ResponseBody::TalkResp { payload: Vec::new() },
        };
        let Some(handler) = self.talk_handler.clone() else {
            return self.send_response(addr, empty).await;
        };
        let (request, rx) = TalkRequest::new(addr, protocol, payload);
        if handler.try_send(request).is_err() {
            debug!(peer = %addr, "talk handler unavailable, answering empty");
            return self.send_response(addr, empty).await;
        }
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        let wait = self.config.request_timeout;
        tokio::spawn(async move {
            let payload = match tokio::time::timeout(wait, rx).await {
                Ok(Ok(payload)) => payload,
                _ => Vec::new(),
            };
            let _ = cmd_tx.send(Command::TalkResponse { addr, id, payload }).await;
        });
    }

    async fn send_response(&mut self, addr: NodeAddress, response: Response) {
        let kind = response.kind();
        let message = match Message::Response(response.clone()).encode() {
            Ok(message) if message.len() <= MAX_MESSAGE_SIZE => message,
            _ => {
                warn!(peer = %addr, kind, "response too large to send");
                // The requester still gets a prompt, empty answer.
                let ResponseBody::TalkResp { .. } = response.body else {
                    return;
                };
                let empty = Response {
                    id: response.id,
                    body: ResponseBody::TalkResp { payload: Vec::new() },
                };
                let Ok(message) = Message::Response(empty).encode() else {
                    return;
                };
                message
            }
        };
        let Some(session) = self.sessions.get_mut(&addr) else {
            debug!(peer = %addr, kind, "no session to respond on");
            return;
        };
        let packet = match session.encrypt_message(self.local_id, &message) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %addr, error = %e, "failed to encrypt response");
                return;
            }
        };
        match packet.encode(&addr.node_id) {
            Ok(bytes) => self.send(addr.socket_addr, bytes).await,
            Err(e) => warn!(peer = %addr, error = %e, "failed to encode response"),
        }
    }

    /// Fetch a newer record of `node_id` with FINDNODE [0] when `seq` shows
    /// ours is stale.
    async fn refresh_if_stale(&mut self, node_id: &NodeId, seq: u64) {
        let Some(known) = self.routing.record(node_id) else {
            return;
        };
        if seq > known.seq {
            trace!(node = %node_id.short(), known = known.seq, advertised = seq, "refreshing stale record");
            let request = Request::new(RequestBody::FindNode { distances: vec![0] });
            self.send_request(known, request, None).await;
        }
    }

    // ------------------------------------------------------------------------
    // Inbound responses
    // ------------------------------------------------------------------------

    async fn handle_response(&mut self, addr: NodeAddress, response: Response) {
        let Some(active) = self.active_requests.get_mut(&addr) else {
            trace!(peer = %addr, kind = response.kind(), "unsolicited response");
            return;
        };
        if active.request.id != response.id || !request_matches_response(&active.request.body, &response.body) {
            debug!(peer = %addr, kind = response.kind(), "response does not match active request");
            return;
        }

        match response.body {
            ResponseBody::Nodes { total, records } => {
                let requested = match &active.request.body {
                    RequestBody::FindNode { distances } => distances.clone(),
                    _ => Vec::new(),
                };
                let total = total.clamp(1, MAX_NODES_RESPONSES);
                for record in records {
                    let id = record.node_id();
                    if id == self.local_id {
                        continue;
                    }
                    if !requested.contains(&addr.node_id.log2_distance(&id)) {
                        trace!(peer = %addr, node = %id.short(), "record at unrequested distance");
                        continue;
                    }
                    if record.verify().is_err() {
                        debug!(peer = %addr, node = %id.short(), "dropping unverifiable record");
                        continue;
                    }
                    active.nodes.push(record);
                }
                active.pages += 1;
                active.total = total;
                if active.pages < total {
                    return;
                }
                let records = std::mem::take(&mut active.nodes);
                self.complete_request(addr, ResponseBody::Nodes { total, records }).await;
            }
            ResponseBody::Pong { enr_seq, recipient } => {
                self.complete_request(addr, ResponseBody::Pong { enr_seq, recipient }).await;
                self.handle_pong(addr, enr_seq, recipient).await;
            }
            body @ ResponseBody::TalkResp { .. } => self.complete_request(addr, body).await,
        }
    }

    /// Refresh known entries, pending ones included, from newer records.
    fn process_discovered(&mut self, records: &[NodeRecord]) {
        for record in records {
            let id = record.node_id();
            if id == self.local_id {
                continue;
            }
            if let Some(entry) = self.routing.get_with_pending(&id)
                && record.seq > entry.record.seq
            {
                let status = entry.status;
                trace!(node = %id.short(), seq = record.seq, "updating record from NODES");
                self.routing.insert_or_update(record.clone(), status);
            }
            self.emit(Event::Discovered(record.clone()));
        }
    }

    async fn handle_pong(&mut self, addr: NodeAddress, enr_seq: u64, recipient: SocketAddr) {
        self.refresh_if_stale(&addr.node_id, enr_seq).await;
        if !self.config.enr_update || !self.addr_votes.add_vote(addr.node_id, recipient) {
            return;
        }
        if self.local_record.addr == Some(recipient) {
            return;
        }
        let updated = self.keypair.update_record_addr(&self.local_record, recipient);
        info!(addr = %recipient, seq = updated.seq, "external address updated");
        self.local_record = updated;
        self.addr_votes.clear();
        self.emit(Event::ExternalAddressUpdated(recipient));
        self.ping_connected().await;
    }

    // ------------------------------------------------------------------------
    // Timers and maintenance
    // ------------------------------------------------------------------------

    async fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Request(addr) => {
                let partial = self
                    .active_requests
                    .get_mut(&addr)
                    .filter(|a| a.pages > 0)
                    .map(|a| (a.total, std::mem::take(&mut a.nodes)));
                match partial {
                    Some((total, records)) => {
                        debug!(peer = %addr, received = records.len(), "NODES timed out, delivering partial result");
                        self.complete_request(addr, ResponseBody::Nodes { total, records }).await;
                    }
                    None => self.fail_request(addr, RequestError::Timeout),
                }
            }
            TimerKey::Eviction(handle) => match self.routing.resolve_pending(handle) {
                Some(PendingResolution::Promoted { inserted, evicted }) => {
                    debug!(
                        node = %inserted.node_id().short(),
                        evicted = ?evicted.as_ref().map(|r| r.node_id().short()),
                        "pending entry promoted"
                    );
                    self.emit(Event::RecordAdded { inserted, evicted });
                }
                Some(PendingResolution::Discarded(record)) => {
                    trace!(node = %record.node_id().short(), "pending entry discarded");
                }
                None => {}
            },
        }
    }

    async fn ping_connected(&mut self) {
        for record in self.routing.connected() {
            let ping = Request::new(RequestBody::Ping {
                enr_seq: self.local_record.seq,
            });
            self.send_request(record, ping, None).await;
        }
    }

    fn prune_sessions(&mut self) {
        for addr in self.sessions.prune_expired() {
            trace!(peer = %addr, "session expired");
            self.emit(Event::SessionEnded(addr.node_id));
        }
    }
}

/// Split records into NODES responses that each fit in a packet.
///
/// At most [`MAX_NODES_RESPONSES`] pages are produced; an empty result is
/// still answered with one empty page.
fn nodes_responses(id: RequestId, records: Vec<NodeRecord>) -> Vec<Response> {
    let fits = |page: &[NodeRecord]| {
        let message = Message::Response(Response {
            id,
            body: ResponseBody::Nodes {
                total: MAX_NODES_RESPONSES,
                records: page.to_vec(),
            },
        });
        message.encode().is_ok_and(|bytes| bytes.len() <= MAX_MESSAGE_SIZE)
    };

    let mut pages: Vec<Vec<NodeRecord>> = Vec::new();
    let mut current: Vec<NodeRecord> = Vec::new();
    for record in records {
        current.push(record);
        if fits(&current) {
            continue;
        }
        let overflow = current.pop();
        if !current.is_empty() {
            pages.push(std::mem::take(&mut current));
        }
        if let Some(record) = overflow
            && fits(std::slice::from_ref(&record))
        {
            current.push(record);
        }
    }
    if !current.is_empty() || pages.is_empty() {
        pages.push(current);
    }
    pages.truncate(MAX_NODES_RESPONSES as usize);

    let total = pages.len() as u64;
    pages
        .into_iter()
        .map(|records| Response {
            id,
            body: ResponseBody::Nodes { total, records },
        })
        .collect()
}
