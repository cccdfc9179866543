//! # High-Level Node API
//!
//! A [`Node`] binds a transport, creates the local record and runs the
//! discovery service behind it.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:9000").await?;
//! println!("{}", node.local_record().await?.to_hex());
//!
//! // Join the network through known records
//! node.bootstrap(&[seed_record]).await?;
//!
//! // Find peers close to some id
//! let peers = node.find_peers(target).await;
//!
//! // Serve an application protocol over TALKREQ
//! let mut requests = node.talk_requests().await?;
//! while let Some(request) = requests.recv().await {
//!     request.respond(b"pong".to_vec());
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, NodeLookupConfig};
use crate::identity::{Keypair, NodeId, NodeRecord};
use crate::messages::TalkRequest;
use crate::protocols::{InboundPacket, Transport};
use crate::routing::EntryStatus;
use crate::service::{Discv5, Event};
use crate::transport::{MemoryNetwork, UdpTransport};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// Sequence number of a freshly created local record.
const INITIAL_RECORD_SEQ: u64 = 1;

pub struct Node {
    keypair: Keypair,
    local_addr: SocketAddr,
    service: Discv5,
    events: TakeOnce<Event>,
}

impl Node {
    /// Bind a UDP socket with a fresh identity and default settings.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with(addr, Keypair::generate(), Config::default()).await
    }

    pub async fn bind_with(addr: &str, keypair: Keypair, config: Config) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let (transport, inbound) = UdpTransport::bind(addr).await?;
        let local_addr = transport.local_addr();
        let advertised = advertised_addr(local_addr);
        info!(
            node_id = %keypair.node_id(),
            bound = %local_addr,
            advertised = %advertised,
            "node listening"
        );
        Ok(Self::start(keypair, config, Arc::new(transport), inbound, advertised))
    }

    /// Attach to an in-memory network at `addr`.
    pub fn in_memory(network: &MemoryNetwork, addr: SocketAddr, keypair: Keypair, config: Config) -> Self {
        let (transport, inbound) = network.bind(addr);
        Self::start(keypair, config, Arc::new(transport), inbound, addr)
    }

    fn start(
        keypair: Keypair,
        config: Config,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundPacket>,
        advertised: SocketAddr,
    ) -> Self {
        let local_addr = transport.local_addr();
        let record = keypair.create_record(INITIAL_RECORD_SEQ, Some(advertised));
        let (service, events) = Discv5::new(keypair.clone(), record, config, transport, inbound);
        Self {
            keypair,
            local_addr,
            service,
            events: tokio::sync::Mutex::new(Some(events)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Address the transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Underlying service handle, for callers that need the full request API.
    pub fn service(&self) -> &Discv5 {
        &self.service
    }

    /// Current signed record; its address follows external address votes.
    pub async fn local_record(&self) -> Result<NodeRecord> {
        Ok(self.service.local_record().await?)
    }

    pub async fn add_peer(&self, record: NodeRecord) -> bool {
        self.service.add_node(record).await
    }

    /// Add the seed records, ping each of them, then look up our own id to
    /// populate the routing table. Returns the number of seeds that answered.
    pub async fn bootstrap(&self, seeds: &[NodeRecord]) -> Result<usize> {
        if seeds.is_empty() {
            return Ok(0);
        }
        let mut reached = 0;
        for seed in seeds {
            if !self.service.add_node(seed.clone()).await {
                warn!(peer = %seed.node_id().short(), "bootstrap record rejected");
                continue;
            }
            match self.service.ping(seed).await {
                Ok(_) => reached += 1,
                Err(e) => warn!(peer = %seed.node_id().short(), error = %e, "bootstrap peer unreachable"),
            }
        }
        if reached == 0 {
            bail!("none of {} bootstrap peers answered", seeds.len());
        }
        let found = self.service.find_node_lookup(self.node_id()).await;
        info!(reached, found = found.len(), "bootstrap complete");
        Ok(reached)
    }

    /// Iterative lookup of the peers closest to `target`.
    pub async fn find_peers(&self, target: NodeId) -> Vec<NodeRecord> {
        self.service.find_node_lookup(target).await
    }

    /// Lookup that keeps only peers that answer a PING.
    pub async fn discover(&self, target: NodeId, settings: NodeLookupConfig) -> Vec<NodeRecord> {
        self.service.node_lookup(target, settings).await
    }

    pub async fn ping(&self, record: &NodeRecord) -> Result<u64> {
        Ok(self.service.ping(record).await?)
    }

    pub async fn find_node(&self, record: &NodeRecord, distances: Vec<u16>) -> Result<Vec<NodeRecord>> {
        Ok(self.service.find_node(record, distances).await?)
    }

    /// Send an application request over TALKREQ and wait for the answer.
    pub async fn talk(&self, record: &NodeRecord, protocol: &[u8], payload: Vec<u8>) -> Result<Vec<u8>> {
        Ok(self.service.talk_req(record, protocol.to_vec(), payload).await?)
    }

    pub async fn talk_requests(&self) -> Result<mpsc::Receiver<TalkRequest>> {
        Ok(self.service.talk_requests().await?)
    }

    /// Service events. The receiver can be taken once.
    pub async fn events(&self) -> Result<mpsc::Receiver<Event>> {
        let mut guard = self.events.lock().await;
        guard.take().context("event receiver already taken")
    }

    pub async fn peers(&self) -> Vec<(NodeRecord, EntryStatus)> {
        self.service.table_entries().await
    }

    pub async fn shutdown(&self) {
        debug!(node_id = %self.node_id().short(), "shutting down");
        self.service.shutdown().await;
    }
}

/// Address to put in the local record.
///
/// A specific bound IP is used as is. For a wildcard bind the outbound
/// interface is probed by connecting a UDP socket to well-known resolvers,
/// falling back to loopback; PONG votes correct it later.
fn advertised_addr(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let (wildcard, targets, loopback): (&str, &[&str], IpAddr) = if bound.is_ipv4() {
        ("0.0.0.0:0", &["8.8.8.8:53", "1.1.1.1:53"], IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        (
            "[::]:0",
            &["[2001:4860:4860::8888]:53", "[2606:4700:4700::1111]:53"],
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        )
    };
    for target in targets {
        if let Ok(socket) = std::net::UdpSocket::bind(wildcard)
            && socket.connect(target).is_ok()
            && let Ok(local) = socket.local_addr()
            && !local.ip().is_loopback()
            && !local.ip().is_unspecified()
        {
            return SocketAddr::new(local.ip(), bound.port());
        }
    }
    SocketAddr::new(loopback, bound.port())
}
