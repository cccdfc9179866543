//! Trait definitions for the discovery service's collaborators.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Transport`] | Datagram send capability the service writes packets to |
//! | [`DiscoveryRpc`] | Request/response operations a lookup issues against peers |
//!
//! The service never opens sockets itself: it is handed a [`Transport`] and a
//! receiver of inbound datagrams, which lets tests run whole networks in
//! memory.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::NodeRecord;

/// An inbound datagram and the address it came from.
pub type InboundPacket = (SocketAddr, Vec<u8>);

/// Unreliable datagram delivery.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram. Delivery is not guaranteed.
    async fn send(&self, to: SocketAddr, bytes: Vec<u8>) -> Result<()>;

    /// Address the transport receives on.
    fn local_addr(&self) -> SocketAddr;
}

/// Discovery requests against a single peer.
#[async_trait]
pub trait DiscoveryRpc: Send + Sync + 'static {
    /// Liveness check. Returns the sequence number of the peer's record.
    async fn ping(&self, to: &NodeRecord) -> Result<u64>;

    /// Records the peer holds at the given log2 distances from itself.
    async fn find_node(&self, to: &NodeRecord, distances: Vec<u16>) -> Result<Vec<NodeRecord>>;

    /// Application request tunneled through the session.
    async fn talk_req(&self, to: &NodeRecord, protocol: Vec<u8>, payload: Vec<u8>) -> Result<Vec<u8>>;
}
