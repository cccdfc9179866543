//! # Datagram Transports
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`UdpTransport`] | tokio UDP socket |
//! | [`MemoryNetwork`] | in-process registry of endpoints, for tests and simulations |
//!
//! Both hand received datagrams to a bounded channel of [`InboundPacket`]s.
//! Datagrams larger than [`MAX_PACKET_SIZE`] are never delivered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::packet::MAX_PACKET_SIZE;
pub use crate::protocols::{InboundPacket, Transport};

/// Inbound datagrams buffered before the receive loop applies backpressure.
pub const INBOUND_QUEUE_SIZE: usize = 1024;

// ============================================================================
// UDP
// ============================================================================

#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind `addr` and start the receive loop.
    ///
    /// The loop ends when the returned receiver is dropped.
    pub async fn bind(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<InboundPacket>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        tokio::spawn(recv_loop(socket.clone(), tx));
        debug!(addr = %local_addr, "udp transport bound");
        Ok((Self { socket, local_addr }, rx))
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<InboundPacket>) {
    // One byte of slack detects oversize datagrams instead of truncating them.
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms.
                trace!(error = %e, "udp receive error");
                continue;
            }
        };
        if len > MAX_PACKET_SIZE {
            trace!(from = %from, len, "dropping oversize datagram");
            continue;
        }
        if tx.send((from, buf[..len].to_vec())).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() > MAX_PACKET_SIZE {
            bail!("datagram of {} bytes exceeds {}", bytes.len(), MAX_PACKET_SIZE);
        }
        self.socket
            .send_to(&bytes, to)
            .await
            .with_context(|| format!("send to {to} failed"))?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Shared registry of in-memory endpoints keyed by socket address.
///
/// Datagrams to an unregistered address, or to an endpoint whose queue is
/// full, are dropped the way UDP would drop them.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<InboundPacket>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint at `addr`, replacing any previous one.
    pub fn bind(&self, addr: SocketAddr) -> (MemoryTransport, mpsc::Receiver<InboundPacket>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(addr, tx);
        }
        let transport = MemoryTransport {
            network: self.clone(),
            local_addr: addr,
        };
        (transport, rx)
    }

    /// Remove the endpoint at `addr`; later datagrams to it are lost.
    pub fn unbind(&self, addr: &SocketAddr) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.remove(addr);
        }
    }

    fn endpoint(&self, addr: &SocketAddr) -> Option<mpsc::Sender<InboundPacket>> {
        self.endpoints.lock().ok()?.get(addr).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() > MAX_PACKET_SIZE {
            bail!("datagram of {} bytes exceeds {}", bytes.len(), MAX_PACKET_SIZE);
        }
        match self.network.endpoint(&to) {
            Some(endpoint) => {
                if endpoint.try_send((self.local_addr, bytes)).is_err() {
                    warn!(to = %to, "in-memory endpoint congested, dropping datagram");
                }
            }
            None => trace!(to = %to, "no in-memory endpoint, dropping datagram"),
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
