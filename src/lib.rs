//! # discv5 - Encrypted UDP Node Discovery
//!
//! A node discovery protocol over UDP:
//!
//! - **Identity**: Ed25519 keys; a node id is the SHA-256 of the public key
//! - **Records**: signed, sequence-numbered contact records
//! - **Packets**: AES-CTR masked headers, AES-GCM encrypted messages
//! - **Sessions**: X25519 handshake driven by WHOAREYOU challenges
//! - **Routing**: Kademlia table with 256 log-distance buckets and pending
//!   eviction of unresponsive entries
//! - **Lookups**: iterative FINDNODE queries with bounded parallelism
//!
//! ## Architecture
//!
//! The service uses the **Actor Pattern**: [`Discv5`] is a cheap-to-clone
//! handle and a private actor owns all protocol state, processing commands
//! and inbound datagrams sequentially. [`Node`] wraps the handle with a UDP
//! socket and bootstrap logic.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: bind, bootstrap, lookups, TALKREQ |
//! | `service` | Discovery actor: requests, sessions, timers, events |
//! | `identity` | Keypairs, node ids, signed records |
//! | `crypto` | Key agreement, key derivation, AEAD, header masking |
//! | `packet` | Packet codec with masked static header |
//! | `session` | Sessions, challenges and the handshake |
//! | `messages` | PING/PONG, FINDNODE/NODES, TALKREQ/TALKRESP |
//! | `routing` | Kademlia routing table |
//! | `lookup` | Iterative lookup state machine and driver |
//! | `addr_votes` | External address voting from PONGs |
//! | `timer` | Deadline queue for request and eviction timers |
//! | `transport` | UDP and in-memory datagram transports |
//! | `protocols` | Transport and RPC trait definitions |
//! | `config` | Service configuration |

mod addr_votes;
mod config;
mod crypto;
mod identity;
mod lookup;
mod messages;
mod node;
mod packet;
mod protocols;
mod routing;
mod service;
mod session;
mod timer;
mod transport;

pub use addr_votes::AddrVotes;
pub use config::{Config, NodeLookupConfig};
pub use crypto::{CryptoError, SignatureError};
pub use identity::{Keypair, NodeAddress, NodeId, NodeRecord};
pub use lookup::{Lookup, LookupConfig, LookupState};
pub use messages::TalkRequest;
pub use node::Node;
pub use packet::{MAX_PACKET_SIZE, Packet, PacketError};
pub use protocols::{DiscoveryRpc, InboundPacket, Transport};
pub use routing::{EntryStatus, RoutingTable};
pub use service::{Discv5, Event, RequestError};
pub use session::SessionError;
pub use transport::{MemoryNetwork, MemoryTransport, UdpTransport};
