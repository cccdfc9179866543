//! # Protocol Messages
//!
//! Plaintext messages carried inside encrypted packets. Each message is a
//! single type byte followed by a bincode body. Deserialization is size-bounded
//! so a hostile peer cannot make us allocate more than a packet's worth.
//!
//! | Type | Message | Body |
//! |------|---------|------|
//! | 1 | PING | `id, enr_seq` |
//! | 2 | PONG | `id, enr_seq, recipient_ip, recipient_port` |
//! | 3 | FINDNODE | `id, distances` |
//! | 4 | NODES | `id, total, records` |
//! | 5 | TALKREQ | `id, protocol, payload` |
//! | 6 | TALKRESP | `id, payload` |

use std::net::{IpAddr, SocketAddr};

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::identity::{NodeAddress, NodeRecord};
use crate::packet::MAX_PACKET_SIZE;

/// Correlates a response with the request that caused it.
pub type RequestId = u64;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_PACKET_SIZE as u64;

/// Most pages a NODES response may be split into.
pub const MAX_NODES_RESPONSES: u64 = 5;

const PING_TYPE: u8 = 1;
const PONG_TYPE: u8 = 2;
const FINDNODE_TYPE: u8 = 3;
const NODES_TYPE: u8 = 4;
const TALKREQ_TYPE: u8 = 5;
const TALKRESP_TYPE: u8 = 6;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize with the same encoding and limit `deserialize_bounded` expects.
pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Ping {
        enr_seq: u64,
    },
    FindNode {
        distances: Vec<u16>,
    },
    TalkReq {
        protocol: Vec<u8>,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Pong {
        enr_seq: u64,
        /// Source address of the PING as seen by the responder.
        recipient: SocketAddr,
    },
    Nodes {
        /// Number of NODES messages making up the whole response.
        total: u64,
        records: Vec<NodeRecord>,
    },
    TalkResp {
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: RequestId,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: rand::random(),
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            RequestBody::Ping { .. } => "PING",
            RequestBody::FindNode { .. } => "FINDNODE",
            RequestBody::TalkReq { .. } => "TALKREQ",
        }
    }
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self.body {
            ResponseBody::Pong { .. } => "PONG",
            ResponseBody::Nodes { .. } => "NODES",
            ResponseBody::TalkResp { .. } => "TALKRESP",
        }
    }
}

/// Whether `response` is the kind of answer `request` expects.
pub fn request_matches_response(request: &RequestBody, response: &ResponseBody) -> bool {
    matches!(
        (request, response),
        (RequestBody::Ping { .. }, ResponseBody::Pong { .. })
            | (RequestBody::FindNode { .. }, ResponseBody::Nodes { .. })
            | (RequestBody::TalkReq { .. }, ResponseBody::TalkResp { .. })
    )
}

// ============================================================================
// Encoding
// ============================================================================

impl Message {
    /// Fails when the body exceeds what a single packet can carry.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let (kind, body) = match self {
            Message::Request(Request { id, body }) => match body {
                RequestBody::Ping { enr_seq } => (PING_TYPE, serialize_bounded(&(id, enr_seq))?),
                RequestBody::FindNode { distances } => {
                    (FINDNODE_TYPE, serialize_bounded(&(id, distances))?)
                }
                RequestBody::TalkReq { protocol, payload } => {
                    (TALKREQ_TYPE, serialize_bounded(&(id, protocol, payload))?)
                }
            },
            Message::Response(Response { id, body }) => match body {
                ResponseBody::Pong { enr_seq, recipient } => (
                    PONG_TYPE,
                    serialize_bounded(&(id, enr_seq, recipient.ip(), recipient.port()))?,
                ),
                ResponseBody::Nodes { total, records } => {
                    (NODES_TYPE, serialize_bounded(&(id, total, records))?)
                }
                ResponseBody::TalkResp { payload } => {
                    (TALKRESP_TYPE, serialize_bounded(&(id, payload))?)
                }
            },
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(kind);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        let (&kind, body) = data
            .split_first()
            .ok_or_else(|| bincode::Error::from(bincode::ErrorKind::Custom("empty message".into())))?;
        let message = match kind {
            PING_TYPE => {
                let (id, enr_seq) = deserialize_bounded(body)?;
                Message::Request(Request {
                    id,
                    body: RequestBody::Ping { enr_seq },
                })
            }
            FINDNODE_TYPE => {
                let (id, distances) = deserialize_bounded(body)?;
                Message::Request(Request {
                    id,
                    body: RequestBody::FindNode { distances },
                })
            }
            TALKREQ_TYPE => {
                let (id, protocol, payload) = deserialize_bounded(body)?;
                Message::Request(Request {
                    id,
                    body: RequestBody::TalkReq { protocol, payload },
                })
            }
            PONG_TYPE => {
                let (id, enr_seq, ip, port): (RequestId, u64, IpAddr, u16) = deserialize_bounded(body)?;
                Message::Response(Response {
                    id,
                    body: ResponseBody::Pong {
                        enr_seq,
                        recipient: SocketAddr::new(ip, port),
                    },
                })
            }
            NODES_TYPE => {
                let (id, total, records) = deserialize_bounded(body)?;
                Message::Response(Response {
                    id,
                    body: ResponseBody::Nodes { total, records },
                })
            }
            TALKRESP_TYPE => {
                let (id, payload) = deserialize_bounded(body)?;
                Message::Response(Response {
                    id,
                    body: ResponseBody::TalkResp { payload },
                })
            }
            other => {
                return Err(bincode::ErrorKind::Custom(format!("unknown message type {}", other)).into());
            }
        };
        Ok(message)
    }
}

// ============================================================================
// Application Requests
// ============================================================================

/// An inbound TALKREQ handed to the application.
///
/// Dropping it without calling [`TalkRequest::respond`] sends an empty
/// TALKRESP.
#[derive(Debug)]
pub struct TalkRequest {
    pub node_address: NodeAddress,
    pub protocol: Vec<u8>,
    pub payload: Vec<u8>,
    responder: oneshot::Sender<Vec<u8>>,
}

impl TalkRequest {
    pub(crate) fn new(
        node_address: NodeAddress,
        protocol: Vec<u8>,
        payload: Vec<u8>,
    ) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (responder, rx) = oneshot::channel();
        let request = Self {
            node_address,
            protocol,
            payload,
            responder,
        };
        (request, rx)
    }

    pub fn respond(self, payload: Vec<u8>) {
        let _ = self.responder.send(payload);
    }
}

/// Channel on which inbound TALKREQs are delivered.
pub type TalkRequestSender = mpsc::Sender<TalkRequest>;
