use crate::content::ContentKey;
use crate::identity::PeerId;
use serde::{Deserialize, Serialize};

/// A peer and the textual addresses it can be dialed on.
///
/// Provider records and peer-exchange answers share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addresses: Vec<String>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addresses: Vec<String>) -> Self {
        Self { peer_id, addresses }
    }
}

/// A peer announcing that it provides a content key
pub type ProviderRecord = PeerRecord;

/// Requests exchanged between connected peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping { nonce: u64 },

    /// Record the sender as a provider of `key`
    AddProvider {
        key: ContentKey,
        provider: ProviderRecord,
    },

    GetProviders { key: ContentKey, limit: usize },

    /// Ask for peers the receiver knows how to reach
    FindPeers { limit: usize },
}

impl Request {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::AddProvider { .. } => "add_provider",
            Self::GetProviders { .. } => "get_providers",
            Self::FindPeers { .. } => "find_peers",
        }
    }
}

/// Answers to [`Request`]s
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong { nonce: u64 },
    Ack,
    Providers { providers: Vec<ProviderRecord> },
    Peers { peers: Vec<PeerRecord> },
    Error { message: String },
}

impl Response {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Pong { .. } => "pong",
            Self::Ack => "ack",
            Self::Providers { .. } => "providers",
            Self::Peers { .. } => "peers",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// One frame on a peer link; the id pairs responses with requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
