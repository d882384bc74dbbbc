/// API Response types

use serde::{Deserialize, Serialize};

/// Local peer information
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerResponse {
    /// Peer ID (hex)
    pub peer_id: String,
    /// Endpoint in `<service-id>:<port>/<peer-id>` form; absent for client-only hosts
    pub endpoint: Option<String>,
    pub listen_addrs: Vec<String>,
    /// Number of peers with an open link
    pub connected_peers: usize,
}

/// Result of announcing an identifier
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvideResponse {
    pub id: String,
    /// Content key in its base32 text form
    pub key: String,
}

/// A provider record that could not be used
#[derive(Debug, Serialize, Deserialize)]
pub struct UndecodableEntry {
    pub peer_id: String,
    pub reason: String,
}

/// Result of a provider lookup
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvidersResponse {
    pub id: String,
    pub key: String,
    /// Endpoints in `<service-id>:<port>/<peer-id>` form
    pub providers: Vec<String>,
    pub undecodable: Vec<UndecodableEntry>,
    /// True when some provider records were skipped
    pub partial: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}
