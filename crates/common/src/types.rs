use crate::error::MalformedAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A published onion service: the public service id plus its virtual port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnionService {
    pub id: String,
    pub port: u16,
}

impl OnionService {
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            port,
        }
    }

    /// `<id>.onion:<port>`, the form handed to a SOCKS dialer
    pub fn host_port(&self) -> String {
        format!("{}.onion:{}", self.id, self.port)
    }
}

impl fmt::Display for OnionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.port)
    }
}

/// How to reach a peer: its identity and, if it listens, its onion service.
///
/// Textual exchange form is `<service-id>:<port>/<peer-id>`. A client-only
/// peer has no service and renders as `/<peer-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerEndpoint {
    peer_id: String,
    service: Option<OnionService>,
}

impl PeerEndpoint {
    pub fn listening(peer_id: impl Into<String>, service: OnionService) -> Self {
        Self {
            peer_id: peer_id.into(),
            service: Some(service),
        }
    }

    pub fn client_only(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            service: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn service(&self) -> Option<&OnionService> {
        self.service.as_ref()
    }

    pub fn is_listening(&self) -> bool {
        self.service.is_some()
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => write!(f, "{}/{}", service, self.peer_id),
            None => write!(f, "/{}", self.peer_id),
        }
    }
}

impl FromStr for PeerEndpoint {
    type Err = MalformedAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service_part, peer_id) = s
            .rsplit_once('/')
            .ok_or_else(|| MalformedAddress::new(s, "missing '/' before peer id"))?;
        if peer_id.is_empty() {
            return Err(MalformedAddress::new(s, "empty peer id"));
        }
        if service_part.is_empty() {
            return Ok(Self::client_only(peer_id));
        }

        let (id, port) = service_part
            .rsplit_once(':')
            .ok_or_else(|| MalformedAddress::new(s, "missing ':' before port"))?;
        if id.is_empty() {
            return Err(MalformedAddress::new(s, "empty service id"));
        }
        let port = parse_port(port).ok_or_else(|| MalformedAddress::new(s, "invalid port"))?;

        Ok(Self::listening(peer_id, OnionService::new(id, port)))
    }
}

impl TryFrom<String> for PeerEndpoint {
    type Error = MalformedAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerEndpoint> for String {
    fn from(value: PeerEndpoint) -> Self {
        value.to_string()
    }
}

/// Parse a non-zero TCP port.
pub fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
