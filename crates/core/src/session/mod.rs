/// Anonymity-network sessions
///
/// A session can dial `host:port` targets through the anonymity network and
/// publish onion services that accept inbound streams. The transport only
/// sees these traits; [`TorSession`] drives a real Tor daemon and
/// [`MemoryNetwork`] simulates one in-process.

pub mod memory;
pub mod tor;

pub use memory::{MemoryNetwork, MemorySession};
pub use tor::TorSession;

use crate::context::{Context, Interrupted};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tordht_common::OnionService;

/// A bidirectional byte stream handed out by a session
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Options for publishing an onion service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    /// Request a version 3 (ed25519) service
    pub version3: bool,
    /// Virtual ports to expose; empty picks one at random
    pub remote_ports: Vec<u16>,
    /// Do not return until the service descriptor has been uploaded
    pub wait_for_publish: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            version3: true,
            remote_ports: Vec::new(),
            wait_for_publish: true,
        }
    }
}

/// A published onion service accepting inbound streams
#[async_trait]
pub trait AnonListener: Send + Sync {
    /// The service id and virtual port peers dial
    fn service(&self) -> &OnionService;

    async fn accept(&mut self) -> Result<BoxedStream, SessionError>;

    /// Withdraw the service; later accepts fail
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// One running anonymity-network session
#[async_trait]
pub trait AnonSession: Send + Sync {
    /// Open a stream to `address` (`host:port`) over `network` (`tcp`, `tcp4` or `tcp6`)
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxedStream, SessionError>;

    async fn listen(
        &self,
        ctx: &Context,
        options: ListenOptions,
    ) -> Result<Box<dyn AnonListener>, SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Invalid dial target: {0}")]
    InvalidTarget(String),

    #[error("Unsupported listen options: {0}")]
    UnsupportedOptions(String),

    #[error("Target unreachable: {0}")]
    Unreachable(String),

    #[error("Control port error: {0}")]
    Control(String),

    #[error("SOCKS error: {0}")]
    Socks(String),

    #[error("Interrupted: {0}")]
    Interrupted(#[from] Interrupted),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Networks a session accepts for `dial`
pub(crate) fn check_network(network: &str) -> Result<(), SessionError> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Ok(()),
        other => Err(SessionError::UnsupportedNetwork(other.to_string())),
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub(crate) fn split_target(address: &str) -> Result<(&str, u16), SessionError> {
    let invalid = || SessionError::InvalidTarget(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = tordht_common::parse_port(port).ok_or_else(invalid)?;
    Ok((host, port))
}
