/// Transport layer
///
/// - [`Transport`]: the dial/listen seam the network host is built on
/// - [`OnionTransport`]: the adapter over an anonymity session
/// - [`Upgrader`] / [`IdentityUpgrader`]: authentication and encryption of raw streams

pub mod connection;
pub mod onion;
pub mod secure;
pub mod upgrader;

pub use connection::{RawConnection, RawListener};
pub use onion::OnionTransport;
pub use secure::{ChannelError, SecureConn, SecureReader, SecureWriter};
pub use upgrader::{upgrade_listener, IdentityUpgrader, UpgradeError, UpgradedListener, Upgrader};

use crate::address::{Multiaddr, Protocol};
use crate::context::{Context, Interrupted};
use crate::identity::PeerId;
use crate::session::SessionError;
use async_trait::async_trait;
use tordht_common::MalformedAddress;

/// A way of reaching peers by address
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether `dial` understands this address; never touches the network
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Open and upgrade a connection. With `expected` set, the remote must
    /// authenticate as that peer.
    async fn dial(
        &self,
        ctx: &Context,
        addr: &Multiaddr,
        expected: Option<&PeerId>,
    ) -> Result<SecureConn, DialError>;

    async fn listen(&self, addr: &Multiaddr) -> Result<UpgradedListener, TransportError>;

    fn protocols(&self) -> Vec<Protocol>;
}

/// Dial errors
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Malformed address: {0}")]
    Malformed(#[from] MalformedAddress),

    #[error("Unsupported address: {0}")]
    Unsupported(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    #[error("Dial interrupted: {0}")]
    Interrupted(Interrupted),
}

/// Listen errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Unsupported listen address: {0}")]
    UnsupportedListenAddress(String),

    #[error("Listen failure: {0}")]
    ListenFailure(SessionError),
}
