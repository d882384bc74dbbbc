/// Provider routing
///
/// The host talks to its routing engine only through [`RoutingEngine`].
/// [`ProviderExchange`] is the engine shipped here: provider records kept
/// locally and swapped with directly connected peers.

pub mod exchange;
pub mod storage;

pub use exchange::ProviderExchange;
pub use storage::{ProviderStore, StorageError, StorageStats};

use crate::content::ContentKey;
use crate::context::{Context, Interrupted};
use crate::network::HostError;
use crate::protocol::ProviderRecord;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait RoutingEngine: Send + Sync {
    /// Populate routing state from the peers the host is connected to
    async fn bootstrap(&self, ctx: &Context) -> Result<(), EngineError>;

    /// Record this host as a provider of `key`; with `broadcast`, also tell
    /// connected peers
    async fn announce(&self, ctx: &Context, key: ContentKey, broadcast: bool)
        -> Result<(), EngineError>;

    /// Providers of `key` as they are found. The receiver ends after at most
    /// `limit` records or when the search is exhausted.
    async fn lookup_providers(
        &self,
        ctx: &Context,
        key: ContentKey,
        limit: usize,
    ) -> Result<mpsc::Receiver<ProviderRecord>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Routing engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Host is not listening; nothing to announce")]
    NotListening,

    #[error("Inbound requests are already being served")]
    AlreadyServing,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Interrupted: {0}")]
    Interrupted(Interrupted),

    #[error("Routing engine is closed")]
    Closed,
}
