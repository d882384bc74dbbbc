/// Content-provider host
///
/// Wires an anonymity session into a listening, bootstrapped peer host and
/// exposes the two operations applications need: announce that we provide an
/// identifier, and find who provides one.

use crate::address::{AddressCodec, ProtocolRegistry};
use crate::bootstrap::{BootstrapCoordinator, BootstrapError};
use crate::content::ContentKey;
use crate::context::{Context, Interrupted};
use crate::identity::{Identity, KeyPair, PeerId};
use crate::network::{HostError, Network};
use crate::protocol::ProviderRecord;
use crate::routing::{EngineError, ProviderExchange, RoutingEngine};
use crate::session::AnonSession;
use crate::transport::{IdentityUpgrader, OnionTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tordht_common::{ConfigError, DhtConfig, MalformedAddress, PeerEndpoint};
use tracing::{debug, info, warn};

/// Host start-up errors
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to listen: {0}")]
    Listen(#[from] HostError),

    #[error("Listen address is not an onion service: {0}")]
    ListenAddress(#[from] MalformedAddress),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Routing engine failed: {0}")]
    Engine(#[from] EngineError),
}

/// Announcing a content key failed
#[derive(Debug, thiserror::Error)]
#[error("failed to provide {key}: {source}")]
pub struct ProvideError {
    pub key: ContentKey,
    pub source: EngineError,
}

/// Looking up providers failed
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("failed to find providers of {key}: {source}")]
    Engine { key: ContentKey, source: EngineError },

    #[error("lookup of {key} stopped: {reason}")]
    Interrupted { key: ContentKey, reason: Interrupted },
}

impl LookupError {
    pub fn key(&self) -> &ContentKey {
        match self {
            Self::Engine { key, .. } | Self::Interrupted { key, .. } => key,
        }
    }
}

/// A provider record whose address could not be turned into an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableProvider {
    pub peer_id: PeerId,
    pub reason: MalformedAddress,
}

/// Result of a provider lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSet {
    pub endpoints: Vec<PeerEndpoint>,
    /// Records skipped because their address did not decode
    pub undecodable: Vec<UndecodableProvider>,
}

impl ProviderSet {
    /// Some providers were found but could not be used
    pub fn is_partial(&self) -> bool {
        !self.undecodable.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }
}

/// Drain a lookup stream into endpoints, stopping at `max` usable ones
pub(crate) async fn collect_providers(
    ctx: &Context,
    codec: &AddressCodec,
    key: ContentKey,
    mut records: mpsc::Receiver<ProviderRecord>,
    max: usize,
) -> Result<ProviderSet, LookupError> {
    let mut set = ProviderSet::default();

    while set.endpoints.len() < max {
        let record = tokio::select! {
            biased;
            reason = ctx.done() => return Err(LookupError::Interrupted { key, reason }),
            record = records.recv() => record,
        };
        let Some(record) = record else { break };

        let decoded = match record.addresses.first() {
            Some(addr) => codec.endpoint(&record.peer_id.to_hex(), addr),
            None => Err(MalformedAddress::new("", "provider record has no addresses")),
        };
        match decoded {
            Ok(endpoint) => set.endpoints.push(endpoint),
            Err(reason) => {
                warn!(peer = %record.peer_id.short_hex(), %key, "Skipping provider: {}", reason);
                set.undecodable.push(UndecodableProvider {
                    peer_id: record.peer_id,
                    reason,
                });
            }
        }
    }

    Ok(set)
}

pub struct DhtHost {
    network: Arc<Network>,
    engine: Arc<dyn RoutingEngine>,
    endpoint: Option<PeerEndpoint>,
}

impl DhtHost {
    /// Build the host on `session`, listen unless client-only, connect to the
    /// bootstrap peers and bootstrap routing.
    ///
    /// The session stays owned by the caller; [`DhtHost::close`] leaves it open.
    pub async fn start(
        ctx: &Context,
        session: Arc<dyn AnonSession>,
        keypair: KeyPair,
        config: DhtConfig,
    ) -> Result<Self, StartError> {
        config.validate()?;

        let identity = Arc::new(Identity::from_keypair(keypair));
        let registry = Arc::new(ProtocolRegistry::standard());
        let codec = AddressCodec::new(config.address_format, registry.clone());
        let upgrader = Arc::new(IdentityUpgrader::new(identity.clone()));
        let transport = OnionTransport::new(session, upgrader, registry, config.address_format)
            .with_mixed_mode(config.mixed_mode)
            .with_listen_timeout(config.listen_timeout());

        let network = Network::new(
            identity.clone(),
            Arc::new(transport),
            codec.clone(),
            config.request_timeout(),
        );
        info!(peer = %identity.peer_id().short_hex(), "Starting host");

        match Self::assemble(ctx, network.clone(), &codec, &config).await {
            Ok(host) => Ok(host),
            Err(e) => {
                network.close().await;
                Err(e)
            }
        }
    }

    async fn assemble(
        ctx: &Context,
        network: Arc<Network>,
        codec: &AddressCodec,
        config: &DhtConfig,
    ) -> Result<Self, StartError> {
        let endpoint = if config.client_only {
            debug!("Client-only host, not listening");
            None
        } else {
            let addr = network.listen(&AddressCodec::listen_addr()).await?;
            let service = codec.decode(&addr)?;
            Some(PeerEndpoint::listening(network.local_peer_id().to_hex(), service))
        };

        let engine: Arc<dyn RoutingEngine> = ProviderExchange::start(network.clone()).await?;

        let coordinator = BootstrapCoordinator::new(network.clone(), config.dial_stagger());
        let ready = async {
            let report = coordinator
                .connect(ctx, &config.bootstrap_peers, config.min_peers)
                .await?;
            engine.bootstrap(ctx).await?;
            Ok::<_, StartError>(report)
        }
        .await;
        let connected = match ready {
            Ok(report) => report,
            Err(e) => {
                if let Err(close) = engine.close().await {
                    warn!("Error closing routing engine: {}", close);
                }
                return Err(e);
            }
        };

        info!(
            "Host ready with {} bootstrap peers{}",
            connected.connected.len(),
            endpoint
                .as_ref()
                .map(|e| format!(", reachable at {}", e))
                .unwrap_or_default()
        );

        Ok(Self {
            network,
            engine,
            endpoint,
        })
    }

    /// Our own endpoint, or `None` for a client-only host
    pub fn peer_info(&self) -> Option<&PeerEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.network.local_peer_id()
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Announce that this host provides `id`. Repeating it is harmless.
    pub async fn provide(
        &self,
        ctx: &Context,
        id: impl AsRef<[u8]>,
    ) -> Result<ContentKey, ProvideError> {
        let key = ContentKey::from_id(id);
        debug!(%key, "Providing");
        self.engine
            .announce(ctx, key, true)
            .await
            .map_err(|source| ProvideError { key, source })?;
        Ok(key)
    }

    /// Find up to `max` providers of `id`
    pub async fn find_providers(
        &self,
        ctx: &Context,
        id: impl AsRef<[u8]>,
        max: usize,
    ) -> Result<ProviderSet, LookupError> {
        let key = ContentKey::from_id(id);
        if max == 0 {
            return Ok(ProviderSet::default());
        }

        let records = self
            .engine
            .lookup_providers(ctx, key, max)
            .await
            .map_err(|source| LookupError::Engine { key, source })?;
        let set = collect_providers(ctx, self.network.codec(), key, records, max).await?;

        debug!(
            %key,
            found = set.len(),
            skipped = set.undecodable.len(),
            "Lookup finished"
        );
        Ok(set)
    }

    pub async fn close(&self) {
        if let Err(e) = self.engine.close().await {
            warn!("Error closing routing engine: {}", e);
        }
        self.network.close().await;
    }
}
