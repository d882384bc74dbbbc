use super::{EngineError, ProviderStore, RoutingEngine};
use crate::content::ContentKey;
use crate::context::Context;
use crate::identity::PeerId;
use crate::network::{HostError, InboundRequest, Network};
use crate::protocol::{ProviderRecord, Request, Response};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tordht_common::dht::{MAX_KEYS, MAX_PEERS_PER_RESPONSE, MAX_PROVIDERS_PER_KEY};
use tracing::{debug, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// One-hop provider record exchange between directly connected peers
pub struct ProviderExchange {
    network: Arc<Network>,
    store: Arc<RwLock<ProviderStore>>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderExchange {
    /// Take over the host's inbound requests and start serving them
    pub async fn start(network: Arc<Network>) -> Result<Arc<Self>, EngineError> {
        Self::with_store(network, ProviderStore::new(MAX_KEYS)).await
    }

    pub async fn with_store(
        network: Arc<Network>,
        store: ProviderStore,
    ) -> Result<Arc<Self>, EngineError> {
        let inbound = network
            .take_inbound()
            .await
            .ok_or(EngineError::AlreadyServing)?;

        let exchange = Arc::new(Self {
            network,
            store: Arc::new(RwLock::new(store)),
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
        });

        let handle = tokio::spawn(serve(
            exchange.network.clone(),
            exchange.store.clone(),
            inbound,
            exchange.shutdown.clone(),
        ));
        *exchange.server.lock().await = Some(handle);

        Ok(exchange)
    }

    pub fn store(&self) -> &Arc<RwLock<ProviderStore>> {
        &self.store
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

async fn serve(
    network: Arc<Network>,
    store: Arc<RwLock<ProviderStore>>,
    mut inbound: mpsc::Receiver<InboundRequest>,
    shutdown: CancellationToken,
) {
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
    cleanup.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = cleanup.tick() => {
                let removed = store.write().await.cleanup_expired();
                if removed > 0 {
                    debug!("Expired {} provider records", removed);
                }
            }
            request = inbound.recv() => {
                let Some(request) = request else { break };
                let response = handle(&network, &store, request.peer, request.request.clone()).await;
                request.respond(response);
            }
        }
    }
}

async fn handle(
    network: &Network,
    store: &RwLock<ProviderStore>,
    from: PeerId,
    request: Request,
) -> Response {
    match request {
        Request::Ping { nonce } => Response::Pong { nonce },

        Request::AddProvider { key, provider } => {
            if provider.peer_id != from {
                warn!(
                    peer = %from.short_hex(),
                    "Rejected provider record for another peer {}",
                    provider.peer_id.short_hex()
                );
                return Response::error("provider record must name the sender");
            }
            network.learn(&provider).await;
            match store.write().await.add(key, provider) {
                Ok(()) => {
                    debug!(peer = %from.short_hex(), %key, "Stored provider record");
                    Response::Ack
                }
                Err(e) => Response::error(e.to_string()),
            }
        }

        Request::GetProviders { key, limit } => {
            let providers = store.read().await.get(&key, limit.min(MAX_PROVIDERS_PER_KEY));
            Response::Providers { providers }
        }

        Request::FindPeers { limit } => {
            let peers = network
                .known_peers(limit.min(MAX_PEERS_PER_RESPONSE), &from)
                .await;
            Response::Peers { peers }
        }
    }
}

#[async_trait]
impl RoutingEngine for ProviderExchange {
    async fn bootstrap(&self, ctx: &Context) -> Result<(), EngineError> {
        self.check_open()?;

        let peers = self.network.connected_peers().await;
        if peers.is_empty() {
            debug!("No connected peers to bootstrap from");
            return Ok(());
        }

        let mut learned = 0;
        for peer in peers {
            let request = Request::FindPeers {
                limit: MAX_PEERS_PER_RESPONSE,
            };
            match self.network.request(ctx, &peer, request).await {
                Ok(Response::Peers { peers: records }) => {
                    for record in &records {
                        if self.network.learn(record).await > 0 {
                            learned += 1;
                        }
                    }
                }
                Ok(other) => {
                    warn!(peer = %peer.short_hex(), "Unexpected answer to find_peers: {}", other.message_type())
                }
                Err(HostError::Interrupted(reason)) => {
                    return Err(EngineError::Interrupted(reason));
                }
                Err(e) => warn!(peer = %peer.short_hex(), "find_peers failed: {}", e),
            }
        }

        info!("Routing bootstrap learned {} peers", learned);
        Ok(())
    }

    async fn announce(
        &self,
        ctx: &Context,
        key: ContentKey,
        broadcast: bool,
    ) -> Result<(), EngineError> {
        self.check_open()?;

        let record = self.network.local_record().await;
        if record.addresses.is_empty() {
            return Err(EngineError::NotListening);
        }
        self.store.write().await.add(key, record.clone())?;

        if !broadcast {
            return Ok(());
        }

        let peers = self.network.connected_peers().await;
        let mut pushes = JoinSet::new();
        for peer in peers {
            let network = self.network.clone();
            let ctx = ctx.clone();
            let request = Request::AddProvider {
                key,
                provider: record.clone(),
            };
            pushes.spawn(async move { (peer, network.request(&ctx, &peer, request).await) });
        }

        let mut acknowledged = 0;
        while let Some(joined) = pushes.join_next().await {
            let Ok((peer, outcome)) = joined else { continue };
            match outcome {
                Ok(Response::Ack) => acknowledged += 1,
                Ok(Response::Error { message }) => {
                    warn!(peer = %peer.short_hex(), "Peer refused provider record: {}", message)
                }
                Ok(other) => {
                    warn!(peer = %peer.short_hex(), "Unexpected answer to add_provider: {}", other.message_type())
                }
                Err(e) => warn!(peer = %peer.short_hex(), "add_provider failed: {}", e),
            }
        }

        if let Some(reason) = ctx.interrupted() {
            return Err(EngineError::Interrupted(reason));
        }
        debug!(%key, "Announced to {} peers", acknowledged);
        Ok(())
    }

    async fn lookup_providers(
        &self,
        ctx: &Context,
        key: ContentKey,
        limit: usize,
    ) -> Result<mpsc::Receiver<ProviderRecord>, EngineError> {
        self.check_open()?;

        let (tx, rx) = mpsc::channel(limit.clamp(1, MAX_PROVIDERS_PER_KEY));
        if limit == 0 {
            return Ok(rx);
        }

        let local = self.store.read().await.get(&key, limit);
        let peers = self.network.connected_peers().await;
        let network = self.network.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let mut seen = HashSet::new();
            let mut sent = 0;

            for record in local {
                if seen.insert(record.peer_id) {
                    if tx.send(record).await.is_err() {
                        return;
                    }
                    sent += 1;
                    if sent >= limit {
                        return;
                    }
                }
            }

            for peer in peers {
                if ctx.interrupted().is_some() {
                    return;
                }
                let request = Request::GetProviders { key, limit };
                let providers = match network.request(&ctx, &peer, request).await {
                    Ok(Response::Providers { providers }) => providers,
                    Ok(other) => {
                        warn!(peer = %peer.short_hex(), "Unexpected answer to get_providers: {}", other.message_type());
                        continue;
                    }
                    Err(e) => {
                        warn!(peer = %peer.short_hex(), "get_providers failed: {}", e);
                        continue;
                    }
                };

                for record in providers {
                    if seen.insert(record.peer_id) {
                        if tx.send(record).await.is_err() {
                            return;
                        }
                        sent += 1;
                        if sent >= limit {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.shutdown.cancel();
        if let Some(handle) = self.server.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Provider exchange server task failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressCodec, ProtocolRegistry};
    use crate::identity::Identity;
    use crate::session::MemoryNetwork;
    use crate::transport::{IdentityUpgrader, OnionTransport};
    use tordht_common::AddressFormat;

    fn host(memory: &MemoryNetwork) -> Arc<Network> {
        let identity = Arc::new(Identity::generate());
        let registry = Arc::new(ProtocolRegistry::standard());
        let transport = OnionTransport::new(
            Arc::new(memory.session()),
            Arc::new(IdentityUpgrader::new(identity.clone())),
            registry.clone(),
            AddressFormat::Dns,
        );
        Network::new(
            identity,
            Arc::new(transport),
            AddressCodec::new(AddressFormat::Dns, registry),
            Duration::from_secs(5),
        )
    }

    async fn connect(from: &Network, to: &Network) {
        let addr = to.listen_addrs().await[0].clone();
        from.add_address(to.local_peer_id(), addr).await;
        from.connect(&Context::background(), &to.local_peer_id())
            .await
            .unwrap();
        // Let the accept loop register the link
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn collect(mut rx: mpsc::Receiver<ProviderRecord>) -> Vec<ProviderRecord> {
        let mut out = Vec::new();
        while let Some(record) = rx.recv().await {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn test_announce_and_lookup_across_peers() {
        let memory = MemoryNetwork::new();
        let a = host(&memory);
        let b = host(&memory);
        a.listen(&AddressCodec::listen_addr()).await.unwrap();

        let engine_a = ProviderExchange::start(a.clone()).await.unwrap();
        let engine_b = ProviderExchange::start(b.clone()).await.unwrap();
        assert!(matches!(
            ProviderExchange::start(a.clone()).await,
            Err(EngineError::AlreadyServing)
        ));

        connect(&b, &a).await;

        let ctx = Context::background();
        let key = ContentKey::from_id("x");
        engine_a.announce(&ctx, key, true).await.unwrap();
        engine_a.announce(&ctx, key, true).await.unwrap();

        let found = collect(engine_b.lookup_providers(&ctx, key, 10).await.unwrap()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer_id, a.local_peer_id());
        assert_eq!(found[0].addresses, a.local_record().await.addresses);

        let none = collect(
            engine_b
                .lookup_providers(&ctx, ContentKey::from_id("y"), 10)
                .await
                .unwrap(),
        )
        .await;
        assert!(none.is_empty());

        engine_a.close().await.unwrap();
        engine_b.close().await.unwrap();
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_client_only_cannot_announce() {
        let memory = MemoryNetwork::new();
        let b = host(&memory);
        let engine = ProviderExchange::start(b).await.unwrap();

        let err = engine
            .announce(&Context::background(), ContentKey::from_id("x"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotListening));
    }

    #[tokio::test]
    async fn test_add_provider_only_for_sender() {
        let memory = MemoryNetwork::new();
        let a = host(&memory);
        let b = host(&memory);
        a.listen(&AddressCodec::listen_addr()).await.unwrap();
        let engine_a = ProviderExchange::start(a.clone()).await.unwrap();
        connect(&b, &a).await;

        let ctx = Context::background();
        let key = ContentKey::from_id("x");
        let forged = ProviderRecord::new(
            Identity::generate().peer_id(),
            vec!["/dns4/fake.onion/tcp/1".to_string()],
        );
        let response = b
            .request(&ctx, &a.local_peer_id(), Request::AddProvider { key, provider: forged })
            .await
            .unwrap();
        assert!(matches!(response, Response::Error { .. }));

        let own = ProviderRecord::new(b.local_peer_id(), vec!["/onion/garbage".to_string()]);
        let response = b
            .request(&ctx, &a.local_peer_id(), Request::AddProvider { key, provider: own })
            .await
            .unwrap();
        assert_eq!(response, Response::Ack);

        assert_eq!(engine_a.store().read().await.get(&key, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_learns_peers() {
        let memory = MemoryNetwork::new();
        let a = host(&memory);
        let b = host(&memory);
        let c = host(&memory);
        a.listen(&AddressCodec::listen_addr()).await.unwrap();
        b.listen(&AddressCodec::listen_addr()).await.unwrap();

        let _engine_a = ProviderExchange::start(a.clone()).await.unwrap();
        let _engine_b = ProviderExchange::start(b.clone()).await.unwrap();
        let engine_c = ProviderExchange::start(c.clone()).await.unwrap();

        // a knows b; c only knows a
        a.add_address(b.local_peer_id(), b.listen_addrs().await[0].clone()).await;
        connect(&c, &a).await;

        engine_c.bootstrap(&Context::background()).await.unwrap();
        assert_eq!(
            c.address_book().addresses(&b.local_peer_id()).await,
            b.listen_addrs().await
        );
    }

    #[tokio::test]
    async fn test_lookup_limit() {
        let memory = MemoryNetwork::new();
        let a = host(&memory);
        let engine = ProviderExchange::start(a.clone()).await.unwrap();

        let key = ContentKey::from_id("x");
        for _ in 0..5 {
            let record = ProviderRecord::new(Identity::generate().peer_id(), vec!["/a".to_string()]);
            engine.store().write().await.add(key, record).unwrap();
        }

        let ctx = Context::background();
        assert_eq!(collect(engine.lookup_providers(&ctx, key, 3).await.unwrap()).await.len(), 3);
        assert!(collect(engine.lookup_providers(&ctx, key, 0).await.unwrap()).await.is_empty());

        engine.close().await.unwrap();
        assert!(matches!(
            engine.lookup_providers(&ctx, key, 1).await,
            Err(EngineError::Closed)
        ));
    }
}
