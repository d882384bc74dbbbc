use std::sync::Arc;
use std::time::Duration;
use tordht_common::{DhtConfig, OnionService, PeerEndpoint};
use tordht_core::bootstrap::BootstrapError;
use tordht_core::host::StartError;
use tordht_core::protocol::{ProviderRecord, Request, Response};
use tordht_core::{
    ContentKey, Context, DhtHost, EngineError, Identity, Interrupted, KeyPair, MemoryNetwork,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(memory: &MemoryNetwork, config: DhtConfig) -> Result<DhtHost, StartError> {
    DhtHost::start(
        &Context::background(),
        Arc::new(memory.session()),
        KeyPair::generate(),
        config,
    )
    .await
}

async fn start_provider(memory: &MemoryNetwork) -> DhtHost {
    start(memory, DhtConfig::new()).await.unwrap()
}

async fn start_client(memory: &MemoryNetwork, bootstrap: &DhtHost) -> DhtHost {
    let peer = bootstrap.peer_info().cloned().unwrap();
    let config = DhtConfig::new()
        .client_only()
        .with_bootstrap_peers(vec![peer])
        .with_min_peers(1);
    start(memory, config).await.unwrap()
}

#[tokio::test]
async fn test_client_finds_provider() {
    init_tracing();
    let memory = MemoryNetwork::new();
    let a = start_provider(&memory).await;
    let ctx = Context::background();

    let key = a.provide(&ctx, "x").await.unwrap();
    assert_eq!(key, ContentKey::from_id("x"));

    let b = start_client(&memory, &a).await;
    assert!(b.peer_info().is_none());

    let found = b.find_providers(&ctx, "x", 10).await.unwrap();
    assert!(!found.is_partial());
    assert_eq!(found.endpoints, vec![a.peer_info().cloned().unwrap()]);

    let service = found.endpoints[0].service().unwrap();
    let own = a.peer_info().unwrap().service().unwrap();
    assert_eq!(service.id, own.id);
    assert_eq!(service.port, own.port);
    assert_eq!(found.endpoints[0].peer_id(), a.local_peer_id().to_hex());

    let nothing = b.find_providers(&ctx, "y", 10).await.unwrap();
    assert!(nothing.is_empty());
    assert!(!nothing.is_partial());

    b.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_provide_is_idempotent() {
    init_tracing();
    let memory = MemoryNetwork::new();
    let a = start_provider(&memory).await;
    let ctx = Context::background();

    let first = a.provide(&ctx, "x").await.unwrap();
    let second = a.provide(&ctx, "x").await.unwrap();
    assert_eq!(first, second);

    let found = a.find_providers(&ctx, "x", 10).await.unwrap();
    assert_eq!(found.len(), 1);

    a.close().await;
}

#[tokio::test]
async fn test_client_only_cannot_provide() {
    init_tracing();
    let memory = MemoryNetwork::new();
    let a = start_provider(&memory).await;
    let b = start_client(&memory, &a).await;

    let err = b.provide(&Context::background(), "x").await.unwrap_err();
    assert_eq!(err.key, ContentKey::from_id("x"));
    assert!(matches!(err.source, EngineError::NotListening));

    b.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_undecodable_provider_is_reported() {
    init_tracing();
    let memory = MemoryNetwork::new();
    let a = start_provider(&memory).await;
    let ctx = Context::background();
    let key = a.provide(&ctx, "x").await.unwrap();

    // A second peer announces itself with an address nobody can decode
    let b = start_client(&memory, &a).await;
    let record = ProviderRecord::new(b.local_peer_id(), vec!["/onion/not-a-service".to_string()]);
    let response = b
        .network()
        .request(
            &ctx,
            &a.local_peer_id(),
            Request::AddProvider {
                key,
                provider: record,
            },
        )
        .await
        .unwrap();
    assert_eq!(response, Response::Ack);

    let c = start_client(&memory, &a).await;
    let found = c.find_providers(&ctx, "x", 10).await.unwrap();

    assert_eq!(found.endpoints, vec![a.peer_info().cloned().unwrap()]);
    assert!(found.is_partial());
    assert_eq!(found.undecodable.len(), 1);
    assert_eq!(found.undecodable[0].peer_id, b.local_peer_id());

    c.close().await;
    b.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_unreachable_bootstrap_peer() {
    init_tracing();
    let memory = MemoryNetwork::new();
    let missing = PeerEndpoint::listening(
        Identity::generate().peer_id().to_hex(),
        OnionService::new("a".repeat(56), 4001),
    );
    let config = DhtConfig::new()
        .client_only()
        .with_bootstrap_peers(vec![missing.clone()]);

    let err = start(&memory, config).await.err().unwrap();
    match err {
        StartError::Bootstrap(BootstrapError::Unreachable { required, failures }) => {
            assert_eq!(required, 1);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].peer, missing);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_bootstrap_rejects_wrong_identity() {
    init_tracing();
    let memory = MemoryNetwork::new();
    let a = start_provider(&memory).await;

    let service = a.peer_info().unwrap().service().cloned().unwrap();
    let impostor = PeerEndpoint::listening(Identity::generate().peer_id().to_hex(), service);
    let config = DhtConfig::new()
        .client_only()
        .with_bootstrap_peers(vec![impostor]);

    let err = start(&memory, config).await.err().unwrap();
    assert!(matches!(
        err,
        StartError::Bootstrap(BootstrapError::Unreachable { .. })
    ));
    assert!(err.to_string().contains("mismatch"));

    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_respects_deadline() {
    init_tracing();
    let memory = MemoryNetwork::new();
    let a = start_provider(&memory).await;
    memory.set_dial_latency(Duration::from_secs(3600)).await;

    let config = DhtConfig::new()
        .client_only()
        .with_bootstrap_peers(vec![a.peer_info().cloned().unwrap()]);
    let ctx = Context::with_timeout(Duration::from_secs(5));

    let err = DhtHost::start(&ctx, Arc::new(memory.session()), KeyPair::generate(), config)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        StartError::Bootstrap(BootstrapError::Interrupted {
            reason: Interrupted::DeadlineExceeded,
            ..
        })
    ));

    a.close().await;
}
