/// In-process anonymity network
///
/// Services get random 56-character base32 ids like real v3 onion services,
/// and dials are delivered over in-memory duplex pipes. Dial latency and
/// unreachable services can be injected to exercise timeouts and failures.

use super::{
    check_network, split_target, AnonListener, AnonSession, BoxedStream, ListenOptions,
    SessionError,
};
use crate::context::Context;
use async_trait::async_trait;
use rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tordht_common::OnionService;
use tracing::debug;

/// Buffer size of each in-memory pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pending inbound streams per service
const ACCEPT_BACKLOG: usize = 32;

#[derive(Debug, Default)]
struct Registry {
    /// `<id>.onion:<port>` -> inbound queue of the listening service
    services: RwLock<HashMap<String, mpsc::Sender<DuplexStream>>>,
    unreachable: RwLock<HashSet<String>>,
    latency: RwLock<Duration>,
}

/// A simulated anonymity network shared by any number of sessions
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Registry>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session attached to this network
    pub fn session(&self) -> MemorySession {
        MemorySession {
            registry: self.registry.clone(),
            published: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Delay applied to every dial before it connects
    pub async fn set_dial_latency(&self, latency: Duration) {
        *self.registry.latency.write().await = latency;
    }

    /// Make dials to a service id fail as if its circuit could not be built
    pub async fn set_unreachable(&self, service_id: &str, unreachable: bool) {
        let mut set = self.registry.unreachable.write().await;
        if unreachable {
            set.insert(service_id.to_string());
        } else {
            set.remove(service_id);
        }
    }

    /// Number of services currently published
    pub async fn service_count(&self) -> usize {
        self.registry.services.read().await.len()
    }
}

/// A session on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemorySession {
    registry: Arc<Registry>,
    published: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

fn random_service_id() -> String {
    // 35 bytes encode to exactly 56 base32 characters
    let mut bytes = [0u8; 35];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase()
}

#[async_trait]
impl AnonSession for MemorySession {
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<BoxedStream, SessionError> {
        self.ensure_open()?;
        check_network(network)?;
        let (host, port) = split_target(address)?;

        let latency = *self.registry.latency.read().await;
        if !latency.is_zero() {
            ctx.run(tokio::time::sleep(latency)).await?;
        }

        let service_id = host.strip_suffix(".onion").unwrap_or(host);
        if self.registry.unreachable.read().await.contains(service_id) {
            return Err(SessionError::Unreachable(address.to_string()));
        }

        let key = format!("{}:{}", host, port);
        let inbound = self
            .registry
            .services
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| SessionError::Unreachable(address.to_string()))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        ctx.run(inbound.send(remote))
            .await?
            .map_err(|_| SessionError::Unreachable(address.to_string()))?;

        debug!(target = %address, "memory dial connected");
        Ok(Box::new(local))
    }

    async fn listen(
        &self,
        ctx: &Context,
        options: ListenOptions,
    ) -> Result<Box<dyn AnonListener>, SessionError> {
        self.ensure_open()?;
        if !options.version3 {
            return Err(SessionError::UnsupportedOptions(
                "only version 3 services are supported".to_string(),
            ));
        }
        if let Some(reason) = ctx.interrupted() {
            return Err(reason.into());
        }

        let port = match options.remote_ports.first() {
            Some(port) => *port,
            None => rand::thread_rng().gen_range(1024..=u16::MAX),
        };
        let service = OnionService::new(random_service_id(), port);
        let key = service.host_port();

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.registry.services.write().await.insert(key.clone(), tx);
        self.published.lock().await.push(key.clone());

        debug!(service = %service, "memory service published");
        Ok(Box::new(MemoryListener {
            service,
            key,
            incoming: rx,
            registry: self.registry.clone(),
        }))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::Release);
        let published = std::mem::take(&mut *self.published.lock().await);
        let mut services = self.registry.services.write().await;
        for key in published {
            services.remove(&key);
        }
        Ok(())
    }
}

struct MemoryListener {
    service: OnionService,
    key: String,
    incoming: mpsc::Receiver<DuplexStream>,
    registry: Arc<Registry>,
}

#[async_trait]
impl AnonListener for MemoryListener {
    fn service(&self) -> &OnionService {
        &self.service
    }

    async fn accept(&mut self) -> Result<BoxedStream, SessionError> {
        match self.incoming.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(SessionError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.registry.services.write().await.remove(&self.key);
        self.incoming.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_published_service() {
        let network = MemoryNetwork::new();
        let server = network.session();
        let client = network.session();
        let ctx = Context::background();

        let mut listener = server.listen(&ctx, ListenOptions::default()).await.unwrap();
        assert_eq!(listener.service().id.len(), 56);

        let target = listener.service().host_port();
        let accept = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = client.dial(&ctx, "tcp4", &target).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_fixed_remote_port() {
        let network = MemoryNetwork::new();
        let session = network.session();
        let options = ListenOptions {
            remote_ports: vec![4001],
            ..ListenOptions::default()
        };
        let listener = session.listen(&Context::background(), options).await.unwrap();
        assert_eq!(listener.service().port, 4001);
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable_services() {
        let network = MemoryNetwork::new();
        let server = network.session();
        let client = network.session();
        let ctx = Context::background();

        let listener = server.listen(&ctx, ListenOptions::default()).await.unwrap();
        let service = listener.service().clone();

        network.set_unreachable(&service.id, true).await;
        assert!(matches!(
            client.dial(&ctx, "tcp4", &service.host_port()).await,
            Err(SessionError::Unreachable(_))
        ));

        assert!(matches!(
            client.dial(&ctx, "tcp4", "nothere.onion:80").await,
            Err(SessionError::Unreachable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_latency_respects_context() {
        let network = MemoryNetwork::new();
        network.set_dial_latency(Duration::from_secs(30)).await;
        let client = network.session();

        let ctx = Context::with_timeout(Duration::from_secs(1));
        let result = client.dial(&ctx, "tcp4", "abc.onion:80").await;
        assert!(matches!(result, Err(SessionError::Interrupted(_))));
    }

    #[tokio::test]
    async fn test_close_withdraws_services() {
        let network = MemoryNetwork::new();
        let session = network.session();
        let ctx = Context::background();

        let _listener = session.listen(&ctx, ListenOptions::default()).await.unwrap();
        assert_eq!(network.service_count().await, 1);

        session.close().await.unwrap();
        assert_eq!(network.service_count().await, 0);
        assert!(matches!(
            session.listen(&ctx, ListenOptions::default()).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_v2_rejected() {
        let session = MemoryNetwork::new().session();
        let options = ListenOptions {
            version3: false,
            ..ListenOptions::default()
        };
        assert!(matches!(
            session.listen(&Context::background(), options).await,
            Err(SessionError::UnsupportedOptions(_))
        ));
    }
}
