/// Network host
///
/// Owns the transport, the known addresses of other peers and one live
/// [`PeerLink`] per connected peer. Requests from peers are delivered on a
/// single queue for the routing engine to serve.

pub mod address_book;
pub mod link;

pub use address_book::AddressBook;
pub use link::{InboundRequest, LinkError, PeerLink};

use crate::address::{AddressCodec, Multiaddr};
use crate::context::{Context, Interrupted};
use crate::identity::{Identity, PeerId};
use crate::protocol::{PeerRecord, Request, Response};
use crate::transport::{DialError, SecureConn, Transport, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Queued inbound requests before links start waiting on the server
const INBOUND_QUEUE: usize = 256;

/// Network host errors
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Listen failed: {0}")]
    Listen(#[from] TransportError),

    #[error("Dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("No dialable address for peer {0}")]
    NoAddress(PeerId),

    #[error("Not connected to peer {0}")]
    NotConnected(PeerId),

    #[error("Request failed: {0}")]
    Link(#[from] LinkError),

    #[error("Interrupted: {0}")]
    Interrupted(Interrupted),

    #[error("Network host is closed")]
    Closed,
}

pub struct Network {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    codec: AddressCodec,
    address_book: AddressBook,
    links: RwLock<HashMap<PeerId, Arc<PeerLink>>>,
    /// Extra links to already-linked peers; serve inbound requests only
    standby: Mutex<Vec<Arc<PeerLink>>>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    inbound_tx: mpsc::Sender<InboundRequest>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundRequest>>>,
    request_timeout: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Network {
    pub fn new(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        codec: AddressCodec,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        Arc::new(Self {
            identity,
            transport,
            codec,
            address_book: AddressBook::new(),
            links: RwLock::new(HashMap::new()),
            standby: Mutex::new(Vec::new()),
            listen_addrs: RwLock::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            request_timeout,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn codec(&self) -> &AddressCodec {
        &self.codec
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start accepting peers on `addr`; returns the address peers dial
    pub async fn listen(self: &Arc<Self>, addr: &Multiaddr) -> Result<Multiaddr, HostError> {
        if self.is_closed() {
            return Err(HostError::Closed);
        }

        let mut listener = self.transport.listen(addr).await?;
        let local = listener.local_addr().clone();
        self.listen_addrs.write().await.push(local.clone());
        info!("Listening on {}", local);

        let network = self.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = network.shutdown.cancelled() => break,
                    conn = listener.accept() => match conn {
                        Some(conn) => {
                            debug!(peer = %conn.remote_peer().short_hex(), "Accepted peer");
                            network.attach(conn).await;
                        }
                        None => break,
                    },
                }
            }
            listener.close().await;
        });

        Ok(local)
    }

    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().await.clone()
    }

    /// Our own record as handed to other peers
    pub async fn local_record(&self) -> PeerRecord {
        let addresses = self
            .listen_addrs
            .read()
            .await
            .iter()
            .map(|addr| addr.to_string())
            .collect();
        PeerRecord::new(self.local_peer_id(), addresses)
    }

    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) {
        if peer != self.local_peer_id() {
            self.address_book.add(peer, addr).await;
        }
    }

    /// Learn a peer from a record received over the wire. Addresses that do
    /// not parse are ignored; returns how many were usable.
    pub async fn learn(&self, record: &PeerRecord) -> usize {
        if record.peer_id == self.local_peer_id() {
            return 0;
        }
        let registry = self.codec.registry();
        let addrs: Vec<Multiaddr> = record
            .addresses
            .iter()
            .filter_map(|text| registry.parse(text).ok())
            .collect();
        let usable = addrs.len();
        self.address_book.add_all(record.peer_id, addrs).await;
        usable
    }

    /// Records of peers we could introduce to `requester`
    pub async fn known_peers(&self, limit: usize, requester: &PeerId) -> Vec<PeerRecord> {
        self.address_book
            .snapshot(limit, &[*requester, self.local_peer_id()])
            .await
            .into_iter()
            .map(|(peer, addrs)| {
                PeerRecord::new(peer, addrs.iter().map(|a| a.to_string()).collect())
            })
            .collect()
    }

    /// Make sure a link to `peer` is open, dialing a known address if needed
    pub async fn connect(&self, ctx: &Context, peer: &PeerId) -> Result<(), HostError> {
        if self.is_closed() {
            return Err(HostError::Closed);
        }
        if self.link(peer).await.is_some() {
            return Ok(());
        }

        let addr = self
            .address_book
            .addresses(peer)
            .await
            .into_iter()
            .find(|addr| self.transport.can_dial(addr))
            .ok_or(HostError::NoAddress(*peer))?;

        debug!(peer = %peer.short_hex(), "Dialing {}", addr);
        let conn = self.transport.dial(ctx, &addr, Some(peer)).await?;
        self.attach(conn).await;
        Ok(())
    }

    /// Send `request` over the open link to `peer`
    pub async fn request(
        &self,
        ctx: &Context,
        peer: &PeerId,
        request: Request,
    ) -> Result<Response, HostError> {
        let link = self
            .link(peer)
            .await
            .ok_or(HostError::NotConnected(*peer))?;
        let response = ctx
            .run(link.request(request, self.request_timeout))
            .await
            .map_err(HostError::Interrupted)??;
        Ok(response)
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.links
            .read()
            .await
            .values()
            .filter(|link| !link.is_closed())
            .map(|link| link.peer())
            .collect()
    }

    /// The queue of requests sent to us; can be taken once
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<InboundRequest>> {
        self.inbound_rx.lock().await.take()
    }

    async fn link(&self, peer: &PeerId) -> Option<Arc<PeerLink>> {
        self.links
            .read()
            .await
            .get(peer)
            .filter(|link| !link.is_closed())
            .cloned()
    }

    /// Register a fresh link unless an open one already exists. A link that
    /// loses the race goes on standby and still serves the requests its peer
    /// sends on it until either side closes.
    async fn attach(&self, conn: SecureConn) -> Arc<PeerLink> {
        let link = PeerLink::spawn(conn, self.inbound_tx.clone());
        if self.is_closed() {
            link.close().await;
            return link;
        }

        let mut links = self.links.write().await;
        match links.get(&link.peer()) {
            Some(existing) if !existing.is_closed() => {
                debug!(peer = %link.peer().short_hex(), "Keeping duplicate link on standby");
                let mut standby = self.standby.lock().await;
                standby.retain(|l| !l.is_closed());
                standby.push(link.clone());
            }
            _ => {
                links.insert(link.peer(), link.clone());
            }
        }
        link
    }

    /// Stop listening and close every link
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.tasks.close();

        let mut links: Vec<_> = self.links.write().await.drain().map(|(_, l)| l).collect();
        links.extend(self.standby.lock().await.drain(..));
        for link in links {
            link.close().await;
        }
        self.tasks.wait().await;
        info!("Network host closed");
    }
}
