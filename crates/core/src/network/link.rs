//! A live, multiplexed connection to one peer
//!
//! Both sides may issue requests over the same upgraded connection. Frames
//! carry an id; responses are matched to waiting requesters by that id, and
//! inbound requests are forwarded to whoever serves them.

use crate::address::Multiaddr;
use crate::identity::PeerId;
use crate::protocol::{Frame, Request, Response};
use crate::transport::{ChannelError, SecureConn, SecureReader, SecureWriter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// A request received from a peer, waiting for an answer
#[derive(Debug)]
pub struct InboundRequest {
    pub peer: PeerId,
    pub request: Request,
    reply: oneshot::Sender<Response>,
}

impl InboundRequest {
    pub fn respond(self, response: Response) {
        // The link may have closed meanwhile
        let _ = self.reply.send(response);
    }
}

/// Peer link errors
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct PeerLink {
    peer: PeerId,
    remote_addr: Multiaddr,
    writer: Arc<Mutex<SecureWriter>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl PeerLink {
    /// Take over an upgraded connection and start reading from it
    pub fn spawn(conn: SecureConn, inbound: mpsc::Sender<InboundRequest>) -> Arc<Self> {
        let peer = conn.remote_peer();
        let remote_addr = conn.remote_addr().clone();
        let (reader, writer) = conn.split();

        let link = Arc::new(Self {
            peer,
            remote_addr,
            writer: Arc::new(Mutex::new(writer)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            reader,
            peer,
            link.writer.clone(),
            link.pending.clone(),
            inbound,
            link.closed.clone(),
        ));

        link
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Empty for links accepted on our onion service
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn request(&self, request: Request, timeout: Duration) -> Result<Response, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        trace!(peer = %self.peer.short_hex(), id, kind = request.message_type(), "request");
        let frame = Frame::Request { id, body: request };
        if let Err(e) = write_frame(&self.writer, &frame).await {
            self.pending.lock().await.remove(&id);
            self.closed.cancel();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(LinkError::Timeout(timeout))
            }
        }
    }

    pub async fn close(&self) {
        self.closed.cancel();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(peer = %self.peer.short_hex(), "Error closing link: {}", e);
        }
    }
}

async fn write_frame(writer: &Mutex<SecureWriter>, frame: &Frame) -> Result<(), LinkError> {
    let bytes = frame.encode()?;
    writer.lock().await.send_frame(&bytes).await?;
    Ok(())
}

async fn read_loop(
    mut reader: SecureReader,
    peer: PeerId,
    writer: Arc<Mutex<SecureWriter>>,
    pending: Pending,
    inbound: mpsc::Sender<InboundRequest>,
    closed: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = closed.cancelled() => break,
            frame = reader.recv_frame() => match frame {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(peer = %peer.short_hex(), "Peer closed link");
                    break;
                }
                Err(e) => {
                    debug!(peer = %peer.short_hex(), "Link read failed: {}", e);
                    break;
                }
            },
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer.short_hex(), "Dropping undecodable frame: {}", e);
                continue;
            }
        };

        match frame {
            Frame::Response { id, body } => match pending.lock().await.remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(body);
                }
                None => trace!(peer = %peer.short_hex(), id, "late response dropped"),
            },
            Frame::Request { id, body } => {
                let (reply, answer) = oneshot::channel();
                let request = InboundRequest {
                    peer,
                    request: body,
                    reply,
                };
                if inbound.send(request).await.is_err() {
                    let frame = Frame::Response {
                        id,
                        body: Response::error("not serving requests"),
                    };
                    let _ = write_frame(&writer, &frame).await;
                    continue;
                }

                let writer = writer.clone();
                tokio::spawn(async move {
                    let body = answer
                        .await
                        .unwrap_or_else(|_| Response::error("request dropped"));
                    if let Err(e) = write_frame(&writer, &Frame::Response { id, body }).await {
                        debug!("Failed to send response: {}", e);
                    }
                });
            }
        }
    }

    closed.cancel();
    // Dropping the senders wakes every waiting requester with `Closed`
    pending.lock().await.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::transport::{IdentityUpgrader, RawConnection, Upgrader};

    async fn linked_pair() -> (
        (Arc<PeerLink>, mpsc::Receiver<InboundRequest>),
        (Arc<PeerLink>, mpsc::Receiver<InboundRequest>),
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = RawConnection::new(Box::new(a), Multiaddr::empty(), Multiaddr::empty());
        let right = RawConnection::new(Box::new(b), Multiaddr::empty(), Multiaddr::empty());

        let server = tokio::spawn(async move {
            IdentityUpgrader::new(Arc::new(Identity::generate()))
                .upgrade_inbound(right)
                .await
                .unwrap()
        });
        let client = IdentityUpgrader::new(Arc::new(Identity::generate()))
            .upgrade_outbound(left, None)
            .await
            .unwrap();
        let server = server.await.unwrap();

        let (client_tx, client_rx) = mpsc::channel(8);
        let (server_tx, server_rx) = mpsc::channel(8);
        (
            (PeerLink::spawn(client, client_tx), client_rx),
            (PeerLink::spawn(server, server_tx), server_rx),
        )
    }

    #[tokio::test]
    async fn test_request_response_both_directions() {
        let ((client, mut client_rx), (server, mut server_rx)) = linked_pair().await;

        tokio::spawn(async move {
            while let Some(req) = server_rx.recv().await {
                if let Request::Ping { nonce } = req.request {
                    req.respond(Response::Pong { nonce });
                }
            }
        });
        tokio::spawn(async move {
            while let Some(req) = client_rx.recv().await {
                req.respond(Response::Ack);
            }
        });

        let timeout = Duration::from_secs(5);
        let response = client.request(Request::Ping { nonce: 42 }, timeout).await.unwrap();
        assert_eq!(response, Response::Pong { nonce: 42 });

        let response = server
            .request(Request::FindPeers { limit: 1 }, timeout)
            .await
            .unwrap();
        assert_eq!(response, Response::Ack);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_matched() {
        let ((client, _client_rx), (_server, mut server_rx)) = linked_pair().await;

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(req) = server_rx.recv().await {
                held.push(req);
                if held.len() == 2 {
                    // Answer in reverse order
                    for req in held.drain(..).rev() {
                        let nonce = match req.request {
                            Request::Ping { nonce } => nonce,
                            _ => 0,
                        };
                        req.respond(Response::Pong { nonce });
                    }
                }
            }
        });

        let timeout = Duration::from_secs(5);
        let (first, second) = tokio::join!(
            client.request(Request::Ping { nonce: 1 }, timeout),
            client.request(Request::Ping { nonce: 2 }, timeout),
        );
        assert_eq!(first.unwrap(), Response::Pong { nonce: 1 });
        assert_eq!(second.unwrap(), Response::Pong { nonce: 2 });
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let ((client, _client_rx), (server, _server_rx)) = linked_pair().await;

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request(Request::Ping { nonce: 1 }, Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(LinkError::Closed)));
        assert!(matches!(
            client.request(Request::Ping { nonce: 2 }, Duration::from_secs(1)).await,
            Err(LinkError::Closed)
        ));
    }
}
