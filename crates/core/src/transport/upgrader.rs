/// Connection upgrade: peer authentication and channel encryption
///
/// Handshake (both sides send, then read):
/// 1. `Hello { version, public_key, ephemeral, signature }` where the
///    signature covers the x25519 ephemeral key
/// 2. Verify the signature and derive the remote peer id from its key
/// 3. Outbound only: the peer id must be the one we meant to dial
/// 4. Per-direction keys from BLAKE3 `derive_key` over the shared secret and
///    both ephemerals

use super::connection::{RawConnection, RawListener};
use super::secure::SecureConn;
use crate::address::Multiaddr;
use crate::identity::{Identity, PeerId, PublicKey};
use async_trait::async_trait;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tordht_common::protocol::{HANDSHAKE_TIMEOUT_SECS, VERSION};
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

/// Largest plaintext handshake message accepted
const MAX_HELLO_SIZE: usize = 16 * 1024;

/// Domain separation for the ephemeral-key signature
const HELLO_CONTEXT: &[u8] = b"tordht handshake v1";

const KDF_INITIATOR: &str = "tordht 2024-01 secure channel initiator to responder";
const KDF_RESPONDER: &str = "tordht 2024-01 secure channel responder to initiator";

/// Upgraded inbound connections waiting to be accepted
const UPGRADED_BACKLOG: usize = 16;

/// Upgrade errors
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("Handshake IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Invalid handshake: {0}")]
    Invalid(String),

    #[error("Protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("Handshake signature verification failed")]
    BadSignature,

    #[error("Peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
}

/// Turns raw session streams into authenticated channels
#[async_trait]
pub trait Upgrader: Send + Sync {
    /// Upgrade a dialed connection; fails if the peer is not `expected`
    async fn upgrade_outbound(
        &self,
        conn: RawConnection,
        expected: Option<&PeerId>,
    ) -> Result<SecureConn, UpgradeError>;

    async fn upgrade_inbound(&self, conn: RawConnection) -> Result<SecureConn, UpgradeError>;
}

/// Wrap a raw listener so every accepted connection is upgraded inbound.
/// Upgrades run concurrently; failed handshakes are logged and dropped.
pub fn upgrade_listener(upgrader: Arc<dyn Upgrader>, mut raw: RawListener) -> UpgradedListener {
    let local = raw.local_addr().clone();
    let (tx, rx) = mpsc::channel(UPGRADED_BACKLOG);
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();

    let task = tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = raw.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("Listener stopped accepting: {}", e);
                        break;
                    }
                },
            };

            let upgrader = upgrader.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match upgrader.upgrade_inbound(conn).await {
                    Ok(secure) => {
                        let _ = tx.send(secure).await;
                    }
                    Err(e) => warn!("Inbound upgrade failed: {}", e),
                }
            });
        }
        if let Err(e) = raw.close().await {
            warn!("Failed to close listener: {}", e);
        }
    });

    UpgradedListener {
        local,
        incoming: rx,
        shutdown,
        task: Some(task),
    }
}

/// A listener yielding upgraded inbound connections
pub struct UpgradedListener {
    local: Multiaddr,
    incoming: mpsc::Receiver<SecureConn>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl UpgradedListener {
    pub fn local_addr(&self) -> &Multiaddr {
        &self.local
    }

    /// Next upgraded connection, `None` once the listener is closed
    pub async fn accept(&mut self) -> Option<SecureConn> {
        self.incoming.recv().await
    }

    /// Stop accepting and withdraw the underlying service
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.incoming.close();
    }
}

impl Drop for UpgradedListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: u32,
    public_key: PublicKey,
    ephemeral: [u8; 32],
    /// Hex-encoded ed25519 signature over `HELLO_CONTEXT || ephemeral`
    signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Signed-challenge handshake over the local ed25519 identity
pub struct IdentityUpgrader {
    identity: Arc<Identity>,
    timeout: Duration,
}

impl IdentityUpgrader {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn handshake(
        &self,
        mut conn: RawConnection,
        role: Role,
        expected: Option<&PeerId>,
    ) -> Result<SecureConn, UpgradeError> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let ours = X25519PublicKey::from(&secret);

        let hello = Hello {
            version: VERSION,
            public_key: self.identity.public_key(),
            ephemeral: *ours.as_bytes(),
            signature: hex::encode(self.identity.sign(&signed_payload(ours.as_bytes()))),
        };
        let encoded = serde_json::to_vec(&hello)
            .map_err(|e| UpgradeError::Invalid(format!("encode hello: {}", e)))?;
        write_hello(&mut conn, &encoded).await?;

        let theirs: Hello = serde_json::from_slice(&read_hello(&mut conn).await?)
            .map_err(|e| UpgradeError::Invalid(format!("decode hello: {}", e)))?;

        if theirs.version != VERSION {
            return Err(UpgradeError::VersionMismatch {
                ours: VERSION,
                theirs: theirs.version,
            });
        }
        let signature: [u8; 64] = hex::decode(&theirs.signature)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| UpgradeError::Invalid("signature must be 64 bytes".to_string()))?;
        if !theirs
            .public_key
            .verify(&signed_payload(&theirs.ephemeral), &signature)
        {
            return Err(UpgradeError::BadSignature);
        }

        let remote = PeerId::from_public_key(&theirs.public_key);
        if let Some(expected) = expected {
            if *expected != remote {
                return Err(UpgradeError::PeerIdMismatch {
                    expected: *expected,
                    actual: remote,
                });
            }
        }
        if remote == self.identity.peer_id() {
            return Err(UpgradeError::Invalid("connected to ourselves".to_string()));
        }

        let shared = secret.diffie_hellman(&X25519PublicKey::from(theirs.ephemeral));
        if !shared.was_contributory() {
            return Err(UpgradeError::Invalid("non-contributory key exchange".to_string()));
        }

        let (initiator_eph, responder_eph) = match role {
            Role::Initiator => (*ours.as_bytes(), theirs.ephemeral),
            Role::Responder => (theirs.ephemeral, *ours.as_bytes()),
        };
        let mut material = Vec::with_capacity(96);
        material.extend_from_slice(shared.as_bytes());
        material.extend_from_slice(&initiator_eph);
        material.extend_from_slice(&responder_eph);

        let to_responder = blake3::derive_key(KDF_INITIATOR, &material);
        let to_initiator = blake3::derive_key(KDF_RESPONDER, &material);
        let (send_key, recv_key) = match role {
            Role::Initiator => (to_responder, to_initiator),
            Role::Responder => (to_initiator, to_responder),
        };

        debug!(peer = %remote.short_hex(), ?role, "handshake complete");
        Ok(SecureConn::new(conn, theirs.public_key, send_key, recv_key))
    }
}

#[async_trait]
impl Upgrader for IdentityUpgrader {
    async fn upgrade_outbound(
        &self,
        conn: RawConnection,
        expected: Option<&PeerId>,
    ) -> Result<SecureConn, UpgradeError> {
        tokio::time::timeout(self.timeout, self.handshake(conn, Role::Initiator, expected))
            .await
            .map_err(|_| UpgradeError::Timeout)?
    }

    async fn upgrade_inbound(&self, conn: RawConnection) -> Result<SecureConn, UpgradeError> {
        tokio::time::timeout(self.timeout, self.handshake(conn, Role::Responder, None))
            .await
            .map_err(|_| UpgradeError::Timeout)?
    }
}

fn signed_payload(ephemeral: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HELLO_CONTEXT.len() + 32);
    payload.extend_from_slice(HELLO_CONTEXT);
    payload.extend_from_slice(ephemeral);
    payload
}

async fn write_hello(conn: &mut RawConnection, data: &[u8]) -> Result<(), UpgradeError> {
    conn.write_all(&(data.len() as u32).to_le_bytes()).await?;
    conn.write_all(data).await?;
    conn.flush().await?;
    Ok(())
}

async fn read_hello(conn: &mut RawConnection) -> Result<Vec<u8>, UpgradeError> {
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_HELLO_SIZE {
        return Err(UpgradeError::Invalid(format!("hello too large: {} bytes", len)));
    }
    let mut data = vec![0u8; len];
    conn.read_exact(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawConnection, RawConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            RawConnection::new(Box::new(a), Multiaddr::empty(), Multiaddr::empty()),
            RawConnection::new(Box::new(b), Multiaddr::empty(), Multiaddr::empty()),
        )
    }

    #[tokio::test]
    async fn test_handshake_and_frames() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let bob_id = bob.peer_id();
        let (left, right) = pipe();

        let server = tokio::spawn({
            let bob = bob.clone();
            async move { IdentityUpgrader::new(bob).upgrade_inbound(right).await }
        });
        let mut client = IdentityUpgrader::new(alice.clone())
            .upgrade_outbound(left, Some(&bob_id))
            .await
            .unwrap();
        let mut server = server.await.unwrap().unwrap();

        assert_eq!(client.remote_peer(), bob_id);
        assert_eq!(server.remote_peer(), alice.peer_id());

        client.send_frame(b"hello bob").await.unwrap();
        server.send_frame(b"hello alice").await.unwrap();
        assert_eq!(server.recv_frame().await.unwrap().unwrap(), b"hello bob");
        assert_eq!(client.recv_frame().await.unwrap().unwrap(), b"hello alice");
    }

    #[tokio::test]
    async fn test_unexpected_identity_rejected() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let someone_else = Identity::generate().peer_id();
        let (left, right) = pipe();

        tokio::spawn(async move {
            let _ = IdentityUpgrader::new(bob).upgrade_inbound(right).await;
        });
        let result = IdentityUpgrader::new(alice)
            .upgrade_outbound(left, Some(&someone_else))
            .await;

        assert!(matches!(
            result,
            Err(UpgradeError::PeerIdMismatch { expected, .. }) if expected == someone_else
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let alice = Arc::new(Identity::generate());
        let (left, _right) = pipe();

        let result = IdentityUpgrader::new(alice)
            .with_timeout(Duration::from_secs(10))
            .upgrade_outbound(left, None)
            .await;
        assert!(matches!(result, Err(UpgradeError::Timeout)));
    }

    #[tokio::test]
    async fn test_forged_signature_rejected() {
        let alice = Arc::new(Identity::generate());
        let (left, mut right) = pipe();

        let forger = tokio::spawn(async move {
            let impostor = Identity::generate();
            let hello = Hello {
                version: VERSION,
                public_key: impostor.public_key(),
                ephemeral: [9u8; 32],
                signature: hex::encode([0u8; 64]),
            };
            let _ = read_hello(&mut right).await;
            write_hello(&mut right, &serde_json::to_vec(&hello).unwrap())
                .await
                .unwrap();
            right
        });

        let result = IdentityUpgrader::new(alice).upgrade_outbound(left, None).await;
        assert!(matches!(result, Err(UpgradeError::BadSignature)));
        drop(forger.await);
    }
}
