/// Bootstrap connection coordination
///
/// Dials every configured bootstrap peer concurrently and settles as soon as
/// the outcome is known: enough peers connected, too many failed to ever get
/// there, or the caller's context ended.

use crate::context::{Context, Interrupted};
use crate::identity::PeerId;
use crate::network::{HostError, Network};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tordht_common::PeerEndpoint;
use tracing::{debug, info, warn};

/// Something that can open a link to a bootstrap peer
#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn dial_peer(&self, ctx: &Context, peer: &PeerEndpoint) -> Result<(), HostError>;
}

#[async_trait]
impl PeerDialer for Network {
    async fn dial_peer(&self, ctx: &Context, peer: &PeerEndpoint) -> Result<(), HostError> {
        let peer_id: PeerId = peer
            .peer_id()
            .parse()
            .map_err(|_| HostError::InvalidPeerId(peer.peer_id().to_string()))?;
        let service = peer.service().ok_or(HostError::NoAddress(peer_id))?;

        self.add_address(peer_id, self.codec().encode(service)).await;
        self.connect(ctx, &peer_id).await
    }
}

/// One bootstrap peer that could not be reached
#[derive(Debug)]
pub struct PeerFailure {
    pub peer: PeerEndpoint,
    pub error: HostError,
}

impl fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.peer, self.error)
    }
}

fn list_failures(failures: &[PeerFailure]) -> String {
    if failures.is_empty() {
        return "no peer failed".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Bootstrap errors
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("could not reach {required} bootstrap peers ({})", list_failures(.failures))]
    Unreachable {
        required: usize,
        failures: Vec<PeerFailure>,
    },

    #[error("bootstrap stopped, {reason} ({})", list_failures(.failures))]
    Interrupted {
        reason: Interrupted,
        failures: Vec<PeerFailure>,
    },
}

impl BootstrapError {
    pub fn failures(&self) -> &[PeerFailure] {
        match self {
            Self::Unreachable { failures, .. } | Self::Interrupted { failures, .. } => failures,
        }
    }
}

/// Peers that had connected when bootstrap succeeded
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub connected: Vec<PeerEndpoint>,
    pub failures: Vec<PeerFailure>,
}

pub struct BootstrapCoordinator {
    dialer: Arc<dyn PeerDialer>,
    stagger: Duration,
}

impl BootstrapCoordinator {
    pub fn new(dialer: Arc<dyn PeerDialer>, stagger: Duration) -> Self {
        Self { dialer, stagger }
    }

    /// Connect to at least `min_required` of `peers`, or all of them if fewer
    /// are given.
    ///
    /// Dials still running when enough peers have connected are left to
    /// finish on their own. On failure or interruption they are cancelled.
    pub async fn connect(
        &self,
        ctx: &Context,
        peers: &[PeerEndpoint],
        min_required: usize,
    ) -> Result<BootstrapReport, BootstrapError> {
        let total = peers.len();
        let required = min_required.min(total);
        if required == 0 {
            debug!("No bootstrap peers required");
            return Ok(BootstrapReport::default());
        }

        info!("Connecting to {} of {} bootstrap peers", required, total);

        let attempt = ctx.child();
        let (tx, mut rx) = mpsc::channel(total);
        for (index, peer) in peers.iter().cloned().enumerate() {
            let dialer = self.dialer.clone();
            let attempt = attempt.clone();
            let tx = tx.clone();
            let delay = self.stagger * index as u32;

            tokio::spawn(async move {
                let outcome = async {
                    if !delay.is_zero() {
                        attempt
                            .run(tokio::time::sleep(delay))
                            .await
                            .map_err(HostError::Interrupted)?;
                    }
                    dialer.dial_peer(&attempt, &peer).await
                }
                .await;
                // The coordinator stops listening once it has a verdict
                let _ = tx.send((peer, outcome)).await;
            });
        }
        drop(tx);

        let mut report = BootstrapReport::default();
        loop {
            let next = tokio::select! {
                biased;
                reason = ctx.done() => {
                    attempt.cancel();
                    warn!("Bootstrap interrupted: {}", reason);
                    return Err(BootstrapError::Interrupted {
                        reason,
                        failures: report.failures,
                    });
                }
                next = rx.recv() => next,
            };

            let Some((peer, outcome)) = next else {
                // Every dial reported without reaching a verdict; the counts
                // make this unreachable, but fail closed.
                attempt.cancel();
                return Err(BootstrapError::Unreachable {
                    required,
                    failures: report.failures,
                });
            };

            match outcome {
                Ok(()) => {
                    debug!("Connected to bootstrap peer {}", peer);
                    report.connected.push(peer);
                    if report.connected.len() >= required {
                        info!(
                            "Bootstrap complete: {} connected, {} failed",
                            report.connected.len(),
                            report.failures.len()
                        );
                        return Ok(report);
                    }
                }
                Err(error) => {
                    warn!("Bootstrap peer {} failed: {}", peer, error);
                    report.failures.push(PeerFailure { peer, error });
                    if report.failures.len() > total - required {
                        attempt.cancel();
                        return Err(BootstrapError::Unreachable {
                            required,
                            failures: report.failures,
                        });
                    }
                }
            }
        }
    }
}
