/// Transport adapter over an anonymity session
///
/// Makes one [`AnonSession`] look like an ordinary dial/listen transport:
/// - onion addresses are decoded by the [`AddressCodec`] and dialed through the session
/// - in mixed mode, direct `/ip4|ip6|dns4|dns6/<host>/tcp/<port>` addresses
///   are accepted too, and still travel over the session
/// - `/onionListen` publishes a fresh v3 onion service
///
/// The adapter does no cryptography; that is the upgrader's job.

use super::connection::{RawConnection, RawListener};
use super::upgrader::{upgrade_listener, UpgradedListener, Upgrader};
use super::{DialError, SecureConn, Transport, TransportError};
use crate::address::{AddressCodec, Multiaddr, Protocol, ProtocolRegistry};
use crate::context::Context;
use crate::identity::PeerId;
use crate::session::{AnonSession, ListenOptions};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tordht_common::{parse_port, AddressFormat};
use tracing::{debug, info};

/// Where a dialable address leads
#[derive(Debug, Clone, PartialEq, Eq)]
enum DialTarget {
    /// `("tcp4", "<id>.onion:<port>")`
    Onion(String),
    /// `("tcp", "<host>:<port>")`
    Direct(String),
}

pub struct OnionTransport {
    session: Arc<dyn AnonSession>,
    upgrader: Arc<dyn Upgrader>,
    codec: AddressCodec,
    mixed_mode: bool,
    listen_timeout: Duration,
}

impl OnionTransport {
    pub fn new(
        session: Arc<dyn AnonSession>,
        upgrader: Arc<dyn Upgrader>,
        registry: Arc<ProtocolRegistry>,
        format: AddressFormat,
    ) -> Self {
        Self {
            session,
            upgrader,
            codec: AddressCodec::new(format, registry),
            mixed_mode: false,
            listen_timeout: Duration::from_secs(tordht_common::protocol::LISTEN_TIMEOUT_SECS),
        }
    }

    /// Also dial plain TCP/IP and DNS addresses
    pub fn with_mixed_mode(mut self, mixed_mode: bool) -> Self {
        self.mixed_mode = mixed_mode;
        self
    }

    /// Bound on publishing a new onion service, independent of any caller context
    pub fn with_listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = timeout;
        self
    }

    pub fn codec(&self) -> &AddressCodec {
        &self.codec
    }

    fn target(&self, addr: &Multiaddr) -> Result<DialTarget, DialError> {
        match self.codec.decode(addr) {
            Ok(service) => Ok(DialTarget::Onion(service.host_port())),
            Err(malformed) => {
                if self.mixed_mode {
                    if let Some(direct) = direct_target(addr) {
                        return Ok(DialTarget::Direct(direct));
                    }
                }
                if AddressCodec::is_listen_addr(addr) {
                    return Err(DialError::Unsupported(addr.to_string()));
                }
                Err(DialError::Malformed(malformed))
            }
        }
    }
}

/// `host:port` for a plain `/<ip or dns>/<host>/tcp/<port>` address
fn direct_target(addr: &Multiaddr) -> Option<String> {
    let [host, port] = addr.segments() else {
        return None;
    };
    if port.protocol != Protocol::TCP {
        return None;
    }
    let port = port.value.as_deref().and_then(parse_port)?;
    let value = host.value.as_deref()?;
    let protocol = host.protocol;
    if protocol == Protocol::IP6 {
        Some(format!("[{}]:{}", value, port))
    } else if [Protocol::IP4, Protocol::DNS4, Protocol::DNS6].contains(&protocol) {
        Some(format!("{}:{}", value, port))
    } else {
        None
    }
}

#[async_trait]
impl Transport for OnionTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.target(addr).is_ok()
    }

    async fn dial(
        &self,
        ctx: &Context,
        addr: &Multiaddr,
        expected: Option<&PeerId>,
    ) -> Result<SecureConn, DialError> {
        let (network, target) = match self.target(addr)? {
            DialTarget::Onion(target) => ("tcp4", target),
            DialTarget::Direct(target) => ("tcp", target),
        };
        debug!(addr = %addr, network, "dialing");

        let stream = ctx
            .run(self.session.dial(ctx, network, &target))
            .await
            .map_err(DialError::Interrupted)??;

        let raw = RawConnection::new(stream, Multiaddr::empty(), addr.clone());
        let conn = ctx
            .run(self.upgrader.upgrade_outbound(raw, expected))
            .await
            .map_err(DialError::Interrupted)??;

        debug!(addr = %addr, peer = %conn.remote_peer().short_hex(), "dial upgraded");
        Ok(conn)
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<UpgradedListener, TransportError> {
        if !AddressCodec::is_listen_addr(addr) {
            return Err(TransportError::UnsupportedListenAddress(addr.to_string()));
        }

        let ctx = Context::with_timeout(self.listen_timeout);
        let options = ListenOptions {
            version3: true,
            remote_ports: Vec::new(),
            wait_for_publish: true,
        };
        let listener = self
            .session
            .listen(&ctx, options)
            .await
            .map_err(TransportError::ListenFailure)?;

        let local = self.codec.encode(listener.service());
        info!(addr = %local, "Listening on onion service");

        Ok(upgrade_listener(
            self.upgrader.clone(),
            RawListener::new(listener, local),
        ))
    }

    fn protocols(&self) -> Vec<Protocol> {
        vec![Protocol::TCP, Protocol::ONION, Protocol::ONION_LISTEN]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::session::{MemoryNetwork, SessionError};
    use crate::transport::IdentityUpgrader;

    fn transport(network: &MemoryNetwork, identity: Arc<Identity>) -> OnionTransport {
        OnionTransport::new(
            Arc::new(network.session()),
            Arc::new(IdentityUpgrader::new(identity)),
            Arc::new(ProtocolRegistry::standard()),
            AddressFormat::Dns,
        )
    }

    fn parse(text: &str) -> Multiaddr {
        ProtocolRegistry::standard().parse(text).unwrap()
    }

    #[test]
    fn test_protocols() {
        let network = MemoryNetwork::new();
        let codes: Vec<u32> = transport(&network, Arc::new(Identity::generate()))
            .protocols()
            .iter()
            .map(|p| p.code)
            .collect();
        assert_eq!(codes, vec![6, 444, 0x55]);
    }

    #[test]
    fn test_can_dial() {
        let network = MemoryNetwork::new();
        let strict = transport(&network, Arc::new(Identity::generate()));
        let onion = parse("/dns4/abcdef.onion/tcp/4001");
        let direct = parse("/ip4/127.0.0.1/tcp/4001");

        assert!(strict.can_dial(&onion));
        assert!(!strict.can_dial(&direct));
        assert!(!strict.can_dial(&AddressCodec::listen_addr()));

        let mixed = transport(&network, Arc::new(Identity::generate())).with_mixed_mode(true);
        assert!(mixed.can_dial(&onion));
        assert!(mixed.can_dial(&direct));
        assert!(mixed.can_dial(&parse("/ip6/::1/tcp/80")));
        assert!(!mixed.can_dial(&parse("/ip4/127.0.0.1/tcp/0")));
    }

    #[test]
    fn test_direct_target_brackets_ipv6() {
        assert_eq!(
            direct_target(&parse("/ip6/::1/tcp/80")),
            Some("[::1]:80".to_string())
        );
        assert_eq!(
            direct_target(&parse("/dns4/example.com/tcp/443")),
            Some("example.com:443".to_string())
        );
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let network = MemoryNetwork::new();
        let server_identity = Arc::new(Identity::generate());
        let server_id = server_identity.peer_id();
        let server = transport(&network, server_identity);
        let client_identity = Arc::new(Identity::generate());
        let client = transport(&network, client_identity.clone());

        let mut listener = server.listen(&AddressCodec::listen_addr()).await.unwrap();
        let addr = listener.local_addr().clone();
        let text = addr.to_string();
        assert!(text.starts_with("/dns4/") && text.contains(".onion/tcp/"));

        let mut outbound = client
            .dial(&Context::background(), &addr, Some(&server_id))
            .await
            .unwrap();
        let mut inbound = listener.accept().await.unwrap();

        assert_eq!(outbound.remote_peer(), server_id);
        assert_eq!(inbound.remote_peer(), client_identity.peer_id());

        outbound.send_frame(b"ping").await.unwrap();
        assert_eq!(inbound.recv_frame().await.unwrap().unwrap(), b"ping");
        listener.close().await;
    }

    #[tokio::test]
    async fn test_listen_rejects_other_addresses() {
        let network = MemoryNetwork::new();
        let transport = transport(&network, Arc::new(Identity::generate()));
        let result = transport.listen(&parse("/ip4/0.0.0.0/tcp/4001")).await;
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedListenAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_malformed_address() {
        let network = MemoryNetwork::new();
        let transport = transport(&network, Arc::new(Identity::generate()));
        let result = transport
            .dial(&Context::background(), &parse("/onion/abcdef:80"), None)
            .await;
        assert!(matches!(result, Err(DialError::Malformed(_))));
    }

    /// Records every dial target and refuses to connect
    #[derive(Default)]
    struct RecordingSession {
        dials: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl RecordingSession {
        fn dials(&self) -> Vec<(String, String)> {
            self.dials.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnonSession for RecordingSession {
        async fn dial(
            &self,
            _ctx: &Context,
            network: &str,
            address: &str,
        ) -> Result<crate::session::BoxedStream, SessionError> {
            self.dials
                .lock()
                .unwrap()
                .push((network.to_string(), address.to_string()));
            Err(SessionError::Unreachable(address.to_string()))
        }

        async fn listen(
            &self,
            _ctx: &Context,
            _options: ListenOptions,
        ) -> Result<Box<dyn crate::session::AnonListener>, SessionError> {
            Err(SessionError::UnsupportedOptions("recording only".to_string()))
        }

        async fn close(&self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn recording_transport(session: Arc<RecordingSession>, mixed_mode: bool) -> OnionTransport {
        OnionTransport::new(
            session,
            Arc::new(IdentityUpgrader::new(Arc::new(Identity::generate()))),
            Arc::new(ProtocolRegistry::standard()),
            AddressFormat::Dns,
        )
        .with_mixed_mode(mixed_mode)
    }

    #[tokio::test]
    async fn test_dial_targets_reach_session() {
        let ctx = Context::background();
        let session = Arc::new(RecordingSession::default());
        let strict = recording_transport(session.clone(), false);

        let result = strict
            .dial(&ctx, &parse("/dns4/abcdef.onion/tcp/4001"), None)
            .await;
        assert!(matches!(
            result,
            Err(DialError::Session(SessionError::Unreachable(_)))
        ));
        let result = strict.dial(&ctx, &parse("/ip4/127.0.0.1/tcp/4001"), None).await;
        assert!(matches!(result, Err(DialError::Malformed(_))));
        assert_eq!(
            session.dials(),
            vec![("tcp4".to_string(), "abcdef.onion:4001".to_string())]
        );

        let session = Arc::new(RecordingSession::default());
        let mixed = recording_transport(session.clone(), true);
        for addr in ["/ip4/127.0.0.1/tcp/4001", "/ip6/::1/tcp/80", "/dns4/abcdef.onion/tcp/4001"] {
            let result = mixed.dial(&ctx, &parse(addr), None).await;
            assert!(matches!(result, Err(DialError::Session(_))));
        }
        assert_eq!(
            session.dials(),
            vec![
                ("tcp".to_string(), "127.0.0.1:4001".to_string()),
                ("tcp".to_string(), "[::1]:80".to_string()),
                ("tcp4".to_string(), "abcdef.onion:4001".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_dial_returns_promptly() {
        let network = MemoryNetwork::new();
        network.set_dial_latency(Duration::from_secs(3600)).await;
        let transport = transport(&network, Arc::new(Identity::generate()));

        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = transport
            .dial(&ctx, &parse("/dns4/abcdef.onion/tcp/4001"), None)
            .await;
        assert!(matches!(result, Err(DialError::Interrupted(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
