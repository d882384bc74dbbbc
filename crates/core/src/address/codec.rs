use super::multiaddr::{Multiaddr, Protocol, ProtocolRegistry};
use std::sync::Arc;
use tordht_common::{parse_port, AddressFormat, MalformedAddress, OnionService, PeerEndpoint};

const ONION_SUFFIX: &str = ".onion";

/// Translates between onion endpoints and multi-segment addresses.
///
/// One [`AddressFormat`] is active per codec; peers must agree on it since it
/// fixes the decode grammar.
#[derive(Debug, Clone)]
pub struct AddressCodec {
    format: AddressFormat,
    registry: Arc<ProtocolRegistry>,
}

impl AddressCodec {
    pub fn new(format: AddressFormat, registry: Arc<ProtocolRegistry>) -> Self {
        Self { format, registry }
    }

    pub fn format(&self) -> AddressFormat {
        self.format
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// The reserved "bind a fresh onion service here" pseudo-address
    pub fn listen_addr() -> Multiaddr {
        Multiaddr::empty().with_bare(Protocol::ONION_LISTEN)
    }

    pub fn is_listen_addr(addr: &Multiaddr) -> bool {
        *addr == Self::listen_addr()
    }

    pub fn encode(&self, service: &OnionService) -> Multiaddr {
        match self.format {
            AddressFormat::Onion => {
                Multiaddr::empty().with(Protocol::ONION, format!("{}:{}", service.id, service.port))
            }
            AddressFormat::Dns => Multiaddr::empty()
                .with(Protocol::DNS4, format!("{}{}", service.id, ONION_SUFFIX))
                .with(Protocol::TCP, service.port.to_string()),
        }
    }

    pub fn decode(&self, addr: &Multiaddr) -> Result<OnionService, MalformedAddress> {
        let text = || addr.to_string();
        let segments = addr.segments();

        match self.format {
            AddressFormat::Onion => {
                let [segment] = segments else {
                    return Err(MalformedAddress::new(text(), "expected a single /onion segment"));
                };
                if segment.protocol != Protocol::ONION {
                    return Err(MalformedAddress::new(text(), "not an /onion address"));
                }
                let value = segment.value.as_deref().unwrap_or_default();
                let (id, port) = value
                    .rsplit_once(':')
                    .ok_or_else(|| MalformedAddress::new(text(), "missing ':' before port"))?;
                if id.is_empty() {
                    return Err(MalformedAddress::new(text(), "empty service id"));
                }
                let port =
                    parse_port(port).ok_or_else(|| MalformedAddress::new(text(), "invalid port"))?;
                Ok(OnionService::new(id, port))
            }
            AddressFormat::Dns => {
                let [host, port] = segments else {
                    return Err(MalformedAddress::new(
                        text(),
                        "expected /dns4/<id>.onion/tcp/<port>",
                    ));
                };
                if host.protocol != Protocol::DNS4 || port.protocol != Protocol::TCP {
                    return Err(MalformedAddress::new(
                        text(),
                        "expected /dns4/<id>.onion/tcp/<port>",
                    ));
                }
                let id = host
                    .value
                    .as_deref()
                    .and_then(|h| h.strip_suffix(ONION_SUFFIX))
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| MalformedAddress::new(text(), "host is not <id>.onion"))?;
                let port = port
                    .value
                    .as_deref()
                    .and_then(parse_port)
                    .ok_or_else(|| MalformedAddress::new(text(), "invalid port"))?;
                Ok(OnionService::new(id, port))
            }
        }
    }

    pub fn encode_str(&self, service: &OnionService) -> String {
        self.encode(service).to_string()
    }

    /// Parse with the codec's registry, then decode
    pub fn decode_str(&self, text: &str) -> Result<OnionService, MalformedAddress> {
        let addr = self.registry.parse(text)?;
        self.decode(&addr)
    }

    /// Build a peer endpoint from a peer id and one of its advertised addresses
    pub fn endpoint(&self, peer_id: &str, addr: &str) -> Result<PeerEndpoint, MalformedAddress> {
        let service = self.decode_str(addr)?;
        Ok(PeerEndpoint::listening(peer_id, service))
    }

    /// The dialable address of an endpoint, if it listens
    pub fn endpoint_addr(&self, endpoint: &PeerEndpoint) -> Option<Multiaddr> {
        endpoint.service().map(|service| self.encode(service))
    }
}
