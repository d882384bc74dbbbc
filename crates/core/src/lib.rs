pub mod address;
pub mod bootstrap;
pub mod content;
pub mod context;
pub mod host;
pub mod identity;
pub mod network;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod transport;

pub use identity::{Identity, KeyPair, KeyPairError, PeerId, PeerIdError, PublicKey};

// Re-export the host facade
pub use host::{DhtHost, LookupError, ProvideError, ProviderSet, StartError, UndecodableProvider};

pub use address::{AddressCodec, Multiaddr, Protocol, ProtocolRegistry};
pub use bootstrap::{BootstrapCoordinator, BootstrapError, BootstrapReport, PeerDialer, PeerFailure};
pub use content::{ContentKey, ContentKeyError};
pub use context::{Context, Interrupted};
pub use network::{HostError, Network};
pub use routing::{EngineError, ProviderExchange, ProviderStore, RoutingEngine};

// Re-export session and transport types
pub use session::{
    AnonListener, AnonSession, ListenOptions, MemoryNetwork, MemorySession, SessionError,
    TorSession,
};
pub use transport::{DialError, OnionTransport, Transport, TransportError, UpgradeError, Upgrader};
