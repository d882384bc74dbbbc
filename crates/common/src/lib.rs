pub mod config;
pub mod error;
pub mod types;

pub use config::{
    dht, protocol, AddressFormat, ControlAuth, DaemonConfig, DhtConfig, TorConfig,
};
pub use error::{ConfigError, MalformedAddress};
pub use types::{parse_port, OnionService, PeerEndpoint};
