use crate::error::ConfigError;
use crate::types::PeerEndpoint;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire and transport constants
pub mod protocol {
    /// Version of the peer wire protocol
    pub const VERSION: u32 = 1;

    /// Maximum frame size on an upgraded connection (1 MB)
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

    /// Time allowed for the security handshake on a fresh connection
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

    /// Time allowed for a single request/response exchange with a peer
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;

    /// Time allowed for publishing a new onion service
    pub const LISTEN_TIMEOUT_SECS: u64 = 60;

    /// Pause between launching consecutive bootstrap dials
    pub const DIAL_STAGGER_MILLIS: u64 = 100;

    /// Default Tor control port
    pub const TOR_CONTROL_PORT: u16 = 9051;

    /// Default Tor SOCKS port
    pub const TOR_SOCKS_PORT: u16 = 9050;
}

/// Provider record constants
pub mod dht {
    /// Minimum bootstrap peers that must connect (or all, if fewer are given)
    pub const MIN_BOOTSTRAP_PEERS: usize = 2;

    /// Maximum provider records kept for a single key
    pub const MAX_PROVIDERS_PER_KEY: usize = 20;

    /// Maximum number of keys kept in the provider store
    pub const MAX_KEYS: usize = 10_000;

    /// Provider record lifetime (24 hours)
    pub const PROVIDER_TTL_SECS: u64 = 24 * 60 * 60;

    /// Peers returned for a single FindPeers request
    pub const MAX_PEERS_PER_RESPONSE: usize = 20;

    /// Addresses remembered per peer; the oldest gives way to a new one
    pub const MAX_ADDRESSES_PER_PEER: usize = 8;

    /// Peers learned from other peers that the address book keeps
    pub const MAX_LEARNED_PEERS: usize = 1024;
}

/// Which textual encoding the address codec speaks.
///
/// Peers must agree on this: it decides the decode grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFormat {
    /// `/onion/<id>:<port>`
    Onion,
    /// `/dns4/<id>.onion/tcp/<port>`
    #[default]
    Dns,
}

/// How to authenticate to the Tor control port
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ControlAuth {
    #[default]
    None,
    Password { password: String },
    Cookie { path: PathBuf },
}

/// Connection settings for an already-running Tor daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub control_addr: SocketAddr,
    pub socks_addr: SocketAddr,
    pub auth: ControlAuth,
    /// Wait for the onion descriptor upload before reporting a listener ready
    pub wait_for_publish: bool,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([127, 0, 0, 1], protocol::TOR_CONTROL_PORT)),
            socks_addr: SocketAddr::from(([127, 0, 0, 1], protocol::TOR_SOCKS_PORT)),
            auth: ControlAuth::None,
            wait_for_publish: true,
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Do not publish an onion service; only dial out
    pub client_only: bool,

    /// Peers to connect to before bootstrapping the routing engine
    pub bootstrap_peers: Vec<PeerEndpoint>,

    /// How many bootstrap peers must connect
    pub min_peers: usize,

    /// Also accept plain TCP/IP addresses (still carried by the session)
    pub mixed_mode: bool,

    pub address_format: AddressFormat,

    pub listen_timeout_secs: u64,

    pub dial_stagger_ms: u64,

    pub request_timeout_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            client_only: false,
            bootstrap_peers: Vec::new(),
            min_peers: dht::MIN_BOOTSTRAP_PEERS,
            mixed_mode: false,
            address_format: AddressFormat::default(),
            listen_timeout_secs: protocol::LISTEN_TIMEOUT_SECS,
            dial_stagger_ms: protocol::DIAL_STAGGER_MILLIS,
            request_timeout_secs: protocol::REQUEST_TIMEOUT_SECS,
        }
    }
}

impl DhtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_only(mut self) -> Self {
        self.client_only = true;
        self
    }

    pub fn with_bootstrap_peers(mut self, peers: Vec<PeerEndpoint>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn with_min_peers(mut self, min_peers: usize) -> Self {
        self.min_peers = min_peers;
        self
    }

    pub fn with_address_format(mut self, format: AddressFormat) -> Self {
        self.address_format = format;
        self
    }

    pub fn with_dial_stagger(mut self, stagger: Duration) -> Self {
        self.dial_stagger_ms = stagger.as_millis() as u64;
        self
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout_secs)
    }

    pub fn dial_stagger(&self) -> Duration {
        Duration::from_millis(self.dial_stagger_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_timeout_secs == 0 {
            return Err(ConfigError::invalid("listen_timeout_secs", "must be positive"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("request_timeout_secs", "must be positive"));
        }
        if let Some(peer) = self.bootstrap_peers.iter().find(|p| !p.is_listening()) {
            return Err(ConfigError::invalid(
                "bootstrap_peers",
                format!("{} has no onion service to dial", peer),
            ));
        }
        Ok(())
    }
}

/// Daemon configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP API listen address for `serve`
    pub api_addr: SocketAddr,
    pub tor: TorConfig,
    pub dht: DhtConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], 9150)),
            tor: TorConfig::default(),
            dht: DhtConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.dht.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}
