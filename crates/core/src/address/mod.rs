/// Address handling
///
/// - Multi-segment addresses and the protocol registry that validates them
/// - The onion address codec (compact and DNS forms)

pub mod codec;
pub mod multiaddr;

pub use codec::AddressCodec;
pub use multiaddr::{Multiaddr, Protocol, ProtocolRegistry, RegistryError, Segment};
