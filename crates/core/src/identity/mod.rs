mod identity;
mod keypair;
mod peer_id;

pub use identity::Identity;
pub use keypair::{KeyPair, KeyPairError, PublicKey};
pub use peer_id::{PeerId, PeerIdError};
