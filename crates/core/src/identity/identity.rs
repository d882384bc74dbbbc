use super::{KeyPair, PeerId, PublicKey};
use std::fmt;

/// A peer's keypair together with the id derived from it
#[derive(Clone)]
pub struct Identity {
    keypair: KeyPair,
    peer_id: PeerId,
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_keypair(KeyPair::generate())
    }

    pub fn from_keypair(keypair: KeyPair) -> Self {
        let peer_id = PeerId::from_public_key(&keypair.public_key());
        Self { keypair, peer_id }
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.keypair.sign(message)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}
