use crate::address::Multiaddr;
use crate::identity::PeerId;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tordht_common::config::dht::{MAX_ADDRESSES_PER_PEER, MAX_LEARNED_PEERS};

/// Known addresses per peer
///
/// One lock covers the whole book, so readers always see complete entries.
/// Peers added locally stay until the book is dropped. Peers learned from
/// other peers are capped and the longest-known one is forgotten first.
#[derive(Debug)]
pub struct AddressBook {
    inner: RwLock<Inner>,
    max_addresses: usize,
    max_learned: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<PeerId, Vec<Multiaddr>>,
    /// Learned peers, oldest first
    learned: VecDeque<PeerId>,
}

impl Inner {
    fn push(&mut self, peer: PeerId, addr: Multiaddr, max_addresses: usize) -> bool {
        let addrs = self.entries.entry(peer).or_default();
        if addrs.contains(&addr) {
            return false;
        }
        if addrs.len() >= max_addresses {
            addrs.remove(0);
        }
        addrs.push(addr);
        true
    }
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::with_limits(MAX_ADDRESSES_PER_PEER, MAX_LEARNED_PEERS)
    }
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_addresses: usize, max_learned: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_addresses: max_addresses.max(1),
            max_learned,
        }
    }

    /// Record a locally supplied address; returns false if it was already known
    pub async fn add(&self, peer: PeerId, addr: Multiaddr) -> bool {
        let mut inner = self.inner.write().await;
        inner.learned.retain(|p| *p != peer);
        inner.push(peer, addr, self.max_addresses)
    }

    /// Record addresses a peer told us about
    pub async fn add_all(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        let mut inner = self.inner.write().await;
        if !inner.entries.contains_key(&peer) {
            if self.max_learned == 0 {
                return;
            }
            while inner.learned.len() >= self.max_learned {
                match inner.learned.pop_front() {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.learned.push_back(peer);
        }
        for addr in addrs {
            inner.push(peer, addr, self.max_addresses);
        }
    }

    pub async fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.inner
            .read()
            .await
            .entries
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Up to `limit` peers with at least one address, skipping `exclude`
    pub async fn snapshot(&self, limit: usize, exclude: &[PeerId]) -> Vec<(PeerId, Vec<Multiaddr>)> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .filter(|(peer, addrs)| !addrs.is_empty() && !exclude.contains(peer))
            .take(limit)
            .map(|(peer, addrs)| (*peer, addrs.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ProtocolRegistry;
    use crate::identity::Identity;

    fn addr(text: &str) -> Multiaddr {
        ProtocolRegistry::standard().parse(text).unwrap()
    }

    fn onion(port: u16) -> Multiaddr {
        addr(&format!("/dns4/a.onion/tcp/{}", port))
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let book = AddressBook::new();
        let peer = Identity::generate().peer_id();

        assert!(book.add(peer, onion(1)).await);
        assert!(!book.add(peer, onion(1)).await);
        book.add_all(peer, vec![onion(1), addr("/dns4/b.onion/tcp/2")])
            .await;

        assert_eq!(book.addresses(&peer).await.len(), 2);
        assert_eq!(book.snapshot(usize::MAX, &[]).await.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_excludes() {
        let book = AddressBook::new();
        let a = Identity::generate().peer_id();
        let b = Identity::generate().peer_id();
        book.add(a, addr("/dns4/a.onion/tcp/1")).await;
        book.add(b, addr("/dns4/b.onion/tcp/1")).await;

        let snapshot = book.snapshot(10, &[a]).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, b);

        assert_eq!(book.snapshot(1, &[]).await.len(), 1);
        assert!(book.addresses(&Identity::generate().peer_id()).await.is_empty());
    }

    #[tokio::test]
    async fn test_addresses_per_peer_are_capped() {
        let book = AddressBook::with_limits(3, 10);
        let peer = Identity::generate().peer_id();

        for port in 1..=10 {
            book.add_all(peer, vec![onion(port)]).await;
        }
        book.add_all(peer, (11..=20).map(onion)).await;

        assert_eq!(
            book.addresses(&peer).await,
            vec![onion(18), onion(19), onion(20)]
        );
    }

    #[tokio::test]
    async fn test_learned_peers_are_capped() {
        let book = AddressBook::with_limits(8, 2);
        let pinned = Identity::generate().peer_id();
        book.add(pinned, onion(1)).await;

        let learned: Vec<PeerId> = (0..5).map(|_| Identity::generate().peer_id()).collect();
        for peer in &learned {
            book.add_all(*peer, vec![onion(2)]).await;
        }

        assert_eq!(book.snapshot(usize::MAX, &[]).await.len(), 3);
        assert_eq!(book.addresses(&pinned).await, vec![onion(1)]);
        assert!(book.addresses(&learned[0]).await.is_empty());
        assert_eq!(book.addresses(&learned[4]).await, vec![onion(2)]);
    }
}
