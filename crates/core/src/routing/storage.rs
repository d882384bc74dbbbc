/// Provider record storage
///
/// Keeps, per content key, the peers that announced they provide it. Records
/// expire after a TTL and each key holds a bounded number of providers.

use crate::content::ContentKey;
use crate::identity::PeerId;
use crate::protocol::ProviderRecord;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tordht_common::dht::{MAX_PROVIDERS_PER_KEY, PROVIDER_TTL_SECS};

/// Stored provider with metadata
#[derive(Debug, Clone)]
struct StoredProvider {
    record: ProviderRecord,
    stored_at: Instant,
}

/// Provider storage implementation
#[derive(Debug)]
pub struct ProviderStore {
    providers: HashMap<ContentKey, Vec<StoredProvider>>,

    /// Maximum number of keys to store
    max_keys: usize,

    ttl: Duration,
}

impl ProviderStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            providers: HashMap::new(),
            max_keys,
            ttl: Duration::from_secs(PROVIDER_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Store a provider record
    ///
    /// A provider already known for the key is refreshed in place. When the
    /// key is full, the oldest record makes room.
    pub fn add(&mut self, key: ContentKey, record: ProviderRecord) -> Result<(), StorageError> {
        if !self.providers.contains_key(&key) && self.providers.len() >= self.max_keys {
            return Err(StorageError::StorageFull);
        }

        let stored = StoredProvider {
            record,
            stored_at: Instant::now(),
        };
        let records = self.providers.entry(key).or_default();

        if let Some(existing) = records
            .iter_mut()
            .find(|p| p.record.peer_id == stored.record.peer_id)
        {
            *existing = stored;
        } else {
            if records.len() >= MAX_PROVIDERS_PER_KEY {
                if let Some((idx, _)) = records
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| p.stored_at)
                {
                    records.remove(idx);
                }
            }
            records.push(stored);
        }

        Ok(())
    }

    /// Live providers of `key`, at most `limit`
    pub fn get(&self, key: &ContentKey, limit: usize) -> Vec<ProviderRecord> {
        let now = Instant::now();
        self.providers
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|p| !self.is_expired(p, now))
                    .take(limit)
                    .map(|p| p.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_provider(&mut self, key: &ContentKey, peer: &PeerId) -> bool {
        let Some(records) = self.providers.get_mut(key) else {
            return false;
        };
        let before = records.len();
        records.retain(|p| p.record.peer_id != *peer);
        let removed = records.len() != before;
        if records.is_empty() {
            self.providers.remove(key);
        }
        removed
    }

    /// Remove expired records
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut removed_count = 0;

        for records in self.providers.values_mut() {
            let before = records.len();
            records.retain(|p| now.duration_since(p.stored_at) <= ttl);
            removed_count += before - records.len();
        }

        self.providers.retain(|_, v| !v.is_empty());

        removed_count
    }

    fn is_expired(&self, provider: &StoredProvider, now: Instant) -> bool {
        now.duration_since(provider.stored_at) > self.ttl
    }

    pub fn key_count(&self) -> usize {
        self.providers.len()
    }

    pub fn record_count(&self) -> usize {
        self.providers.values().map(|v| v.len()).sum()
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            total_keys: self.key_count(),
            total_records: self.record_count(),
            capacity: self.max_keys,
        }
    }
}

/// Storage error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Provider storage is full")]
    StorageFull,
}

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub total_keys: usize,
    pub total_records: usize,
    pub capacity: usize,
}
