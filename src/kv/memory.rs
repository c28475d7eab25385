//! In-memory store backend (the `mock` scheme).
//!
//! Backed by a DashMap for concurrent access; entries may carry a TTL and
//! expire lazily on access. All data is lost when the process exits.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{KvBackend, KvPair, WriteOptions};

#[derive(Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    is_dir: bool,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: Vec<u8>, is_dir: bool, ttl: Option<Duration>) -> Self {
        Self {
            value,
            is_dir,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// In-memory, non-persistent store backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: DashMap<String, MemoryEntry>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, directories included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<KvPair>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut pairs = Vec::new();
        let mut expired = Vec::new();

        for entry in &self.data {
            let key = entry.key();
            if !key.starts_with(&prefix) {
                continue;
            }
            if entry.value().is_expired() {
                expired.push(key.clone());
                continue;
            }
            if !entry.value().is_dir {
                pairs.push(KvPair {
                    key: key.clone(),
                    value: entry.value().value.clone(),
                });
            }
        }

        for key in expired {
            self.data.remove(&key);
        }

        Ok(pairs)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<KvPair>> {
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(key);
                return Ok(None);
            }
            return Ok(Some(KvPair {
                key: key.to_string(),
                value: entry.value.clone(),
            }));
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        opts: Option<&WriteOptions>,
    ) -> anyhow::Result<()> {
        let (is_dir, ttl) = opts.map_or((false, None), |o| (o.is_dir, o.ttl));
        self.data
            .insert(key.to_string(), MemoryEntry::new(value.to_vec(), is_dir, ttl));
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(key);
                return Ok(false);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_tree(&self, prefix: &str) -> anyhow::Result<()> {
        let subtree = format!("{}/", prefix.trim_end_matches('/'));
        self.data
            .retain(|key, _| key != prefix && !key.starts_with(&subtree));
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> anyhow::Result<()> {
        self.data
            .entry(path.to_string())
            .or_insert_with(|| MemoryEntry::new(Vec::new(), true, None));
        Ok(())
    }
}
