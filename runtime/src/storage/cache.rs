//! Plaintext read cache for the storage engine.
//!
//! Bounded by a total byte budget; eviction drops the least recently
//! accessed entries until a new insert fits.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

struct CacheEntry {
    bytes: Vec<u8>,
    last_used: Instant,
}

pub struct PlaintextCache {
    entries: HashMap<String, CacheEntry>,
    total_size: usize,
    max_size_bytes: usize,
}

impl PlaintextCache {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            total_size: 0,
            max_size_bytes,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(entry.bytes.clone())
    }

    pub fn insert(&mut self, key: &str, bytes: Vec<u8>) {
        let size = bytes.len();
        if size > self.max_size_bytes {
            debug!(key, size, "value larger than cache budget, not caching");
            return;
        }
        self.invalidate(key);
        while self.total_size + size > self.max_size_bytes && !self.entries.is_empty() {
            self.evict_oldest();
        }
        self.total_size += size;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                bytes,
                last_used: Instant::now(),
            },
        );
    }

    pub fn invalidate(&mut self, key: &str) {
        if let Some(old) = self.entries.remove(key) {
            self.total_size = self.total_size.saturating_sub(old.bytes.len());
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            debug!(key = %key, "evicting cache entry");
            self.invalidate(&key);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut cache = PlaintextCache::new(1024);
        cache.insert("a", vec![1, 2, 3]);
        assert_eq!(cache.get("a"), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn eviction_respects_the_byte_budget() {
        let mut cache = PlaintextCache::new(10);
        cache.insert("a", vec![0; 4]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert("b", vec![0; 4]);
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Touch "a" so "b" is the eviction candidate.
        cache.get("a");
        cache.insert("c", vec![0; 4]);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert!(cache.total_size() <= 10);
    }

    #[test]
    fn oversized_values_are_not_cached() {
        let mut cache = PlaintextCache::new(4);
        cache.insert("big", vec![0; 8]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn reinsert_replaces_and_accounts_size() {
        let mut cache = PlaintextCache::new(100);
        cache.insert("k", vec![0; 40]);
        cache.insert("k", vec![0; 10]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 10);
    }
}
