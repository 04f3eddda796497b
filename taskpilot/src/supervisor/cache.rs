//! Bounded cache with entry and byte ceilings, TTL expiry and LRU eviction.
//!
//! `*_at` variants take the current instant explicitly so expiry is testable
//! without sleeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    bytes: usize,
    inserted: Instant,
    last_used: u64,
    tag: Option<String>,
}

#[derive(Debug)]
pub struct BoundedCache<V> {
    limits: CacheLimits,
    entries: HashMap<String, Entry<V>>,
    bytes: usize,
    clock: u64,
    stats: CacheStats,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            bytes: 0,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently accounted for.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.inserted) >= self.limits.ttl,
            None => {
                self.stats.misses += 1;
                return None;
            }
        };
        if expired {
            self.remove(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(key)?;
        entry.last_used = clock;
        self.stats.hits += 1;
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V, bytes: usize, tag: Option<&str>) -> bool {
        self.insert_at(key, value, bytes, tag, Instant::now())
    }

    /// Insert, evicting least recently used entries until both ceilings hold.
    ///
    /// Returns `false` (and stores nothing) when the value alone exceeds the
    /// byte ceiling.
    pub fn insert_at(
        &mut self,
        key: impl Into<String>,
        value: V,
        bytes: usize,
        tag: Option<&str>,
        now: Instant,
    ) -> bool {
        let key = key.into();
        if bytes > self.limits.max_bytes {
            debug!(key = %key, bytes, max_bytes = self.limits.max_bytes, "value larger than cache; not cached");
            self.remove(&key);
            return false;
        }
        self.remove(&key);
        self.clock += 1;
        self.bytes += bytes;
        self.entries.insert(
            key,
            Entry {
                value,
                bytes,
                inserted: now,
                last_used: self.clock,
                tag: tag.map(str::to_string),
            },
        );
        while self.entries.len() > self.limits.max_entries || self.bytes > self.limits.max_bytes {
            if !self.evict_lru() {
                break;
            }
        }
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.bytes -= entry.bytes;
        Some(entry.value)
    }

    /// Remove every entry carrying `tag`. Returns how many were removed.
    pub fn remove_tagged(&mut self, tag: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.tag.as_deref() == Some(tag))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let ttl = self.limits.ttl;
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.inserted) >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        self.stats.expirations += keys.len() as u64;
        keys.len()
    }

    /// Drop everything. Returns how many entries were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.bytes = 0;
        removed
    }

    fn evict_lru(&mut self) -> bool {
        let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())
        else {
            return false;
        };
        debug!(key = %key, "evicting least recently used cache entry");
        self.remove(&key);
        self.stats.evictions += 1;
        true
    }
}
