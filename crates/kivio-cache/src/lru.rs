//! Byte-budget LRU cache
//!
//! Values are raw response bodies; the budget counts key plus value bytes.
//! Eviction scans for the least recently used entry, which is fine at the
//! entry counts a single node holds.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct Entry {
    data: Bytes,
    last_access: AtomicU64,
}

impl Entry {
    fn size(key: &str, data: &Bytes) -> u64 {
        (key.len() + data.len()) as u64
    }
}

struct Inner {
    map: HashMap<String, Entry>,
    used_bytes: u64,
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

/// LRU cache bounded by a byte budget.
pub struct ByteCache {
    inner: RwLock<Inner>,
    budget: u64,
    clock: AtomicU64,
    stats: CacheStats,
}

impl ByteCache {
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                used_bytes: 0,
            }),
            budget,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a value, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let inner = self.inner.read();
        match inner.map.get(key) {
            Some(entry) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value, evicting LRU entries until it fits.
    ///
    /// A value larger than the whole budget is not cached at all.
    pub fn insert(&self, key: &str, data: Bytes) {
        let size = Entry::size(key, &data);
        if size > self.budget {
            return;
        }

        let clock = self.tick();
        let mut inner = self.inner.write();

        if let Some(old) = inner.map.remove(key) {
            inner.used_bytes -= Entry::size(key, &old.data);
        }

        while inner.used_bytes + size > self.budget {
            let lru = inner
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());
            match lru {
                Some(victim) => {
                    if let Some(evicted) = inner.map.remove(&victim) {
                        inner.used_bytes -= Entry::size(&victim, &evicted.data);
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }

        inner.used_bytes += size;
        inner.map.insert(
            key.to_string(),
            Entry {
                data,
                last_access: AtomicU64::new(clock),
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.inner.read().used_bytes
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Counter snapshot for the stats endpoint.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        HashMap::from([
            ("hits".to_string(), self.stats.hits.load(Ordering::Relaxed)),
            ("misses".to_string(), self.stats.misses.load(Ordering::Relaxed)),
            (
                "evictions".to_string(),
                self.stats.evictions.load(Ordering::Relaxed),
            ),
            ("entries".to_string(), self.len() as u64),
            ("used_bytes".to_string(), self.used_bytes()),
        ])
    }
}
