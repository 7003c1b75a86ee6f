//! In-process memory layer.
//!
//! The fastest layer: an LRU map sized by configuration. Expired entries
//! are dropped lazily on read.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use crate::error::LayerError;
use crate::key::KeyPattern;
use crate::layer::{CacheLayer, LayerCounters, LayerName, LayerStats};
use crate::lock::rw_write;
use crate::value::CacheEntry;

const SOURCE: &str = "layer::memory";
const METRIC_EVICT: &str = "lemma_cache_memory_evict_total";

pub struct MemoryLayer {
    entries: RwLock<LruCache<String, CacheEntry>>,
    counters: LayerCounters,
}

impl MemoryLayer {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            counters: LayerCounters::default(),
        }
    }
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn name(&self) -> LayerName {
        LayerName::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, LayerError> {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();

        // LRU reads reorder the recency list, so even lookups take the
        // write lock.
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let mut expired = false;
        let hit = match entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                expired = true;
                None
            }
            Some(entry) => {
                entry.touch(now);
                Some(entry.clone())
            }
            None => None,
        };
        if expired {
            entries.pop(key);
        }
        drop(entries);

        match hit {
            Some(entry) => {
                self.counters.record_hit(started.elapsed());
                Ok(Some(entry))
            }
            None => {
                self.counters.record_miss(started.elapsed());
                Ok(None)
            }
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), LayerError> {
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        let displaced = entries.push(entry.key.clone(), entry);
        // push returns the displaced pair; same-key replacement is not an
        // eviction.
        if let Some((displaced_key, _)) = displaced
            && !entries.contains(&displaced_key)
        {
            counter!(METRIC_EVICT).increment(1);
        }
        Ok(())
    }

    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, LayerError> {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate");
        if pattern.is_all() {
            let removed = entries.len();
            entries.clear();
            return Ok(removed);
        }

        let matched: Vec<String> = entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matched {
            entries.pop(key);
        }
        Ok(matched.len())
    }

    async fn clear(&self) -> Result<(), LayerError> {
        rw_write(&self.entries, SOURCE, "clear").clear();
        Ok(())
    }

    fn stats(&self) -> LayerStats {
        let entries = rw_write(&self.entries, SOURCE, "stats");
        let mut size_bytes = 0;
        let mut touched = 0;
        for (_, entry) in entries.iter() {
            size_bytes += entry.size_bytes;
            if entry.access_count > 0 {
                touched += 1;
            }
        }
        LayerStats {
            name: LayerName::Memory,
            entries: entries.len() as u64,
            size_bytes,
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            touched_entries: touched,
            avg_latency_ms: self.counters.avg_latency_ms(),
        }
    }
}
