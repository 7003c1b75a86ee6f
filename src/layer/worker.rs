//! Background worker layer.
//!
//! Stands in for the execution context that outlives individual page
//! sessions: a resident concurrent store that keeps serving entries past
//! their TTL within an offline grace window. Reaping is an explicit
//! `sweep()` maintenance call, mirroring how the context wakes up to do
//! housekeeping rather than expiring inline.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use time::OffsetDateTime;

use crate::error::LayerError;
use crate::key::KeyPattern;
use crate::layer::{CacheLayer, LayerCounters, LayerName, LayerStats};
use crate::value::CacheEntry;

const METRIC_STALE: &str = "lemma_cache_worker_stale_total";

pub struct WorkerLayer {
    entries: DashMap<String, CacheEntry>,
    /// How long an expired entry may still be served (offline support).
    grace: Duration,
    counters: LayerCounters,
}

impl WorkerLayer {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            grace,
            counters: LayerCounters::default(),
        }
    }

    /// Drop entries expired beyond the grace window. Returns the reap count.
    pub fn sweep(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !matches!(entry.expired_for(now), Some(age) if age > self.grace));
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheLayer for WorkerLayer {
    fn name(&self) -> LayerName {
        LayerName::Worker
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, LayerError> {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();

        let mut hit = None;
        let mut beyond_grace = false;
        if let Some(mut entry) = self.entries.get_mut(key) {
            match entry.expired_for(now) {
                Some(age) if age > self.grace => beyond_grace = true,
                Some(_) => {
                    // Stale but within grace: serve it anyway so offline
                    // clients keep working.
                    counter!(METRIC_STALE).increment(1);
                    entry.touch(now);
                    hit = Some(entry.clone());
                }
                None => {
                    entry.touch(now);
                    hit = Some(entry.clone());
                }
            }
        }
        if beyond_grace {
            self.entries.remove(key);
        }

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
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, LayerError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        Ok(before - self.entries.len())
    }

    async fn clear(&self) -> Result<(), LayerError> {
        self.entries.clear();
        Ok(())
    }

    fn stats(&self) -> LayerStats {
        let mut size_bytes = 0;
        let mut touched = 0;
        for entry in self.entries.iter() {
            size_bytes += entry.size_bytes;
            if entry.access_count > 0 {
                touched += 1;
            }
        }
        LayerStats {
            name: LayerName::Worker,
            entries: self.entries.len() as u64,
            size_bytes,
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            touched_entries: touched,
            avg_latency_ms: self.counters.avg_latency_ms(),
        }
    }
}
