//! Storage layer abstraction.
//!
//! Every backend implements the same contract so the coordinator never
//! depends on backend specifics. A miss is `Ok(None)`; errors are reserved
//! for backend faults and are degraded by the caller, never propagated to
//! application code.

mod edge;
mod memory;
mod persistent;
mod worker;

pub use edge::EdgeLayer;
pub use memory::MemoryLayer;
pub use persistent::PersistentLayer;
pub use worker::WorkerLayer;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::LayerError;
use crate::key::KeyPattern;
use crate::value::CacheEntry;

/// Identity of a storage layer in the hierarchy.
///
/// Priority is intrinsic: lower means faster and preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerName {
    /// In-process memory, priority 0.
    Memory,
    /// Local durable store, priority 1.
    Persistent,
    /// Background execution context, priority 2.
    Worker,
    /// Remote edge cache, priority 3.
    Edge,
}

impl LayerName {
    pub fn priority(&self) -> u8 {
        match self {
            Self::Memory => 0,
            Self::Persistent => 1,
            Self::Worker => 2,
            Self::Edge => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Persistent => "persistent",
            Self::Worker => "worker",
            Self::Edge => "edge",
        }
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time statistics reported by a layer.
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub name: LayerName,
    pub entries: u64,
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Entries that have been read at least once since insertion; feeds the
    /// storage-efficiency metric.
    pub touched_entries: u64,
    pub avg_latency_ms: f64,
}

impl LayerStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

/// Atomic hit/miss/latency bookkeeping shared by every layer implementation.
#[derive(Debug, Default)]
pub(crate) struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    lookup_micros: AtomicU64,
    lookups: AtomicU64,
}

impl LayerCounters {
    pub(crate) fn record_hit(&self, elapsed: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.record_lookup(elapsed);
    }

    pub(crate) fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_lookup(elapsed);
    }

    fn record_lookup(&self, elapsed: Duration) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.lookup_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub(crate) fn avg_latency_ms(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        self.lookup_micros.load(Ordering::Relaxed) as f64 / lookups as f64 / 1000.0
    }
}

/// The uniform storage contract.
///
/// `invalidate` returns the number of entries removed so the invalidation
/// engine can classify impact.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    fn name(&self) -> LayerName;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, LayerError>;

    async fn set(&self, entry: CacheEntry) -> Result<(), LayerError>;

    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, LayerError>;

    async fn clear(&self) -> Result<(), LayerError>;

    fn stats(&self) -> LayerStats;
}

/// Outcome of a fan-out invalidation across layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanoutOutcome {
    pub removed: usize,
    /// Layers where at least one entry was removed.
    pub layers_affected: usize,
    pub layer_faults: usize,
}

/// The ordered set of configured layers, shared between the coordinator and
/// the invalidation/warming engines.
pub struct LayerSet {
    layers: Vec<Arc<dyn CacheLayer>>,
}

impl LayerSet {
    /// Build a set; layers are kept sorted by ascending priority.
    pub fn new(mut layers: Vec<Arc<dyn CacheLayer>>) -> Self {
        layers.sort_by_key(|layer| layer.name().priority());
        Self { layers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CacheLayer>> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn by_name(&self, name: LayerName) -> Option<&Arc<dyn CacheLayer>> {
        self.layers.iter().find(|layer| layer.name() == name)
    }

    /// Resolve a route plan to the layers that actually exist, fastest first.
    pub fn select(&self, names: &[LayerName]) -> Vec<&Arc<dyn CacheLayer>> {
        self.layers
            .iter()
            .filter(|layer| names.contains(&layer.name()))
            .collect()
    }

    pub fn stats(&self) -> Vec<LayerStats> {
        self.layers.iter().map(|layer| layer.stats()).collect()
    }

    /// Invalidate a pattern on every layer in parallel, best-effort: a layer
    /// fault is logged and does not abort the others.
    pub async fn invalidate_all(&self, pattern: &KeyPattern) -> FanoutOutcome {
        let results = join_all(
            self.layers
                .iter()
                .map(|layer| async move { (layer.name(), layer.invalidate(pattern).await) }),
        )
        .await;

        let mut outcome = FanoutOutcome::default();
        for (name, result) in results {
            match result {
                Ok(removed) => {
                    outcome.removed += removed;
                    if removed > 0 {
                        outcome.layers_affected += 1;
                    }
                }
                Err(err) => {
                    outcome.layer_faults += 1;
                    warn!(layer = %name, error = %err, "layer invalidation failed, continuing");
                }
            }
        }
        outcome
    }

    /// Clear every layer in parallel, best-effort.
    pub async fn clear_all(&self) -> FanoutOutcome {
        let results = join_all(
            self.layers
                .iter()
                .map(|layer| async move { (layer.name(), layer.stats().entries, layer.clear().await) }),
        )
        .await;

        let mut outcome = FanoutOutcome::default();
        for (name, entries, result) in results {
            match result {
                Ok(()) => {
                    outcome.removed += entries as usize;
                    if entries > 0 {
                        outcome.layers_affected += 1;
                    }
                }
                Err(err) => {
                    outcome.layer_faults += 1;
                    warn!(layer = %name, error = %err, "layer clear failed, continuing");
                }
            }
        }
        outcome
    }
}
