//! Cache coordinator: the engine's public API.
//!
//! Owns the routing policy and the layer set, composes the monitor,
//! invalidation, and warming engines, and guarantees the degradation
//! contract: a miss is a normal result, a layer fault is logged and
//! skipped, and no cache failure ever propagates to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::EngineError;
use crate::invalidation::{BatchRecord, InvalidationEngine};
use crate::key::KeyPattern;
use crate::layer::{
    CacheLayer, EdgeLayer, LayerName, LayerSet, LayerStats, MemoryLayer, PersistentLayer,
    WorkerLayer,
};
use crate::monitor::{Alert, MetricsSnapshot, OperationKind, PerformanceMonitor};
use crate::routing::{Operation, RoutingPolicy};
use crate::value::{CacheEntry, CacheValue};
use crate::warming::{WarmingEngine, WarmingError, WarmingSession, WarmingStatus};

const VERSION_MARKER_FILE: &str = "versions.json";

const METRIC_GET_TOTAL: &str = "lemma_cache_get_total";
const METRIC_SET_TOTAL: &str = "lemma_cache_set_total";
const METRIC_GET_MS: &str = "lemma_cache_get_ms";
const METRIC_SET_MS: &str = "lemma_cache_set_ms";
const METRIC_PROMOTIONS: &str = "lemma_cache_promotion_total";
const METRIC_LAYER_FAULTS: &str = "lemma_cache_layer_fault_total";

/// Per-call options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Explicit layer hint; overrides the routing policy.
    pub layers: Option<Vec<LayerName>>,
}

/// Per-call options for `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Explicit layer hint; overrides the routing policy.
    pub layers: Option<Vec<LayerName>>,
    /// Entry TTL; falls back to the configured default.
    pub ttl: Option<Duration>,
}

/// Result of a `get`: a miss is represented, never thrown.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub value: Option<CacheValue>,
    /// The layer that served the hit.
    pub source: Option<LayerName>,
    pub from_cache: bool,
    pub latency: Duration,
}

/// Result of a `set`: success means at least one routed layer took the
/// write. Callers retry with their own backoff on failure.
#[derive(Debug, Clone)]
pub struct SetOutcome {
    pub success: bool,
    pub layers_written: Vec<LayerName>,
    pub latency: Duration,
}

/// Aggregated view for the dashboard collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub snapshot: MetricsSnapshot,
    pub layers: Vec<LayerStats>,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
}

pub struct CacheCoordinator {
    settings: Settings,
    layers: Arc<LayerSet>,
    routing: Arc<RoutingPolicy>,
    monitor: Arc<PerformanceMonitor>,
    invalidation: Arc<InvalidationEngine>,
    warming: Arc<WarmingEngine>,
    /// Kept concretely for the maintenance sweep.
    worker: Option<Arc<WorkerLayer>>,
}

impl CacheCoordinator {
    /// Construct the full engine from settings: layers first, then the
    /// monitor, invalidation, and warming engines wired over them.
    pub async fn new(settings: Settings) -> Result<Self, EngineError> {
        let memory = Arc::new(MemoryLayer::new(settings.cache.memory_capacity));
        let persistent = match &settings.cache.persistent_dir {
            Some(dir) => PersistentLayer::open(dir).await,
            None => PersistentLayer::open_ephemeral().await,
        }
        .map_err(|err| EngineError::layer_init(LayerName::Persistent, err))?;
        let marker_path = persistent.dir().join(VERSION_MARKER_FILE);
        let persistent = Arc::new(persistent);
        let worker = Arc::new(WorkerLayer::new(settings.cache.worker_grace));

        let mut layer_vec: Vec<Arc<dyn CacheLayer>> =
            vec![memory, persistent, worker.clone()];
        if let Some(endpoint) = &settings.cache.edge_endpoint {
            let edge = EdgeLayer::new(endpoint.clone(), settings.cache.edge_timeout)
                .map_err(|err| EngineError::layer_init(LayerName::Edge, err))?;
            layer_vec.push(Arc::new(edge));
        }
        let layers = Arc::new(LayerSet::new(layer_vec));

        let routing = Arc::new(RoutingPolicy::new(
            settings.cache.enable_intelligent_routing,
            settings.cache.promote_after_accesses,
        ));
        let monitor = Arc::new(PerformanceMonitor::new(
            settings.monitor.clone(),
            settings.thresholds,
        ));
        let invalidation =
            Arc::new(InvalidationEngine::new(layers.clone(), Some(marker_path)).await);
        let warming = Arc::new(WarmingEngine::new(
            settings.warming.clone(),
            layers.clone(),
            routing.clone(),
            monitor.clone(),
        ));

        info!(
            layers = layers.len(),
            intelligent_routing = settings.cache.enable_intelligent_routing,
            "cache coordinator initialized"
        );

        Ok(Self {
            settings,
            layers,
            routing,
            monitor,
            invalidation,
            warming,
            worker: Some(worker),
        })
    }

    /// Wire a coordinator over pre-built parts. The host owns layer
    /// construction; maintenance sweeps skip the worker layer.
    pub fn from_parts(
        settings: Settings,
        layers: Arc<LayerSet>,
        routing: Arc<RoutingPolicy>,
        monitor: Arc<PerformanceMonitor>,
        invalidation: Arc<InvalidationEngine>,
        warming: Arc<WarmingEngine>,
    ) -> Self {
        Self {
            settings,
            layers,
            routing,
            monitor,
            invalidation,
            warming,
            worker: None,
        }
    }

    // ========================================================================
    // Public cache API
    // ========================================================================

    /// Probe the routed layers fastest-first; on a hit, promote the entry
    /// into every faster routed layer. Exhaustion is a miss, never an error.
    pub async fn get(&self, key: &str, options: GetOptions) -> Lookup {
        let started = Instant::now();
        let plan = self
            .routing
            .plan(key, Operation::Get, options.layers.as_deref());
        self.routing.note_access(key);

        let mut hit: Option<(LayerName, CacheEntry)> = None;
        for layer in self.layers.select(&plan.layers) {
            match layer.get(key).await {
                Ok(Some(entry)) => {
                    hit = Some((layer.name(), entry));
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    // Backend fault: degrade to a miss from this layer only.
                    counter!(METRIC_LAYER_FAULTS, "layer" => layer.name().as_str()).increment(1);
                    warn!(layer = %layer.name(), key, error = %err, "layer get failed, treating as miss");
                }
            }
        }

        if let Some((source, entry)) = &hit {
            if self.settings.cache.enable_layer_synchronization {
                self.promote(entry, &plan.faster_than(*source)).await;
            }
        }

        let latency = started.elapsed();
        let from_cache = hit.is_some();
        counter!(METRIC_GET_TOTAL, "outcome" => if from_cache { "hit" } else { "miss" })
            .increment(1);
        histogram!(METRIC_GET_MS).record(latency.as_secs_f64() * 1000.0);
        self.monitor
            .record_operation(OperationKind::Get, key, latency, from_cache, None);
        self.warming.observe(key).await;

        match hit {
            Some((source, entry)) => Lookup {
                value: Some(entry.value),
                source: Some(source),
                from_cache: true,
                latency,
            },
            None => Lookup {
                value: None,
                source: None,
                from_cache: false,
                latency,
            },
        }
    }

    /// Write to every routed layer; success means at least one took it.
    pub async fn set(&self, key: &str, value: CacheValue, options: SetOptions) -> SetOutcome {
        let started = Instant::now();
        let plan = self
            .routing
            .plan(key, Operation::Set, options.layers.as_deref());
        let ttl = options.ttl.or(self.settings.cache.default_ttl);
        let entry = CacheEntry::new(key, value, ttl);

        let mut layers_written = Vec::new();
        for layer in self.layers.select(&plan.layers) {
            match layer.set(entry.clone()).await {
                Ok(()) => layers_written.push(layer.name()),
                Err(err) => {
                    counter!(METRIC_LAYER_FAULTS, "layer" => layer.name().as_str()).increment(1);
                    warn!(layer = %layer.name(), key, error = %err, "layer set failed, continuing");
                }
            }
        }

        let latency = started.elapsed();
        let success = !layers_written.is_empty();
        if !success {
            warn!(key, routed = ?plan.layers, "set failed on every routed layer");
        }
        counter!(METRIC_SET_TOTAL, "outcome" => if success { "ok" } else { "failed" })
            .increment(1);
        histogram!(METRIC_SET_MS).record(latency.as_secs_f64() * 1000.0);
        self.monitor
            .record_operation(OperationKind::Set, key, latency, success, None);
        self.monitor.record_storage(&self.layers.stats());

        SetOutcome {
            success,
            layers_written,
            latency,
        }
    }

    /// Invalidate a pattern on every layer, in parallel, best-effort.
    /// Returns the number of entries removed across layers.
    pub async fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let started = Instant::now();
        let outcome = self.layers.invalidate_all(pattern).await;
        self.monitor.record_operation(
            OperationKind::Invalidate,
            &pattern.to_string(),
            started.elapsed(),
            outcome.layer_faults == 0,
            None,
        );
        outcome.removed
    }

    /// Aggregated monitor snapshot, per-layer stats, and recommendations.
    pub fn performance_report(&self) -> PerformanceReport {
        let layers = self.layers.stats();
        self.monitor.record_storage(&layers);
        let snapshot = self.monitor.snapshot();
        let recommendations = self.monitor.recommendations(&snapshot);
        PerformanceReport {
            snapshot,
            layers,
            alerts: self.monitor.alerts(),
            recommendations,
        }
    }

    /// Finished invalidation batches for the dashboard.
    pub fn invalidation_history(&self) -> Vec<BatchRecord> {
        self.invalidation.history()
    }

    pub fn warming_status(&self) -> WarmingStatus {
        self.warming.status()
    }

    /// Administrative: run a warming session now.
    pub async fn start_warming_session(&self) -> Result<WarmingSession, WarmingError> {
        self.warming.start_session().await
    }

    /// Session boundary: forget frequency-promotion counters.
    pub fn reset_session(&self) {
        self.routing.reset_session();
    }

    /// Periodic housekeeping: purge aged alerts and sweep the worker layer.
    pub fn run_maintenance(&self) {
        let purged = self.monitor.purge_aged();
        let swept = self
            .worker
            .as_ref()
            .map(|worker| worker.sweep())
            .unwrap_or(0);
        debug!(purged_alerts = purged, swept_entries = swept, "maintenance pass complete");
    }

    // ========================================================================
    // Component access
    // ========================================================================

    pub fn routing(&self) -> &Arc<RoutingPolicy> {
        &self.routing
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn invalidation(&self) -> &Arc<InvalidationEngine> {
        &self.invalidation
    }

    pub fn warming(&self) -> &Arc<WarmingEngine> {
        &self.warming
    }

    async fn promote(&self, entry: &CacheEntry, targets: &[LayerName]) {
        for name in targets {
            let Some(layer) = self.layers.by_name(*name) else {
                continue;
            };
            match layer.set(entry.clone()).await {
                Ok(()) => {
                    counter!(METRIC_PROMOTIONS, "layer" => name.as_str()).increment(1);
                    debug!(layer = %name, key = %entry.key, "entry promoted");
                }
                Err(err) => {
                    warn!(layer = %name, key = %entry.key, error = %err, "promotion failed, continuing");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ResourceKind;

    fn settings() -> Settings {
        Settings::default()
    }

    fn computation() -> CacheValue {
        CacheValue::Computation {
            algorithm: "fibonacci".to_string(),
            input: serde_json::json!({ "n": 10 }),
            result: serde_json::json!(55),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn get_on_missing_key_is_a_miss_not_an_error() {
        let coordinator = CacheCoordinator::new(settings()).await.expect("coordinator");
        let lookup = coordinator.get("computation:never-set", GetOptions::default()).await;
        assert!(!lookup.from_cache);
        assert!(lookup.value.is_none());
        assert!(lookup.source.is_none());
    }

    #[tokio::test]
    async fn set_reports_routed_layers() {
        let coordinator = CacheCoordinator::new(settings()).await.expect("coordinator");
        let outcome = coordinator
            .set("computation:fib:10", computation(), SetOptions::default())
            .await;
        assert!(outcome.success);
        assert_eq!(
            outcome.layers_written,
            vec![LayerName::Persistent, LayerName::Worker]
        );
    }

    #[tokio::test]
    async fn hint_restricts_layers() {
        let coordinator = CacheCoordinator::new(settings()).await.expect("coordinator");
        let outcome = coordinator
            .set(
                "computation:fib:10",
                computation(),
                SetOptions {
                    layers: Some(vec![LayerName::Memory]),
                    ttl: None,
                },
            )
            .await;
        assert_eq!(outcome.layers_written, vec![LayerName::Memory]);

        let lookup = coordinator
            .get(
                "computation:fib:10",
                GetOptions {
                    layers: Some(vec![LayerName::Memory]),
                },
            )
            .await;
        assert_eq!(lookup.source, Some(LayerName::Memory));
    }

    #[tokio::test]
    async fn set_routed_only_to_missing_layer_fails() {
        // Default settings have no edge layer configured.
        let coordinator = CacheCoordinator::new(settings()).await.expect("coordinator");
        let outcome = coordinator
            .set(
                "static:app.js",
                CacheValue::placeholder(ResourceKind::Static),
                SetOptions {
                    layers: Some(vec![LayerName::Edge]),
                    ttl: None,
                },
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.layers_written.is_empty());
    }

    #[tokio::test]
    async fn report_includes_layer_stats() {
        let coordinator = CacheCoordinator::new(settings()).await.expect("coordinator");
        coordinator
            .set("computation:fib:10", computation(), SetOptions::default())
            .await;

        let report = coordinator.performance_report();
        assert_eq!(report.layers.len(), 3);
        let persistent = report
            .layers
            .iter()
            .find(|stats| stats.name == LayerName::Persistent)
            .expect("persistent stats");
        assert_eq!(persistent.entries, 1);
    }

    #[tokio::test]
    async fn maintenance_runs_without_error() {
        let coordinator = CacheCoordinator::new(settings()).await.expect("coordinator");
        coordinator.run_maintenance();
    }
}
