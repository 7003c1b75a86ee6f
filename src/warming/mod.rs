//! Predictive cache warming.
//!
//! Observes every coordinator read, maintains a bounded navigation
//! history with per-key frequency counters, and pre-populates the routed
//! layers for predicted near-future accesses. At most one session runs at
//! a time; a start request while one is active is rejected, never queued,
//! so predictions always come from a coherent history snapshot.

mod predictor;

pub use predictor::Prediction;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Timelike;
use dashmap::DashMap;
use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WarmingSettings;
use crate::layer::LayerSet;
use crate::lock::{mutex_lock, rw_read, rw_write};
use crate::monitor::PerformanceMonitor;
use crate::routing::{Operation, RoutingPolicy};
use crate::value::{CacheEntry, CacheValue};

const SOURCE: &str = "warming";
const METRIC_SESSION_MS: &str = "lemma_cache_warm_session_ms";

#[derive(Debug, Error)]
pub enum WarmingError {
    #[error("a warming session is already active")]
    SessionActive,
}

/// Supplies precomputed values for predicted keys.
///
/// Registered by the host application; when it declines a key the engine
/// writes a synthetic placeholder for the resource kind instead.
#[async_trait]
pub trait ValueLoader: Send + Sync {
    async fn load(&self, key: &str) -> Option<CacheValue>;
}

/// A completed (or running) warming session.
#[derive(Debug, Clone, Serialize)]
pub struct WarmingSession {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub predictions: Vec<Prediction>,
    pub warmed_keys: Vec<String>,
    /// warmed / predicted; 1.0 when nothing was predicted.
    pub success_rate: f64,
    /// Hit-rate delta measured across the session.
    pub performance_impact: f64,
}

/// Dashboard view of the warming engine.
#[derive(Debug, Clone, Serialize)]
pub struct WarmingStatus {
    pub is_warming: bool,
    pub history_len: usize,
    pub tracked_keys: usize,
    pub sessions_completed: usize,
    pub last_session: Option<WarmingSession>,
}

pub struct WarmingEngine {
    settings: WarmingSettings,
    layers: Arc<LayerSet>,
    routing: Arc<RoutingPolicy>,
    monitor: Arc<PerformanceMonitor>,
    loader: RwLock<Option<Arc<dyn ValueLoader>>>,
    history: Mutex<VecDeque<String>>,
    frequencies: DashMap<String, u32>,
    /// The one hard mutual-exclusion point: checked-and-set atomically.
    active: AtomicBool,
    sessions: Mutex<VecDeque<WarmingSession>>,
}

impl WarmingEngine {
    pub fn new(
        settings: WarmingSettings,
        layers: Arc<LayerSet>,
        routing: Arc<RoutingPolicy>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            settings,
            layers,
            routing,
            monitor,
            loader: RwLock::new(None),
            history: Mutex::new(VecDeque::new()),
            frequencies: DashMap::new(),
            active: AtomicBool::new(false),
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    /// Register the loader that supplies precomputed values.
    pub fn set_loader(&self, loader: Arc<dyn ValueLoader>) {
        *rw_write(&self.loader, SOURCE, "set_loader") = Some(loader);
    }

    /// Record one access; may auto-start a session when a trigger condition
    /// holds and none is active.
    pub async fn observe(&self, key: &str) {
        {
            let mut history = mutex_lock(&self.history, SOURCE, "observe");
            if history.len() == self.settings.history_limit {
                history.pop_front();
            }
            history.push_back(key.to_string());
        }
        *self.frequencies.entry(key.to_string()).or_insert(0) += 1;

        if self.trigger_condition_met() {
            match self.start_session().await {
                Ok(session) => {
                    debug!(session_id = %session.id, "auto-started warming session");
                }
                Err(WarmingError::SessionActive) => {}
            }
        }
    }

    /// Run a warming session now. Rejected while another is active.
    pub async fn start_session(&self) -> Result<WarmingSession, WarmingError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WarmingError::SessionActive);
        }

        let session = self.run_session().await;
        self.active.store(false, Ordering::SeqCst);
        Ok(session)
    }

    pub fn status(&self) -> WarmingStatus {
        let sessions = mutex_lock(&self.sessions, SOURCE, "status");
        WarmingStatus {
            is_warming: self.active.load(Ordering::SeqCst),
            history_len: mutex_lock(&self.history, SOURCE, "status.history").len(),
            tracked_keys: self.frequencies.len(),
            sessions_completed: sessions.len(),
            last_session: sessions.back().cloned(),
        }
    }

    /// Completed sessions, oldest first.
    pub fn sessions(&self) -> Vec<WarmingSession> {
        mutex_lock(&self.sessions, SOURCE, "sessions")
            .iter()
            .cloned()
            .collect()
    }

    fn trigger_condition_met(&self) -> bool {
        let history_len = mutex_lock(&self.history, SOURCE, "trigger").len();
        if history_len >= self.settings.trigger_history_len {
            return true;
        }
        if self.settings.windows.is_empty() {
            return false;
        }
        let hour = self.local_hour();
        self.settings.windows.iter().any(|window| window.contains(hour))
    }

    fn local_hour(&self) -> u8 {
        let unix = OffsetDateTime::now_utc().unix_timestamp();
        chrono::DateTime::<chrono::Utc>::from_timestamp(unix, 0)
            .map(|utc| utc.with_timezone(&self.settings.timezone).hour() as u8)
            .unwrap_or(0)
    }

    async fn run_session(&self) -> WarmingSession {
        let started = Instant::now();
        let started_at = OffsetDateTime::now_utc();
        let hit_rate_before = self.monitor.snapshot().hit_rate;

        let history: Vec<String> = mutex_lock(&self.history, SOURCE, "run_session")
            .iter()
            .cloned()
            .collect();
        let frequencies: HashMap<String, u32> = self
            .frequencies
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let mut candidates =
            predictor::successor_predictions(&history, self.settings.min_confidence, started_at);
        candidates.extend(predictor::frequency_predictions(
            &frequencies,
            self.settings.frequent_key_floor,
            started_at,
        ));
        let predictions = predictor::rank(candidates, self.settings.max_predictions);

        let mut warmed_keys = Vec::new();
        for prediction in &predictions {
            if self.warm_one(prediction).await {
                warmed_keys.push(prediction.key.clone());
            }
        }

        let success_rate = if predictions.is_empty() {
            1.0
        } else {
            warmed_keys.len() as f64 / predictions.len() as f64
        };
        let hit_rate_after = self.monitor.snapshot().hit_rate;

        let session = WarmingSession {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Some(OffsetDateTime::now_utc()),
            predictions,
            warmed_keys,
            success_rate,
            performance_impact: hit_rate_after - hit_rate_before,
        };

        info!(
            session_id = %session.id,
            predicted = session.predictions.len(),
            warmed = session.warmed_keys.len(),
            success_rate = session.success_rate,
            "Warming session finished"
        );
        histogram!(METRIC_SESSION_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        let mut sessions = mutex_lock(&self.sessions, SOURCE, "run_session.store");
        if sessions.len() == self.settings.session_history_limit {
            sessions.pop_front();
        }
        sessions.push_back(session.clone());
        session
    }

    /// Pre-populate the routed write layers for one prediction. Returns
    /// whether the key ended up warm in at least one layer.
    async fn warm_one(&self, prediction: &Prediction) -> bool {
        let plan = self
            .routing
            .plan(&prediction.key, Operation::Set, None);
        let targets = self.layers.select(&plan.layers);
        if targets.is_empty() {
            return false;
        }

        // Already cached anywhere on the route: warm without writing.
        for layer in &targets {
            if let Ok(Some(_)) = layer.get(&prediction.key).await {
                return true;
            }
        }

        let loader = rw_read(&self.loader, SOURCE, "warm_one").clone();
        let value = match loader {
            Some(loader) => loader.load(&prediction.key).await,
            None => None,
        };
        let value =
            value.unwrap_or_else(|| CacheValue::placeholder(prediction.resource_kind));

        let entry = CacheEntry::new(prediction.key.clone(), value, None);
        let mut warmed = false;
        for layer in targets {
            match layer.set(entry.clone()).await {
                Ok(()) => warmed = true,
                Err(err) => {
                    warn!(
                        layer = %layer.name(),
                        key = %prediction.key,
                        error = %err,
                        "warming write failed, continuing"
                    );
                }
            }
        }
        warmed
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::config::{MonitorSettings, ThresholdSettings};
    use crate::layer::{CacheLayer, LayerName, MemoryLayer, PersistentLayer, WorkerLayer};

    fn warming_settings() -> WarmingSettings {
        WarmingSettings {
            history_limit: 50,
            trigger_history_len: 1000, // effectively off unless a test lowers it
            windows: Vec::new(),
            timezone: chrono_tz::Tz::UTC,
            max_predictions: 10,
            min_confidence: 0.6,
            frequent_key_floor: 3,
            session_history_limit: 5,
        }
    }

    async fn engine_with(settings: WarmingSettings) -> (Arc<LayerSet>, WarmingEngine) {
        let layers = Arc::new(LayerSet::new(vec![
            Arc::new(MemoryLayer::new(NonZeroUsize::new(64).expect("capacity"))),
            Arc::new(
                PersistentLayer::open_ephemeral()
                    .await
                    .expect("persistent layer"),
            ),
            Arc::new(WorkerLayer::new(std::time::Duration::from_secs(60))),
        ]));
        let routing = Arc::new(RoutingPolicy::new(true, 3));
        let monitor = Arc::new(PerformanceMonitor::new(
            MonitorSettings {
                history_limit: 100,
                window: std::time::Duration::from_secs(300),
                alert_max_age: std::time::Duration::from_secs(3600),
                min_get_samples: 1000,
            },
            ThresholdSettings::default(),
        ));
        let engine = WarmingEngine::new(settings, layers.clone(), routing, monitor);
        (layers, engine)
    }

    struct FibLoader;

    #[async_trait]
    impl ValueLoader for FibLoader {
        async fn load(&self, key: &str) -> Option<CacheValue> {
            key.starts_with("computation:fib:").then(|| CacheValue::Computation {
                algorithm: "fibonacci".to_string(),
                input: serde_json::json!({ "n": 10 }),
                result: serde_json::json!(55),
                metadata: serde_json::Value::Null,
            })
        }
    }

    #[tokio::test]
    async fn only_one_session_at_a_time() {
        let (_, engine) = engine_with(warming_settings()).await;
        engine.active.store(true, Ordering::SeqCst);
        assert!(matches!(
            engine.start_session().await,
            Err(WarmingError::SessionActive)
        ));
        assert!(engine.status().is_warming);

        engine.active.store(false, Ordering::SeqCst);
        assert!(engine.start_session().await.is_ok());
        assert!(!engine.status().is_warming);
    }

    #[tokio::test]
    async fn session_warms_predicted_successors() {
        let (layers, engine) = engine_with(warming_settings()).await;

        // Establish "lesson is always followed by the fib computation".
        for _ in 0..3 {
            engine.observe("documentation:lesson-7").await;
            engine.observe("computation:fib:10").await;
        }
        engine.observe("documentation:lesson-7").await;

        let session = engine.start_session().await.expect("session");
        assert!(
            session
                .predictions
                .iter()
                .any(|p| p.key == "computation:fib:10")
        );
        assert!(session.warmed_keys.contains(&"computation:fib:10".to_string()));
        assert!(session.success_rate > 0.0);

        // Computation writes route to persistent + worker.
        let persistent = layers.by_name(LayerName::Persistent).expect("persistent");
        assert!(
            persistent
                .get("computation:fib:10")
                .await
                .expect("get")
                .is_some()
        );
    }

    #[tokio::test]
    async fn loader_supplies_real_values() {
        let (layers, engine) = engine_with(warming_settings()).await;
        engine.set_loader(Arc::new(FibLoader));

        for _ in 0..3 {
            engine.observe("documentation:lesson-7").await;
            engine.observe("computation:fib:10").await;
        }
        engine.observe("documentation:lesson-7").await;

        engine.start_session().await.expect("session");

        let persistent = layers.by_name(LayerName::Persistent).expect("persistent");
        let entry = persistent
            .get("computation:fib:10")
            .await
            .expect("get")
            .expect("warmed entry");
        assert!(!entry.value.is_placeholder());
    }

    #[tokio::test]
    async fn placeholder_written_without_loader() {
        let (layers, engine) = engine_with(warming_settings()).await;

        for _ in 0..3 {
            engine.observe("documentation:lesson-7").await;
            engine.observe("computation:fib:10").await;
        }
        engine.observe("documentation:lesson-7").await;

        engine.start_session().await.expect("session");

        let persistent = layers.by_name(LayerName::Persistent).expect("persistent");
        let entry = persistent
            .get("computation:fib:10")
            .await
            .expect("get")
            .expect("warmed entry");
        assert!(entry.value.is_placeholder());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let mut settings = warming_settings();
        settings.history_limit = 5;
        let (_, engine) = engine_with(settings).await;

        for i in 0..20 {
            engine.observe(&format!("documentation:page-{i}")).await;
        }
        assert_eq!(engine.status().history_len, 5);
    }

    #[tokio::test]
    async fn history_threshold_auto_starts_session() {
        let mut settings = warming_settings();
        settings.trigger_history_len = 4;
        let (_, engine) = engine_with(settings).await;

        for _ in 0..2 {
            engine.observe("documentation:lesson-7").await;
            engine.observe("computation:fib:10").await;
        }

        assert!(engine.status().sessions_completed >= 1);
    }

    #[tokio::test]
    async fn frequency_predictions_reach_the_session() {
        let (_, engine) = engine_with(warming_settings()).await;

        // No repeated pair structure, but one key is clearly hot.
        for i in 0..4 {
            engine.observe("computation:fib:10").await;
            engine.observe(&format!("documentation:page-{i}")).await;
        }

        let session = engine.start_session().await.expect("session");
        assert!(
            session
                .predictions
                .iter()
                .any(|p| p.key == "computation:fib:10")
        );
    }

    #[tokio::test]
    async fn session_history_is_bounded() {
        let mut settings = warming_settings();
        settings.session_history_limit = 2;
        let (_, engine) = engine_with(settings).await;

        for _ in 0..4 {
            engine.start_session().await.expect("session");
        }
        assert_eq!(engine.status().sessions_completed, 2);
    }
}
