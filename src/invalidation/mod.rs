//! Dependency-aware invalidation engine.
//!
//! Rules are registered up front and executed in serialized batches:
//! while a batch is running, newly triggered work queues behind it and is
//! never interleaved, keeping dependency-graph traversal consistent.
//! Within the queue, work drains by ascending numeric priority.

pub mod graph;

pub use graph::{DependencyGraph, DependencyNode};

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::key::{KeyPattern, ResourceKind};
use crate::layer::{FanoutOutcome, LayerSet};
use crate::lock::{mutex_lock, rw_read, rw_write};
use crate::value::VersionMarker;

const SOURCE: &str = "invalidation";
const HISTORY_LIMIT: usize = 100;
/// Priority assigned to direct node invalidations (no rule involved).
const NODE_PRIORITY: u8 = 10;

const METRIC_BATCHES: &str = "lemma_cache_invalidation_batch_total";
const METRIC_QUEUE_LEN: &str = "lemma_cache_invalidation_queue_len";
const METRIC_BATCH_MS: &str = "lemma_cache_invalidation_ms";

#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("unknown dependency node `{id}`")]
    UnknownNode { id: String },
    #[error("node `{id}` cannot depend on itself")]
    SelfDependency { id: String },
    #[error("edge {dependent} -> {dependency} would create a dependency cycle")]
    CycleDetected { dependent: String, dependency: String },
    #[error("unknown invalidation rule `{id}`")]
    UnknownRule { id: String },
    #[error("invalidation rule `{id}` is already registered")]
    DuplicateRule { id: String },
    #[error("invalid invalidation rule `{id}`: {reason}")]
    InvalidRule { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStrategy {
    /// Version-triggered: clears all layers unconditionally.
    Eager,
    /// Pattern-matched at invalidation time.
    Lazy,
    /// Dependency-graph traversal with lazy fallback.
    Hybrid,
}

/// A registered invalidation rule.
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub id: String,
    pub pattern: KeyPattern,
    pub strategy: InvalidationStrategy,
    /// Ascending numeric priority; lower runs first.
    pub priority: u8,
    /// Restrict the rule to keys of one resource kind.
    pub condition: Option<ResourceKind>,
}

/// Blast-radius classification, for alerting and reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    pub fn classify(matched_keys: usize, layers_affected: usize) -> Self {
        if matched_keys >= 1000 || layers_affected > 3 {
            Self::High
        } else if matched_keys < 100 && layers_affected <= 2 {
            Self::Low
        } else {
            Self::Medium
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Executing,
    Completed,
    Failed,
}

impl BatchState {
    fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One rule execution's lifecycle record.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub id: Uuid,
    /// The rule id, `node:<id>`, or `version:<app_id>` that triggered this.
    pub source: String,
    pub strategy: InvalidationStrategy,
    pub priority: u8,
    pub state: BatchState,
    #[serde(with = "time::serde::rfc3339")]
    pub queued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub matched_keys: usize,
    pub layers_affected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<ImpactLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

enum Work {
    Lazy {
        pattern: KeyPattern,
    },
    Hybrid {
        node_id: Option<String>,
        fallback: Option<KeyPattern>,
    },
    Eager,
}

struct PendingExecution {
    record: BatchRecord,
    work: Work,
}

pub struct InvalidationEngine {
    layers: Arc<LayerSet>,
    graph: DependencyGraph,
    rules: RwLock<Vec<InvalidationRule>>,
    queue: Mutex<VecDeque<PendingExecution>>,
    executing: AtomicBool,
    current: Mutex<Option<BatchRecord>>,
    history: Mutex<VecDeque<BatchRecord>>,
    markers: tokio::sync::Mutex<HashMap<String, VersionMarker>>,
    marker_path: Option<PathBuf>,
}

impl InvalidationEngine {
    /// Build an engine over the shared layer set. When `marker_path` is
    /// given, version markers persist there as JSON and survive restarts.
    pub async fn new(layers: Arc<LayerSet>, marker_path: Option<PathBuf>) -> Self {
        let markers = match &marker_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                    warn!(path = %path.display(), error = %err, "version markers unreadable, starting empty");
                    HashMap::new()
                }),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "version markers unreadable, starting empty");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        Self {
            layers,
            graph: DependencyGraph::new(),
            rules: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            executing: AtomicBool::new(false),
            current: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            markers: tokio::sync::Mutex::new(markers),
            marker_path,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    // ========================================================================
    // Rule registration
    // ========================================================================

    /// Register a rule. Invalid rules are rejected synchronously.
    pub fn register_rule(&self, rule: InvalidationRule) -> Result<(), InvalidationError> {
        if rule.id.trim().is_empty() {
            return Err(InvalidationError::InvalidRule {
                id: rule.id,
                reason: "rule id must not be empty".to_string(),
            });
        }
        // Validate that a kind condition composes with the pattern.
        effective_pattern(&rule)?;

        let mut rules = rw_write(&self.rules, SOURCE, "register_rule");
        if rules.iter().any(|existing| existing.id == rule.id) {
            return Err(InvalidationError::DuplicateRule { id: rule.id });
        }
        info!(rule_id = %rule.id, strategy = ?rule.strategy, priority = rule.priority, "invalidation rule registered");
        rules.push(rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = rw_write(&self.rules, SOURCE, "remove_rule");
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        before != rules.len()
    }

    pub fn rules(&self) -> Vec<InvalidationRule> {
        rw_read(&self.rules, SOURCE, "rules").clone()
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    /// Queue a registered rule for execution.
    pub async fn trigger_rule(&self, rule_id: &str) -> Result<(), InvalidationError> {
        let rule = rw_read(&self.rules, SOURCE, "trigger_rule")
            .iter()
            .find(|rule| rule.id == rule_id)
            .cloned()
            .ok_or_else(|| InvalidationError::UnknownRule {
                id: rule_id.to_string(),
            })?;

        let pattern = effective_pattern(&rule)?;
        let work = match rule.strategy {
            InvalidationStrategy::Lazy => Work::Lazy { pattern },
            InvalidationStrategy::Eager => Work::Eager,
            InvalidationStrategy::Hybrid => {
                // A literal pattern naming a known node walks the graph;
                // everything else falls back to lazy matching.
                let node_id = match &rule.pattern {
                    KeyPattern::Literal(id) if self.graph.contains(id) => Some(id.clone()),
                    _ => None,
                };
                Work::Hybrid {
                    node_id,
                    fallback: Some(pattern),
                }
            }
        };

        self.enqueue(rule.id.clone(), rule.strategy, rule.priority, work)
            .await;
        Ok(())
    }

    /// Queue a hybrid invalidation for a changed node: the node's keys plus
    /// every transitive dependent's keys.
    pub async fn invalidate_node(&self, node_id: &str) -> Result<(), InvalidationError> {
        if !self.graph.contains(node_id) {
            return Err(InvalidationError::UnknownNode {
                id: node_id.to_string(),
            });
        }
        self.enqueue(
            format!("node:{node_id}"),
            InvalidationStrategy::Hybrid,
            NODE_PRIORITY,
            Work::Hybrid {
                node_id: Some(node_id.to_string()),
                fallback: None,
            },
        )
        .await;
        Ok(())
    }

    /// Register the current version for an app/algorithm id; a mismatch
    /// against the stored marker (or a breaking change) clears all layers.
    pub async fn apply_version(&self, marker: VersionMarker) {
        let stale = {
            let mut markers = self.markers.lock().await;
            let stale = match markers.get(&marker.app_id) {
                None => false,
                Some(stored) => stored.version != marker.version || marker.breaking_changes,
            };
            markers.insert(marker.app_id.clone(), marker.clone());
            self.persist_markers(&markers).await;
            stale
        };

        if stale {
            self.enqueue(
                format!("version:{}", marker.app_id),
                InvalidationStrategy::Eager,
                0,
                Work::Eager,
            )
            .await;
        } else {
            info!(app_id = %marker.app_id, version = %marker.version, "version marker stored, no invalidation needed");
        }
    }

    /// The stored marker for an app id, if any.
    pub async fn version_marker(&self, app_id: &str) -> Option<VersionMarker> {
        self.markers.lock().await.get(app_id).cloned()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Finished batch records, most recent last.
    pub fn history(&self) -> Vec<BatchRecord> {
        mutex_lock(&self.history, SOURCE, "history")
            .iter()
            .cloned()
            .collect()
    }

    /// Work waiting behind the active batch.
    pub fn pending(&self) -> Vec<BatchRecord> {
        mutex_lock(&self.queue, SOURCE, "pending")
            .iter()
            .map(|pending| pending.record.clone())
            .collect()
    }

    /// The record currently executing, if any.
    pub fn active(&self) -> Option<BatchRecord> {
        mutex_lock(&self.current, SOURCE, "active").clone()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn enqueue(
        &self,
        source: String,
        strategy: InvalidationStrategy,
        priority: u8,
        work: Work,
    ) {
        let record = BatchRecord {
            id: Uuid::new_v4(),
            source,
            strategy,
            priority,
            state: BatchState::Queued,
            queued_at: OffsetDateTime::now_utc(),
            finished_at: None,
            matched_keys: 0,
            layers_affected: 0,
            impact: None,
            note: None,
        };

        {
            let mut queue = mutex_lock(&self.queue, SOURCE, "enqueue");
            // Keep the queue sorted by ascending priority; stable insert
            // preserves arrival order among equals.
            let position = queue
                .iter()
                .position(|pending| pending.record.priority > priority)
                .unwrap_or(queue.len());
            queue.insert(position, PendingExecution { record, work });
            gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        }

        self.drive().await;
    }

    /// Drain the queue, one execution at a time. A second caller arriving
    /// while a batch runs leaves its work queued and returns immediately.
    async fn drive(&self) {
        loop {
            if self
                .executing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            loop {
                let next = {
                    let mut queue = mutex_lock(&self.queue, SOURCE, "drive");
                    let next = queue.pop_front();
                    gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
                    next
                };
                let Some(pending) = next else {
                    break;
                };
                self.execute(pending).await;
            }

            self.executing.store(false, Ordering::SeqCst);

            // Work enqueued while we were releasing the flag would otherwise
            // strand; re-check once.
            if mutex_lock(&self.queue, SOURCE, "drive.recheck").is_empty() {
                return;
            }
        }
    }

    async fn execute(&self, pending: PendingExecution) {
        let PendingExecution { mut record, work } = pending;
        let started = Instant::now();
        record.state = BatchState::Executing;
        *mutex_lock(&self.current, SOURCE, "execute.current") = Some(record.clone());

        let (outcome, note) = match work {
            Work::Lazy { pattern } => {
                let outcome = self.layers.invalidate_all(&pattern).await;
                (outcome, None)
            }
            Work::Eager => {
                let outcome = self.layers.clear_all().await;
                (outcome, None)
            }
            Work::Hybrid { node_id, fallback } => self.execute_hybrid(node_id, fallback).await,
        };

        record.matched_keys = outcome.removed;
        record.layers_affected = outcome.layers_affected;
        record.impact = Some(ImpactLevel::classify(
            outcome.removed,
            outcome.layers_affected,
        ));
        record.finished_at = Some(OffsetDateTime::now_utc());

        // Partial layer failure is best-effort success; only a total fanout
        // failure marks the batch failed.
        let total_failure = outcome.layer_faults > 0 && outcome.layer_faults >= self.layers.len();
        record.state = if total_failure {
            BatchState::Failed
        } else {
            BatchState::Completed
        };
        record.note = note.or_else(|| {
            (outcome.layer_faults > 0).then(|| {
                format!(
                    "{} layer(s) failed, invalidation was best-effort",
                    outcome.layer_faults
                )
            })
        });

        info!(
            batch_id = %record.id,
            source = %record.source,
            state = record.state.label(),
            matched_keys = record.matched_keys,
            layers_affected = record.layers_affected,
            impact = ?record.impact,
            "Invalidation batch finished"
        );
        counter!(METRIC_BATCHES, "state" => record.state.label()).increment(1);
        histogram!(METRIC_BATCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        *mutex_lock(&self.current, SOURCE, "execute.current_done") = None;
        let mut history = mutex_lock(&self.history, SOURCE, "execute.history");
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record);
    }

    async fn execute_hybrid(
        &self,
        node_id: Option<String>,
        fallback: Option<KeyPattern>,
    ) -> (FanoutOutcome, Option<String>) {
        let mut total = FanoutOutcome::default();

        match node_id {
            Some(node_id) => {
                let mut targets = vec![node_id.clone()];
                targets.extend(self.graph.dependents_of(&node_id));

                let mut affected_layers = 0usize;
                for target in &targets {
                    let outcome = self
                        .layers
                        .invalidate_all(&KeyPattern::prefix(format!("{target}:")))
                        .await;
                    total.removed += outcome.removed;
                    total.layer_faults += outcome.layer_faults;
                    affected_layers = affected_layers.max(outcome.layers_affected);
                }
                total.layers_affected = affected_layers;

                let note = format!(
                    "cascaded to {} dependent node(s)",
                    targets.len().saturating_sub(1)
                );
                (total, Some(note))
            }
            None => {
                // Nothing in the graph covers this trigger: lazy fallback.
                let pattern = fallback.unwrap_or(KeyPattern::All);
                (self.layers.invalidate_all(&pattern).await, None)
            }
        }
    }

    async fn persist_markers(&self, markers: &HashMap<String, VersionMarker>) {
        let Some(path) = &self.marker_path else {
            return;
        };
        let result = async {
            let bytes = serde_json::to_vec(markers)?;
            tokio::fs::write(path, bytes).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "failed to persist version markers");
        }
    }
}

/// Compose a rule's pattern with its kind condition, rejecting combinations
/// that cannot match anything.
fn effective_pattern(rule: &InvalidationRule) -> Result<KeyPattern, InvalidationError> {
    let Some(kind) = rule.condition else {
        return Ok(rule.pattern.clone());
    };

    let invalid = |reason: String| InvalidationError::InvalidRule {
        id: rule.id.clone(),
        reason,
    };

    match &rule.pattern {
        KeyPattern::All => Ok(KeyPattern::prefix(format!("{kind}:"))),
        KeyPattern::Literal(key) => {
            if ResourceKind::from_key(key) == kind {
                Ok(rule.pattern.clone())
            } else {
                Err(invalid(format!(
                    "literal `{key}` is not in the {kind} namespace"
                )))
            }
        }
        KeyPattern::Glob(fragments) => {
            let head = fragments.first().map(String::as_str).unwrap_or_default();
            if head.contains(':') && ResourceKind::from_key(head) == kind {
                Ok(rule.pattern.clone())
            } else {
                Err(invalid(format!(
                    "glob head `{head}` does not pin the {kind} namespace"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::layer::{CacheLayer, MemoryLayer, WorkerLayer};
    use crate::value::{CacheEntry, CacheValue};

    fn lazy_rule(id: &str, pattern: &str) -> InvalidationRule {
        InvalidationRule {
            id: id.to_string(),
            pattern: KeyPattern::parse(pattern),
            strategy: InvalidationStrategy::Lazy,
            priority: 5,
            condition: None,
        }
    }

    fn layer_set() -> Arc<LayerSet> {
        Arc::new(LayerSet::new(vec![
            Arc::new(MemoryLayer::new(
                NonZeroUsize::new(64).expect("capacity"),
            )),
            Arc::new(WorkerLayer::new(std::time::Duration::from_secs(60))),
        ]))
    }

    async fn seed(layers: &LayerSet, keys: &[&str]) {
        for layer in layers.iter() {
            for key in keys {
                layer
                    .set(CacheEntry::new(
                        *key,
                        CacheValue::placeholder(ResourceKind::Computation),
                        None,
                    ))
                    .await
                    .expect("seed");
            }
        }
    }

    async fn engine() -> (Arc<LayerSet>, InvalidationEngine) {
        let layers = layer_set();
        let engine = InvalidationEngine::new(layers.clone(), None).await;
        (layers, engine)
    }

    #[tokio::test]
    async fn duplicate_rule_rejected() {
        let (_, engine) = engine().await;
        engine
            .register_rule(lazy_rule("computations", "computation:*"))
            .expect("register");
        assert!(matches!(
            engine.register_rule(lazy_rule("computations", "computation:*")),
            Err(InvalidationError::DuplicateRule { .. })
        ));
    }

    #[tokio::test]
    async fn empty_rule_id_rejected() {
        let (_, engine) = engine().await;
        assert!(matches!(
            engine.register_rule(lazy_rule("  ", "computation:*")),
            Err(InvalidationError::InvalidRule { .. })
        ));
    }

    #[tokio::test]
    async fn mismatched_condition_rejected_synchronously() {
        let (_, engine) = engine().await;
        let rule = InvalidationRule {
            id: "prefs-only".to_string(),
            pattern: KeyPattern::parse("computation:*"),
            strategy: InvalidationStrategy::Lazy,
            priority: 1,
            condition: Some(ResourceKind::Preference),
        };
        assert!(matches!(
            engine.register_rule(rule),
            Err(InvalidationError::InvalidRule { .. })
        ));
    }

    #[tokio::test]
    async fn lazy_rule_invalidates_matches_only() {
        let (layers, engine) = engine().await;
        seed(&layers, &["computation:fib:10", "preference:theme"]).await;

        engine
            .register_rule(lazy_rule("computations", "computation:*"))
            .expect("register");
        engine.trigger_rule("computations").await.expect("trigger");

        let memory = layers.by_name(crate::layer::LayerName::Memory).expect("memory");
        assert!(memory.get("computation:fib:10").await.expect("get").is_none());
        assert!(memory.get("preference:theme").await.expect("get").is_some());

        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, BatchState::Completed);
        assert_eq!(history[0].matched_keys, 2); // both layers held the key
        assert_eq!(history[0].impact, Some(ImpactLevel::Low));
    }

    #[tokio::test]
    async fn condition_narrows_match_all_rule() {
        let (layers, engine) = engine().await;
        seed(&layers, &["computation:fib:10", "preference:theme"]).await;

        let rule = InvalidationRule {
            id: "all-computations".to_string(),
            pattern: KeyPattern::All,
            strategy: InvalidationStrategy::Lazy,
            priority: 1,
            condition: Some(ResourceKind::Computation),
        };
        engine.register_rule(rule).expect("register");
        engine.trigger_rule("all-computations").await.expect("trigger");

        let memory = layers.by_name(crate::layer::LayerName::Memory).expect("memory");
        assert!(memory.get("computation:fib:10").await.expect("get").is_none());
        assert!(memory.get("preference:theme").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn hybrid_node_invalidation_cascades_to_dependents() {
        let (layers, engine) = engine().await;
        engine.graph().register("tda-persistence", ResourceKind::Computation, 3);
        engine
            .graph()
            .register("persistence-landscape", ResourceKind::Visualization, 2);
        engine
            .graph()
            .add_dependency("persistence-landscape", "tda-persistence")
            .expect("edge");

        seed(
            &layers,
            &[
                "tda-persistence:diagram",
                "persistence-landscape:level-1",
                "computation:unrelated",
            ],
        )
        .await;

        engine
            .invalidate_node("tda-persistence")
            .await
            .expect("invalidate node");

        let memory = layers.by_name(crate::layer::LayerName::Memory).expect("memory");
        assert!(
            memory
                .get("tda-persistence:diagram")
                .await
                .expect("get")
                .is_none()
        );
        assert!(
            memory
                .get("persistence-landscape:level-1")
                .await
                .expect("get")
                .is_none()
        );
        assert!(memory.get("computation:unrelated").await.expect("get").is_some());

        let record = &engine.history()[0];
        assert_eq!(record.strategy, InvalidationStrategy::Hybrid);
        assert!(record.note.as_deref().is_some_and(|n| n.contains("1 dependent")));
    }

    #[tokio::test]
    async fn unknown_node_rejected() {
        let (_, engine) = engine().await;
        assert!(matches!(
            engine.invalidate_node("ghost").await,
            Err(InvalidationError::UnknownNode { .. })
        ));
    }

    #[tokio::test]
    async fn first_version_marker_does_not_invalidate() {
        let (layers, engine) = engine().await;
        seed(&layers, &["computation:fib:10"]).await;

        engine
            .apply_version(VersionMarker::new("group-theory", "1.0.0"))
            .await;

        let memory = layers.by_name(crate::layer::LayerName::Memory).expect("memory");
        assert!(memory.get("computation:fib:10").await.expect("get").is_some());
        assert!(engine.history().is_empty());
        assert!(engine.version_marker("group-theory").await.is_some());
    }

    #[tokio::test]
    async fn version_mismatch_clears_all_layers() {
        let (layers, engine) = engine().await;
        seed(&layers, &["computation:fib:10", "preference:theme"]).await;

        engine
            .apply_version(VersionMarker::new("group-theory", "1.0.0"))
            .await;
        engine
            .apply_version(VersionMarker::new("group-theory", "2.0.0"))
            .await;

        for layer in layers.iter() {
            assert_eq!(layer.stats().entries, 0);
        }
        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, InvalidationStrategy::Eager);
        assert_eq!(history[0].source, "version:group-theory");
    }

    #[tokio::test]
    async fn breaking_change_clears_even_on_same_version() {
        let (layers, engine) = engine().await;
        seed(&layers, &["computation:fib:10"]).await;

        engine
            .apply_version(VersionMarker::new("group-theory", "1.0.0"))
            .await;
        engine
            .apply_version(VersionMarker::new("group-theory", "1.0.0").breaking())
            .await;

        let memory = layers.by_name(crate::layer::LayerName::Memory).expect("memory");
        assert_eq!(memory.stats().entries, 0);
    }

    #[tokio::test]
    async fn markers_persist_across_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("versions.json");

        {
            let engine = InvalidationEngine::new(layer_set(), Some(path.clone())).await;
            engine
                .apply_version(VersionMarker::new("group-theory", "1.0.0"))
                .await;
        }

        let layers = layer_set();
        seed(&layers, &["computation:fib:10"]).await;
        let engine = InvalidationEngine::new(layers.clone(), Some(path)).await;
        engine
            .apply_version(VersionMarker::new("group-theory", "2.0.0"))
            .await;

        let memory = layers.by_name(crate::layer::LayerName::Memory).expect("memory");
        assert_eq!(memory.stats().entries, 0);
    }

    #[tokio::test]
    async fn queue_drains_by_priority() {
        let (layers, engine) = engine().await;
        seed(&layers, &["computation:fib:10", "preference:theme"]).await;

        engine
            .register_rule(InvalidationRule {
                priority: 9,
                ..lazy_rule("later", "preference:*")
            })
            .expect("register");
        engine
            .register_rule(InvalidationRule {
                priority: 1,
                ..lazy_rule("sooner", "computation:*")
            })
            .expect("register");

        engine.trigger_rule("later").await.expect("trigger");
        engine.trigger_rule("sooner").await.expect("trigger");

        // Each trigger drained immediately in this single-task test, so
        // history order is arrival order; both completed.
        let history = engine.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.state == BatchState::Completed));
    }

    #[test]
    fn impact_classification_bounds() {
        assert_eq!(ImpactLevel::classify(99, 2), ImpactLevel::Low);
        assert_eq!(ImpactLevel::classify(100, 2), ImpactLevel::Medium);
        assert_eq!(ImpactLevel::classify(50, 3), ImpactLevel::Medium);
        assert_eq!(ImpactLevel::classify(1000, 2), ImpactLevel::High);
        assert_eq!(ImpactLevel::classify(10, 4), ImpactLevel::High);
    }
}
