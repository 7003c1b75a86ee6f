//! Performance monitor.
//!
//! Records a metric per coordinator operation into a fixed-capacity ring
//! buffer, derives rolling rates over a sliding window, and raises
//! edge-triggered alerts when a threshold is crossed. Listeners are
//! notified synchronously from the recording call.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::config::{MonitorSettings, ThresholdSettings};
use crate::layer::LayerStats;
use crate::lock::{mutex_lock, rw_read, rw_write};
use crate::util::{format_bytes, format_percent};

const SOURCE: &str = "monitor";
const METRIC_ALERTS: &str = "lemma_cache_alert_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Get,
    Set,
    Invalidate,
    Clear,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Invalidate => "invalidate",
            Self::Clear => "clear",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded operation.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetric {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub operation: OperationKind,
    pub key: String,
    pub duration: Duration,
    /// For gets: hit. For writes/invalidation: completed without fault.
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Rolling rates derived over the sliding window.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub window: Duration,
    pub operations: usize,
    pub gets: usize,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub avg_latency_ms: f64,
    pub invalidation_frequency: f64,
    pub storage_efficiency: f64,
    pub storage_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

/// A threshold-crossing notification.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub snapshot: MetricsSnapshot,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ThresholdKind {
    HitRate,
    Latency,
    InvalidationFrequency,
    StorageEfficiency,
}

impl ThresholdKind {
    fn label(&self) -> &'static str {
        match self {
            Self::HitRate => "hit_rate",
            Self::Latency => "latency",
            Self::InvalidationFrequency => "invalidation_frequency",
            Self::StorageEfficiency => "storage_efficiency",
        }
    }
}

pub type AlertListener = Box<dyn Fn(&Alert) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct StorageUsage {
    entries: u64,
    touched_entries: u64,
    size_bytes: u64,
}

pub struct PerformanceMonitor {
    settings: MonitorSettings,
    thresholds: ThresholdSettings,
    history: Mutex<VecDeque<PerformanceMetric>>,
    storage: Mutex<StorageUsage>,
    /// Thresholds currently in breach; alerts fire only on the ok→breach edge.
    breached: Mutex<HashSet<ThresholdKind>>,
    alerts: Mutex<Vec<Alert>>,
    listeners: RwLock<Vec<AlertListener>>,
}

impl PerformanceMonitor {
    pub fn new(settings: MonitorSettings, thresholds: ThresholdSettings) -> Self {
        Self {
            settings,
            thresholds,
            history: Mutex::new(VecDeque::new()),
            storage: Mutex::new(StorageUsage::default()),
            breached: Mutex::new(HashSet::new()),
            alerts: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Record one operation and re-evaluate every threshold.
    pub fn record(&self, metric: PerformanceMetric) {
        {
            let mut history = mutex_lock(&self.history, SOURCE, "record");
            if history.len() == self.settings.history_limit {
                history.pop_front();
            }
            history.push_back(metric);
        }
        self.evaluate();
    }

    /// Convenience wrapper used by the coordinator.
    pub fn record_operation(
        &self,
        operation: OperationKind,
        key: &str,
        duration: Duration,
        success: bool,
        metadata: Option<serde_json::Value>,
    ) {
        self.record(PerformanceMetric {
            timestamp: OffsetDateTime::now_utc(),
            operation,
            key: key.to_string(),
            duration,
            success,
            metadata,
        });
    }

    /// Refresh the storage-efficiency inputs from per-layer stats.
    pub fn record_storage(&self, layers: &[LayerStats]) {
        let mut usage = mutex_lock(&self.storage, SOURCE, "record_storage");
        usage.entries = layers.iter().map(|stats| stats.entries).sum();
        usage.touched_entries = layers.iter().map(|stats| stats.touched_entries).sum();
        usage.size_bytes = layers.iter().map(|stats| stats.size_bytes).sum();
    }

    /// Derive the rolling snapshot over the configured window.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let cutoff = OffsetDateTime::now_utc() - self.settings.window;
        let history = mutex_lock(&self.history, SOURCE, "snapshot");

        let mut operations = 0usize;
        let mut gets = 0usize;
        let mut get_hits = 0usize;
        let mut invalidations = 0usize;
        let mut total_latency_ms = 0.0;
        for metric in history.iter().filter(|m| m.timestamp >= cutoff) {
            operations += 1;
            total_latency_ms += metric.duration.as_secs_f64() * 1000.0;
            match metric.operation {
                OperationKind::Get => {
                    gets += 1;
                    if metric.success {
                        get_hits += 1;
                    }
                }
                OperationKind::Invalidate | OperationKind::Clear => invalidations += 1,
                OperationKind::Set => {}
            }
        }
        drop(history);

        let hit_rate = if gets == 0 {
            0.0
        } else {
            get_hits as f64 / gets as f64
        };
        let usage = *mutex_lock(&self.storage, SOURCE, "snapshot.storage");
        let storage_efficiency = if usage.entries == 0 {
            1.0
        } else {
            usage.touched_entries as f64 / usage.entries as f64
        };

        MetricsSnapshot {
            window: self.settings.window,
            operations,
            gets,
            hit_rate,
            miss_rate: if gets == 0 { 0.0 } else { 1.0 - hit_rate },
            avg_latency_ms: if operations == 0 {
                0.0
            } else {
                total_latency_ms / operations as f64
            },
            invalidation_frequency: if operations == 0 {
                0.0
            } else {
                invalidations as f64 / operations as f64
            },
            storage_efficiency,
            storage_bytes: usage.size_bytes,
        }
    }

    /// Register a synchronous alert listener.
    pub fn subscribe(&self, listener: AlertListener) {
        rw_write(&self.listeners, SOURCE, "subscribe").push(listener);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        mutex_lock(&self.alerts, SOURCE, "alerts").clone()
    }

    pub fn clear_alerts(&self) {
        mutex_lock(&self.alerts, SOURCE, "clear_alerts").clear();
    }

    /// Drop alerts older than the configured age. Returns the purge count.
    pub fn purge_aged(&self) -> usize {
        let cutoff = OffsetDateTime::now_utc() - self.settings.alert_max_age;
        let mut alerts = mutex_lock(&self.alerts, SOURCE, "purge_aged");
        let before = alerts.len();
        alerts.retain(|alert| alert.timestamp >= cutoff);
        before - alerts.len()
    }

    /// Actionable notes for the current snapshot, used in reports.
    pub fn recommendations(&self, snapshot: &MetricsSnapshot) -> Vec<String> {
        let mut notes = Vec::new();
        if snapshot.gets >= self.settings.min_get_samples
            && snapshot.hit_rate < self.thresholds.hit_rate_minimum
        {
            notes.push(format!(
                "hit rate {} is below target {}; consider widening warming predictions or raising TTLs",
                format_percent(snapshot.hit_rate),
                format_percent(self.thresholds.hit_rate_minimum)
            ));
        }
        if snapshot.operations > 0 && snapshot.avg_latency_ms > self.thresholds.latency_critical_ms
        {
            notes.push(format!(
                "average latency {:.1}ms exceeds {:.0}ms; promote hot keys into the memory layer",
                snapshot.avg_latency_ms, self.thresholds.latency_critical_ms
            ));
        }
        if snapshot.operations > 0
            && snapshot.invalidation_frequency > self.thresholds.invalidation_frequency_max
        {
            notes.push(format!(
                "invalidation frequency {} is above {}; batch dependent updates or narrow rule patterns",
                format_percent(snapshot.invalidation_frequency),
                format_percent(self.thresholds.invalidation_frequency_max)
            ));
        }
        if snapshot.storage_efficiency < self.thresholds.storage_efficiency_minimum {
            notes.push(format!(
                "storage efficiency {} is below {} ({} cached); tighten write routing so cold entries skip caching",
                format_percent(snapshot.storage_efficiency),
                format_percent(self.thresholds.storage_efficiency_minimum),
                format_bytes(snapshot.storage_bytes)
            ));
        }
        notes
    }

    fn evaluate(&self) {
        let snapshot = self.snapshot();

        let checks = [
            (
                ThresholdKind::HitRate,
                snapshot.gets >= self.settings.min_get_samples
                    && snapshot.hit_rate < self.thresholds.hit_rate_minimum,
                AlertSeverity::Warning,
                format!(
                    "Low cache hit rate: {} (minimum {})",
                    format_percent(snapshot.hit_rate),
                    format_percent(self.thresholds.hit_rate_minimum)
                ),
            ),
            (
                ThresholdKind::Latency,
                snapshot.operations > 0
                    && snapshot.avg_latency_ms > self.thresholds.latency_critical_ms,
                AlertSeverity::Error,
                format!(
                    "High cache latency: {:.1}ms (critical {:.0}ms)",
                    snapshot.avg_latency_ms, self.thresholds.latency_critical_ms
                ),
            ),
            (
                ThresholdKind::InvalidationFrequency,
                snapshot.operations > 0
                    && snapshot.invalidation_frequency
                        > self.thresholds.invalidation_frequency_max,
                AlertSeverity::Warning,
                format!(
                    "High invalidation frequency: {} (maximum {})",
                    format_percent(snapshot.invalidation_frequency),
                    format_percent(self.thresholds.invalidation_frequency_max)
                ),
            ),
            (
                ThresholdKind::StorageEfficiency,
                snapshot.storage_efficiency < self.thresholds.storage_efficiency_minimum,
                AlertSeverity::Warning,
                format!(
                    "Low storage efficiency: {} (minimum {})",
                    format_percent(snapshot.storage_efficiency),
                    format_percent(self.thresholds.storage_efficiency_minimum)
                ),
            ),
        ];

        for (kind, breaching, severity, message) in checks {
            let mut breached = mutex_lock(&self.breached, SOURCE, "evaluate");
            if breaching {
                // Fire exactly once per ok→breach crossing.
                if breached.insert(kind) {
                    drop(breached);
                    self.fire(kind, severity, message, snapshot.clone());
                }
            } else {
                breached.remove(&kind);
            }
        }
    }

    fn fire(
        &self,
        kind: ThresholdKind,
        severity: AlertSeverity,
        message: String,
        snapshot: MetricsSnapshot,
    ) {
        let recommendations = self.recommendations(&snapshot);
        let alert = Alert {
            id: Uuid::new_v4(),
            severity,
            message,
            timestamp: OffsetDateTime::now_utc(),
            snapshot,
            recommendations,
        };

        info!(
            alert_id = %alert.id,
            threshold = kind.label(),
            severity = ?alert.severity,
            message = %alert.message,
            "Cache performance alert raised"
        );
        counter!(METRIC_ALERTS, "threshold" => kind.label()).increment(1);

        mutex_lock(&self.alerts, SOURCE, "fire").push(alert.clone());
        for listener in rw_read(&self.listeners, SOURCE, "fire.notify").iter() {
            listener(&alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::layer::LayerName;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(
            MonitorSettings {
                history_limit: 1000,
                window: Duration::from_secs(300),
                alert_max_age: Duration::from_secs(24 * 60 * 60),
                min_get_samples: 10,
            },
            ThresholdSettings::default(),
        )
    }

    fn record_get(monitor: &PerformanceMonitor, success: bool) {
        monitor.record_operation(
            OperationKind::Get,
            "computation:fib:10",
            Duration::from_millis(2),
            success,
            None,
        );
    }

    #[test]
    fn hit_rate_over_window() {
        let monitor = monitor();
        for _ in 0..8 {
            record_get(&monitor, true);
        }
        for _ in 0..2 {
            record_get(&monitor, false);
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.gets, 10);
        assert!((snapshot.hit_rate - 0.8).abs() < 1e-9);
        assert!((snapshot.miss_rate - 0.2).abs() < 1e-9);
        assert!(monitor.alerts().is_empty());
    }

    #[test]
    fn hit_rate_alert_fires_once_per_crossing() {
        let monitor = monitor();
        // 7 hits + 3 misses = 0.70, exactly at the minimum: no alert.
        for _ in 0..7 {
            record_get(&monitor, true);
        }
        for _ in 0..3 {
            record_get(&monitor, false);
        }
        assert!(monitor.alerts().is_empty());

        // 11th get misses: 7/11 < 0.70 crosses the threshold.
        record_get(&monitor, false);
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.starts_with("Low cache hit rate"));
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert!(!alerts[0].recommendations.is_empty());

        // Still breaching: no duplicate alert.
        record_get(&monitor, false);
        assert_eq!(monitor.alerts().len(), 1);
    }

    #[test]
    fn alert_rearms_after_recovery() {
        let monitor = monitor();
        for _ in 0..10 {
            record_get(&monitor, false);
        }
        assert_eq!(monitor.alerts().len(), 1);

        // Recover: enough hits to clear the breach.
        for _ in 0..40 {
            record_get(&monitor, true);
        }
        assert_eq!(monitor.alerts().len(), 1);

        // Breach again: a second alert fires.
        for _ in 0..60 {
            record_get(&monitor, false);
        }
        assert_eq!(monitor.alerts().len(), 2);
    }

    #[test]
    fn hit_rate_alert_needs_min_samples() {
        let monitor = monitor();
        for _ in 0..5 {
            record_get(&monitor, false);
        }
        assert!(monitor.alerts().is_empty());
    }

    #[test]
    fn latency_alert_is_error_severity() {
        let monitor = monitor();
        monitor.record_operation(
            OperationKind::Set,
            "computation:fib:10",
            Duration::from_millis(400),
            true,
            None,
        );

        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Error);
        assert!(alerts[0].message.starts_with("High cache latency"));
    }

    #[test]
    fn invalidation_frequency_alert() {
        let monitor = monitor();
        for _ in 0..8 {
            monitor.record_operation(
                OperationKind::Set,
                "preference:theme",
                Duration::from_millis(1),
                true,
                None,
            );
        }
        for _ in 0..2 {
            monitor.record_operation(
                OperationKind::Invalidate,
                "*",
                Duration::from_millis(1),
                true,
                None,
            );
        }

        let snapshot = monitor.snapshot();
        assert!((snapshot.invalidation_frequency - 0.2).abs() < 1e-9);
        assert!(
            monitor
                .alerts()
                .iter()
                .any(|a| a.message.starts_with("High invalidation frequency"))
        );
    }

    #[test]
    fn storage_efficiency_from_layer_stats() {
        let monitor = monitor();
        monitor.record_storage(&[LayerStats {
            name: LayerName::Memory,
            entries: 10,
            size_bytes: 0,
            hits: 0,
            misses: 0,
            touched_entries: 4,
            avg_latency_ms: 0.0,
        }]);

        let snapshot = monitor.snapshot();
        assert!((snapshot.storage_efficiency - 0.4).abs() < 1e-9);

        // Recording any operation evaluates the breach.
        record_get(&monitor, true);
        assert!(
            monitor
                .alerts()
                .iter()
                .any(|a| a.message.starts_with("Low storage efficiency"))
        );
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let monitor = PerformanceMonitor::new(
            MonitorSettings {
                history_limit: 5,
                window: Duration::from_secs(300),
                alert_max_age: Duration::from_secs(60),
                min_get_samples: 100,
            },
            ThresholdSettings::default(),
        );
        for _ in 0..8 {
            record_get(&monitor, true);
        }
        assert_eq!(monitor.snapshot().operations, 5);
    }

    #[test]
    fn listeners_notified_synchronously() {
        let monitor = monitor();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_listener = seen.clone();
        monitor.subscribe(Box::new(move |alert| {
            assert!(!alert.message.is_empty());
            seen_in_listener.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..10 {
            record_get(&monitor, false);
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn purge_and_clear_alerts() {
        let monitor = monitor();
        for _ in 0..10 {
            record_get(&monitor, false);
        }
        assert_eq!(monitor.alerts().len(), 1);

        // Fresh alerts survive the purge.
        assert_eq!(monitor.purge_aged(), 0);
        assert_eq!(monitor.alerts().len(), 1);

        monitor.clear_alerts();
        assert!(monitor.alerts().is_empty());
    }
}
