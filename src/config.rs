//! Configuration layer: typed settings with layered precedence (file → env).
//!
//! A `lemma.toml` next to the host application (or an explicit path) is
//! merged with `LEMMA_*` environment overrides and resolved into validated
//! `Settings`. Every knob has a named default.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::error::EngineError;

const LOCAL_CONFIG_BASENAME: &str = "lemma";
const ENV_PREFIX: &str = "LEMMA";

const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_PROMOTE_AFTER_ACCESSES: u32 = 3;
const DEFAULT_MEMORY_CAPACITY: usize = 512;
const DEFAULT_WORKER_GRACE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_EDGE_TIMEOUT_MS: u64 = 2_000;

const DEFAULT_HIT_RATE_MINIMUM: f64 = 0.7;
const DEFAULT_LATENCY_CRITICAL_MS: f64 = 50.0;
const DEFAULT_INVALIDATION_FREQUENCY_MAX: f64 = 0.1;
const DEFAULT_STORAGE_EFFICIENCY_MINIMUM: f64 = 0.8;

const DEFAULT_WARMING_HISTORY_LIMIT: usize = 200;
const DEFAULT_WARMING_TRIGGER_LEN: usize = 25;
const DEFAULT_WARMING_MAX_PREDICTIONS: usize = 20;
const DEFAULT_WARMING_MIN_CONFIDENCE: f64 = 0.6;
const DEFAULT_WARMING_FREQUENT_FLOOR: u32 = 3;
const DEFAULT_WARMING_SESSION_HISTORY: usize = 50;

const DEFAULT_MONITOR_HISTORY_LIMIT: usize = 1_000;
const DEFAULT_MONITOR_WINDOW_SECS: u64 = 300;
const DEFAULT_ALERT_MAX_AGE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_MONITOR_MIN_GET_SAMPLES: usize = 10;

/// Fully-resolved engine settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub thresholds: ThresholdSettings,
    pub warming: WarmingSettings,
    pub monitor: MonitorSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// TTL applied to entries written without an explicit one.
    pub default_ttl: Option<Duration>,
    /// Pattern/frequency routing; off collapses to the default plans.
    pub enable_intelligent_routing: bool,
    /// Upward write-through of hits (promotion).
    pub enable_layer_synchronization: bool,
    /// Session access count after which a key is promoted into memory.
    pub promote_after_accesses: u32,
    /// Memory layer LRU capacity.
    pub memory_capacity: NonZeroUsize,
    /// Persistent layer directory; `None` uses an ephemeral temp directory.
    pub persistent_dir: Option<PathBuf>,
    /// How long the worker layer serves entries past expiry (offline grace).
    pub worker_grace: Duration,
    /// Remote edge cache endpoint; the edge layer exists only when set.
    pub edge_endpoint: Option<Url>,
    /// Per-request timeout for the edge layer.
    pub edge_timeout: Duration,
}

/// Alert thresholds evaluated by the performance monitor.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdSettings {
    pub hit_rate_minimum: f64,
    pub latency_critical_ms: f64,
    pub invalidation_frequency_max: f64,
    pub storage_efficiency_minimum: f64,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            hit_rate_minimum: DEFAULT_HIT_RATE_MINIMUM,
            latency_critical_ms: DEFAULT_LATENCY_CRITICAL_MS,
            invalidation_frequency_max: DEFAULT_INVALIDATION_FREQUENCY_MAX,
            storage_efficiency_minimum: DEFAULT_STORAGE_EFFICIENCY_MINIMUM,
        }
    }
}

/// A daily time-of-day window in the configured timezone, end-exclusive.
/// Windows may wrap midnight (`start_hour > end_hour`).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WarmingWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl WarmingWindow {
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarmingSettings {
    /// Navigation history bound (most-recent-N accesses).
    pub history_limit: usize,
    /// History length that triggers a session outside any time window.
    pub trigger_history_len: usize,
    /// Time-of-day windows during which sessions may auto-start.
    pub windows: Vec<WarmingWindow>,
    /// Timezone the windows are evaluated in.
    pub timezone: Tz,
    /// Cap on predictions warmed per session.
    pub max_predictions: usize,
    /// Successor predictions below this confidence are discarded.
    pub min_confidence: f64,
    /// Minimum access count before a key counts as "frequently used".
    pub frequent_key_floor: u32,
    /// Completed-session history bound.
    pub session_history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Metric ring buffer capacity.
    pub history_limit: usize,
    /// Sliding window for derived rates.
    pub window: Duration,
    /// Alerts older than this are purged by the sweep.
    pub alert_max_age: Duration,
    /// Gets required in-window before hit-rate alerting arms.
    pub min_get_samples: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheSettings {
                default_ttl: Some(Duration::from_secs(DEFAULT_TTL_SECS)),
                enable_intelligent_routing: true,
                enable_layer_synchronization: true,
                promote_after_accesses: DEFAULT_PROMOTE_AFTER_ACCESSES,
                memory_capacity: NonZeroUsize::new(DEFAULT_MEMORY_CAPACITY)
                    .unwrap_or(NonZeroUsize::MIN),
                persistent_dir: None,
                worker_grace: Duration::from_secs(DEFAULT_WORKER_GRACE_SECS),
                edge_endpoint: None,
                edge_timeout: Duration::from_millis(DEFAULT_EDGE_TIMEOUT_MS),
            },
            thresholds: ThresholdSettings::default(),
            warming: WarmingSettings {
                history_limit: DEFAULT_WARMING_HISTORY_LIMIT,
                trigger_history_len: DEFAULT_WARMING_TRIGGER_LEN,
                windows: Vec::new(),
                timezone: Tz::UTC,
                max_predictions: DEFAULT_WARMING_MAX_PREDICTIONS,
                min_confidence: DEFAULT_WARMING_MIN_CONFIDENCE,
                frequent_key_floor: DEFAULT_WARMING_FREQUENT_FLOOR,
                session_history_limit: DEFAULT_WARMING_SESSION_HISTORY,
            },
            monitor: MonitorSettings {
                history_limit: DEFAULT_MONITOR_HISTORY_LIMIT,
                window: Duration::from_secs(DEFAULT_MONITOR_WINDOW_SECS),
                alert_max_age: Duration::from_secs(DEFAULT_ALERT_MAX_AGE_SECS),
                min_get_samples: DEFAULT_MONITOR_MIN_GET_SAMPLES,
            },
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
        }
    }
}

impl Settings {
    /// Load settings with layered precedence: optional file, then `LEMMA_*`
    /// environment overrides (`LEMMA_CACHE__MEMORY_CAPACITY=1024`).
    pub fn load(config_file: Option<&Path>) -> Result<Self, EngineError> {
        let mut builder = Config::builder();
        builder = match config_file {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let raw: RawSettings = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|err| EngineError::configuration(err.to_string()))?;
        raw.resolve()
    }
}

// ============================================================================
// Raw (pre-validation) shapes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    thresholds: RawThresholdSettings,
    warming: RawWarmingSettings,
    monitor: RawMonitorSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawCacheSettings {
    default_ttl_secs: u64,
    enable_intelligent_routing: bool,
    enable_layer_synchronization: bool,
    promote_after_accesses: u32,
    memory_capacity: usize,
    persistent_dir: Option<PathBuf>,
    worker_grace_secs: u64,
    edge_endpoint: Option<String>,
    edge_timeout_ms: u64,
}

impl Default for RawCacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            enable_intelligent_routing: true,
            enable_layer_synchronization: true,
            promote_after_accesses: DEFAULT_PROMOTE_AFTER_ACCESSES,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            persistent_dir: None,
            worker_grace_secs: DEFAULT_WORKER_GRACE_SECS,
            edge_endpoint: None,
            edge_timeout_ms: DEFAULT_EDGE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawThresholdSettings {
    hit_rate_minimum: f64,
    latency_critical_ms: f64,
    invalidation_frequency_max: f64,
    storage_efficiency_minimum: f64,
}

impl Default for RawThresholdSettings {
    fn default() -> Self {
        let defaults = ThresholdSettings::default();
        Self {
            hit_rate_minimum: defaults.hit_rate_minimum,
            latency_critical_ms: defaults.latency_critical_ms,
            invalidation_frequency_max: defaults.invalidation_frequency_max,
            storage_efficiency_minimum: defaults.storage_efficiency_minimum,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawWarmingSettings {
    history_limit: usize,
    trigger_history_len: usize,
    windows: Vec<WarmingWindow>,
    timezone: Tz,
    max_predictions: usize,
    min_confidence: f64,
    frequent_key_floor: u32,
    session_history_limit: usize,
}

impl Default for RawWarmingSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_WARMING_HISTORY_LIMIT,
            trigger_history_len: DEFAULT_WARMING_TRIGGER_LEN,
            windows: Vec::new(),
            timezone: Tz::UTC,
            max_predictions: DEFAULT_WARMING_MAX_PREDICTIONS,
            min_confidence: DEFAULT_WARMING_MIN_CONFIDENCE,
            frequent_key_floor: DEFAULT_WARMING_FREQUENT_FLOOR,
            session_history_limit: DEFAULT_WARMING_SESSION_HISTORY,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawMonitorSettings {
    history_limit: usize,
    window_secs: u64,
    alert_max_age_secs: u64,
    min_get_samples: usize,
}

impl Default for RawMonitorSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_MONITOR_HISTORY_LIMIT,
            window_secs: DEFAULT_MONITOR_WINDOW_SECS,
            alert_max_age_secs: DEFAULT_ALERT_MAX_AGE_SECS,
            min_get_samples: DEFAULT_MONITOR_MIN_GET_SAMPLES,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawLoggingSettings {
    level: String,
    json: bool,
}

impl Default for RawLoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RawSettings {
    fn resolve(self) -> Result<Settings, EngineError> {
        let memory_capacity = NonZeroUsize::new(self.cache.memory_capacity)
            .ok_or_else(|| EngineError::configuration("cache.memory_capacity must be > 0"))?;

        let edge_endpoint = self
            .cache
            .edge_endpoint
            .map(|raw| {
                Url::parse(&raw).map_err(|err| {
                    EngineError::configuration(format!("cache.edge_endpoint is not a URL: {err}"))
                })
            })
            .transpose()?;

        for ratio in [
            ("thresholds.hit_rate_minimum", self.thresholds.hit_rate_minimum),
            (
                "thresholds.invalidation_frequency_max",
                self.thresholds.invalidation_frequency_max,
            ),
            (
                "thresholds.storage_efficiency_minimum",
                self.thresholds.storage_efficiency_minimum,
            ),
            ("warming.min_confidence", self.warming.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&ratio.1) {
                return Err(EngineError::configuration(format!(
                    "{} must be within [0, 1], got {}",
                    ratio.0, ratio.1
                )));
            }
        }

        for window in &self.warming.windows {
            if window.start_hour > 23 || window.end_hour > 23 {
                return Err(EngineError::configuration(format!(
                    "warming window hours must be within [0, 23], got {}..{}",
                    window.start_hour, window.end_hour
                )));
            }
        }

        let level = LevelFilter::from_str(&self.logging.level).map_err(|_| {
            EngineError::configuration(format!("unknown log level `{}`", self.logging.level))
        })?;

        Ok(Settings {
            cache: CacheSettings {
                default_ttl: match self.cache.default_ttl_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                enable_intelligent_routing: self.cache.enable_intelligent_routing,
                enable_layer_synchronization: self.cache.enable_layer_synchronization,
                promote_after_accesses: self.cache.promote_after_accesses,
                memory_capacity,
                persistent_dir: self.cache.persistent_dir,
                worker_grace: Duration::from_secs(self.cache.worker_grace_secs),
                edge_endpoint,
                edge_timeout: Duration::from_millis(self.cache.edge_timeout_ms),
            },
            thresholds: ThresholdSettings {
                hit_rate_minimum: self.thresholds.hit_rate_minimum,
                latency_critical_ms: self.thresholds.latency_critical_ms,
                invalidation_frequency_max: self.thresholds.invalidation_frequency_max,
                storage_efficiency_minimum: self.thresholds.storage_efficiency_minimum,
            },
            warming: WarmingSettings {
                history_limit: self.warming.history_limit.max(1),
                trigger_history_len: self.warming.trigger_history_len.max(1),
                windows: self.warming.windows,
                timezone: self.warming.timezone,
                max_predictions: self.warming.max_predictions,
                min_confidence: self.warming.min_confidence,
                frequent_key_floor: self.warming.frequent_key_floor.max(1),
                session_history_limit: self.warming.session_history_limit.max(1),
            },
            monitor: MonitorSettings {
                history_limit: self.monitor.history_limit.max(1),
                window: Duration::from_secs(self.monitor.window_secs.max(1)),
                alert_max_age: Duration::from_secs(self.monitor.alert_max_age_secs.max(1)),
                min_get_samples: self.monitor.min_get_samples,
            },
            logging: LoggingSettings {
                level,
                format: if self.logging.json {
                    LogFormat::Json
                } else {
                    LogFormat::Compact
                },
            },
        })
    }
}
