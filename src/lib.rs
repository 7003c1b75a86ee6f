//! Lemma cache engine
//!
//! Adaptive multi-layer cache coordination for the Lemma mathematics
//! learning platform. Four storage layers of increasing latency and
//! durability sit behind one get/set/invalidate API:
//!
//! - **memory**: in-process LRU (fastest, volatile)
//! - **persistent**: local durable JSON-file store
//! - **worker**: background execution context with offline grace
//! - **edge**: remote edge cache over HTTP (optional)
//!
//! The [`CacheCoordinator`] routes each operation across layers, promotes
//! hits upward, and composes the supporting engines: the
//! [`monitor::PerformanceMonitor`] (rolling metrics and alerting), the
//! [`invalidation::InvalidationEngine`] (dependency-aware, serialized
//! batches), and the [`warming::WarmingEngine`] (predictive pre-population
//! from navigation history).
//!
//! ## Configuration
//!
//! Behavior is controlled via `lemma.toml` with `LEMMA_*` environment
//! overrides:
//!
//! ```toml
//! [cache]
//! enable_intelligent_routing = true
//! memory_capacity = 512
//! # ... see config.rs for all options
//! ```
//!
//! Payloads are opaque to the engine: algorithm results, visualization
//! state, documentation, and preferences are carried as a tagged
//! [`CacheValue`] so routing can switch on kind without inspecting content.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod layer;
pub mod monitor;
pub mod routing;
pub mod telemetry;
pub mod util;
pub mod value;
pub mod warming;

mod lock;

pub use config::Settings;
pub use coordinator::{CacheCoordinator, GetOptions, Lookup, PerformanceReport, SetOptions, SetOutcome};
pub use error::{EngineError, LayerError};
pub use key::{KeyPattern, ResourceKind};
pub use layer::{CacheLayer, LayerName, LayerSet, LayerStats};
pub use value::{CacheEntry, CacheValue, VersionMarker};
