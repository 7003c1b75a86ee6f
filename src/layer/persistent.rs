//! Local persistent layer.
//!
//! A durable JSON-file store: the working set lives in memory and every
//! mutation rewrites `store.json` atomically (write temp, rename). Survives
//! process restarts; read-path access metadata is deliberately not flushed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::LayerError;
use crate::key::KeyPattern;
use crate::layer::{CacheLayer, LayerCounters, LayerName, LayerStats};
use crate::value::CacheEntry;

const STORE_FILE: &str = "store.json";
const STORE_TMP_FILE: &str = "store.json.tmp";

pub struct PersistentLayer {
    dir: PathBuf,
    /// Keeps an ephemeral directory alive when no path was configured.
    _ephemeral: Option<TempDir>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    counters: LayerCounters,
}

impl PersistentLayer {
    /// Open (or create) a store under `dir`, loading any surviving entries.
    ///
    /// A corrupt store file is logged and rebuilt empty rather than failing
    /// coordinator startup.
    pub async fn open(dir: &Path) -> Result<Self, LayerError> {
        tokio::fs::create_dir_all(dir).await?;

        let store_path = dir.join(STORE_FILE);
        let entries = match tokio::fs::read(&store_path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, CacheEntry>>(&bytes) {
                Ok(map) => {
                    debug!(entries = map.len(), path = %store_path.display(), "persistent store loaded");
                    map
                }
                Err(err) => {
                    warn!(
                        path = %store_path.display(),
                        error = %err,
                        "persistent store unreadable, rebuilding empty"
                    );
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            _ephemeral: None,
            entries: RwLock::new(entries),
            counters: LayerCounters::default(),
        })
    }

    /// Open a store backed by a temp directory that lives as long as the
    /// layer. Used when no `persistent_dir` is configured (dev profile).
    pub async fn open_ephemeral() -> Result<Self, LayerError> {
        let tempdir = TempDir::new()?;
        let mut layer = Self::open(tempdir.path()).await?;
        layer._ephemeral = Some(tempdir);
        Ok(layer)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), LayerError> {
        let bytes = serde_json::to_vec(entries)?;
        let tmp_path = self.dir.join(STORE_TMP_FILE);
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, self.dir.join(STORE_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheLayer for PersistentLayer {
    fn name(&self) -> LayerName {
        LayerName::Persistent
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, LayerError> {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();

        let mut entries = self.entries.write().await;
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
            entries.remove(key);
            let snapshot = entries.clone();
            drop(entries);
            // Expiry mutates durable state; access counters do not.
            self.persist(&snapshot).await?;
        } else {
            drop(entries);
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
        let mut entries = self.entries.write().await;
        entries.insert(entry.key.clone(), entry);
        let snapshot = entries.clone();
        drop(entries);
        self.persist(&snapshot).await
    }

    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, LayerError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        let removed = before - entries.len();
        if removed == 0 {
            return Ok(0);
        }
        let snapshot = entries.clone();
        drop(entries);
        self.persist(&snapshot).await?;
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), LayerError> {
        let mut entries = self.entries.write().await;
        entries.clear();
        let snapshot = entries.clone();
        drop(entries);
        self.persist(&snapshot).await
    }

    fn stats(&self) -> LayerStats {
        // stats() is sync by contract; try_read keeps it non-blocking and
        // reports zeros in the rare case the store is mid-mutation.
        let (entries, size_bytes, touched) = match self.entries.try_read() {
            Ok(map) => {
                let mut size = 0;
                let mut touched = 0;
                for entry in map.values() {
                    size += entry.size_bytes;
                    if entry.access_count > 0 {
                        touched += 1;
                    }
                }
                (map.len() as u64, size, touched)
            }
            Err(_) => (0, 0, 0),
        };

        LayerStats {
            name: LayerName::Persistent,
            entries,
            size_bytes,
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            touched_entries: touched,
            avg_latency_ms: self.counters.avg_latency_ms(),
        }
    }
}
