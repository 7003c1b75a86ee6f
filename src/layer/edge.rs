//! Remote edge cache layer.
//!
//! Thin HTTP client for the CDN-adjacent cache service. Keys are addressed
//! by their SHA-256 digest so arbitrary key characters never reach a URL
//! path. The slowest layer, and the only one with its own I/O timeout;
//! timeouts surface as layer-local faults, never as coordinator failures.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::LayerError;
use crate::key::{KeyPattern, edge_digest};
use crate::layer::{CacheLayer, LayerCounters, LayerName, LayerStats};
use crate::value::CacheEntry;

#[derive(Debug, Deserialize)]
struct InvalidateResponse {
    #[serde(default)]
    removed: usize,
}

pub struct EdgeLayer {
    client: reqwest::Client,
    base: Url,
    counters: LayerCounters,
}

impl EdgeLayer {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, LayerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LayerError::remote(format!("client construction failed: {err}")))?;

        // `Url::join` replaces the last path segment unless the base ends
        // with a slash.
        let mut base = endpoint;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        Ok(Self {
            client,
            base,
            counters: LayerCounters::default(),
        })
    }

    fn entry_url(&self, key: &str) -> Result<Url, LayerError> {
        self.base
            .join(&format!("entries/{}", edge_digest(key)))
            .map_err(|err| LayerError::remote(format!("bad entry url: {err}")))
    }

    fn invalidate_url(&self) -> Result<Url, LayerError> {
        self.base
            .join("invalidate")
            .map_err(|err| LayerError::remote(format!("bad invalidate url: {err}")))
    }
}

#[async_trait]
impl CacheLayer for EdgeLayer {
    fn name(&self) -> LayerName {
        LayerName::Edge
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, LayerError> {
        let started = Instant::now();
        let url = self.entry_url(key)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| LayerError::remote(format!("get failed: {err}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                self.counters.record_miss(started.elapsed());
                Ok(None)
            }
            status if status.is_success() => {
                let entry = response
                    .json::<CacheEntry>()
                    .await
                    .map_err(|err| LayerError::remote(format!("get body unreadable: {err}")))?;
                self.counters.record_hit(started.elapsed());
                Ok(Some(entry))
            }
            status => Err(LayerError::remote(format!("get returned {status}"))),
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), LayerError> {
        let url = self.entry_url(&entry.key)?;
        let response = self
            .client
            .put(url)
            .json(&entry)
            .send()
            .await
            .map_err(|err| LayerError::remote(format!("set failed: {err}")))?;

        if !response.status().is_success() {
            return Err(LayerError::remote(format!(
                "set returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, LayerError> {
        let url = self.invalidate_url()?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "pattern": pattern.to_string() }))
            .send()
            .await
            .map_err(|err| LayerError::remote(format!("invalidate failed: {err}")))?;

        if !response.status().is_success() {
            return Err(LayerError::remote(format!(
                "invalidate returned {}",
                response.status()
            )));
        }

        // Older edge deployments return an empty body; treat that as zero.
        Ok(response
            .json::<InvalidateResponse>()
            .await
            .map(|body| body.removed)
            .unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), LayerError> {
        self.invalidate(&KeyPattern::All).await.map(|_| ())
    }

    fn stats(&self) -> LayerStats {
        // Entry counts live on the remote service; only local lookup
        // bookkeeping is reported here.
        LayerStats {
            name: LayerName::Edge,
            entries: 0,
            size_bytes: 0,
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            touched_entries: 0,
            avg_latency_ms: self.counters.avg_latency_ms(),
        }
    }
}
