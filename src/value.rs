//! Cached payload and entry types.
//!
//! Payloads are a tagged union over the known collaborator kinds plus an
//! opaque-bytes fallback, so routing and warming can switch on kind
//! without downcasting. The engine never interprets the inner JSON.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::key::ResourceKind;

/// A cached payload.
///
/// The `Computation` and `Visualization` shapes mirror what the algorithm
/// and rendering collaborators hand to `set`; their inner values stay
/// opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheValue {
    Computation {
        algorithm: String,
        input: serde_json::Value,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        metadata: serde_json::Value,
    },
    Visualization {
        visualization: String,
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        render_options: serde_json::Value,
    },
    Document {
        format: String,
        body: String,
    },
    Preference {
        value: serde_json::Value,
    },
    Opaque {
        content_type: String,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },
}

impl CacheValue {
    /// The resource kind this payload belongs to.
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::Computation { .. } => ResourceKind::Computation,
            Self::Visualization { .. } => ResourceKind::Visualization,
            Self::Document { .. } => ResourceKind::Documentation,
            Self::Preference { .. } => ResourceKind::Preference,
            Self::Opaque { .. } => ResourceKind::Opaque,
        }
    }

    /// Serialized footprint estimate, used for entry accounting.
    pub fn estimated_size(&self) -> u64 {
        match self {
            Self::Opaque {
                content_type,
                payload,
            } => (content_type.len() + payload.len()) as u64,
            other => serde_json::to_vec(other).map(|v| v.len() as u64).unwrap_or(0),
        }
    }

    /// Synthetic stand-in written by the warming engine when no loader can
    /// produce the real value for a predicted key.
    pub fn placeholder(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Computation => Self::Computation {
                algorithm: String::new(),
                input: serde_json::Value::Null,
                result: serde_json::Value::Null,
                metadata: serde_json::json!({ "warmed": true }),
            },
            ResourceKind::Visualization => Self::Visualization {
                visualization: String::new(),
                data: serde_json::Value::Null,
                render_options: serde_json::json!({ "warmed": true }),
            },
            ResourceKind::Documentation => Self::Document {
                format: "markdown".to_string(),
                body: String::new(),
            },
            ResourceKind::Preference => Self::Preference {
                value: serde_json::Value::Null,
            },
            ResourceKind::Static | ResourceKind::Opaque => Self::Opaque {
                content_type: "application/octet-stream".to_string(),
                payload: Bytes::new(),
            },
        }
    }

    /// Whether this value is a warming placeholder rather than real content.
    pub fn is_placeholder(&self) -> bool {
        match self {
            Self::Computation { algorithm, result, .. } => {
                algorithm.is_empty() && result.is_null()
            }
            Self::Visualization { visualization, data, .. } => {
                visualization.is_empty() && data.is_null()
            }
            Self::Document { body, .. } => body.is_empty(),
            Self::Preference { value } => value.is_null(),
            Self::Opaque { payload, .. } => payload.is_empty(),
        }
    }
}

/// One cached entry, owned by whichever layer stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
    pub access_count: u32,
    pub size_bytes: u64,
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    /// Build a fresh entry stamped at `now`.
    pub fn new(key: impl Into<String>, value: CacheValue, ttl: Option<Duration>) -> Self {
        let now = OffsetDateTime::now_utc();
        let size_bytes = value.estimated_size();
        Self {
            key: key.into(),
            value,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size_bytes,
            ttl,
        }
    }

    /// Whether the entry's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match self.ttl {
            Some(ttl) => now >= self.created_at + ttl,
            None => false,
        }
    }

    /// How long past expiry the entry is at `now`, if expired at all.
    pub fn expired_for(&self, now: OffsetDateTime) -> Option<Duration> {
        let ttl = self.ttl?;
        let deadline = self.created_at + ttl;
        if now < deadline {
            return None;
        }
        Duration::try_from(now - deadline).ok()
    }

    /// Record a read.
    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_accessed = now;
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// Cross-layer version marker consulted by eager invalidation.
///
/// The only artifact persisted outside the layers themselves; a mismatch
/// against the registered current version clears every layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub app_id: String,
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub breaking_changes: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl VersionMarker {
    pub fn new(app_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            version: version.into(),
            dependencies: Vec::new(),
            breaking_changes: false,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn breaking(mut self) -> Self {
        self.breaking_changes = true;
        self
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}
