//! Cache key conventions.
//!
//! Keys are plain strings namespaced by a collaborator prefix
//! (`computation:`, `visualization:`, `preference:`, `static:`,
//! `documentation:`). This module defines the resource taxonomy derived
//! from those prefixes, the pattern language used by invalidation, and
//! the hashing helpers shared by the layers.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The kind of content a key addresses, sniffed from its prefix.
///
/// Routing and warming switch on this instead of inspecting payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Results from the mathematical algorithm libraries.
    Computation,
    /// Rendered visualization state.
    Visualization,
    /// Rendered documentation content.
    Documentation,
    /// Per-user preferences.
    Preference,
    /// Immutable static assets.
    Static,
    /// Anything without a recognized prefix.
    Opaque,
}

impl ResourceKind {
    /// Derive the kind from a key's namespace prefix.
    pub fn from_key(key: &str) -> Self {
        match key.split(':').next() {
            Some("computation") => Self::Computation,
            Some("visualization") => Self::Visualization,
            Some("documentation") => Self::Documentation,
            Some("preference") => Self::Preference,
            Some("static") => Self::Static,
            _ => Self::Opaque,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Computation => "computation",
            Self::Visualization => "visualization",
            Self::Documentation => "documentation",
            Self::Preference => "preference",
            Self::Static => "static",
            Self::Opaque => "opaque",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pattern language for invalidation and routing rules.
///
/// Three forms: the match-everything `*`, exact literals, and globs where
/// `*` matches any run of characters (`computation:fib:*`,
/// `*:landscape:*`). Parsed once at registration, matched many times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// Matches every key.
    All,
    /// Matches exactly one key.
    Literal(String),
    /// Glob split on `*`: leading/trailing fragments anchor, middle
    /// fragments must appear in order.
    Glob(Vec<String>),
}

impl KeyPattern {
    /// Parse a raw pattern string.
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            return Self::All;
        }
        if !raw.contains('*') {
            return Self::Literal(raw.to_string());
        }
        Self::Glob(raw.split('*').map(str::to_string).collect())
    }

    /// Convenience constructor for a `prefix*` glob.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Glob(vec![prefix.into(), String::new()])
    }

    /// Whether this pattern matches the given key.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Literal(literal) => literal == key,
            Self::Glob(fragments) => glob_match(fragments, key),
        }
    }

    /// Whether this pattern can match anything under a key namespace.
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Literal(literal) => f.write_str(literal),
            Self::Glob(fragments) => f.write_str(&fragments.join("*")),
        }
    }
}

fn glob_match(fragments: &[String], key: &str) -> bool {
    debug_assert!(fragments.len() >= 2);

    let first = &fragments[0];
    let last = &fragments[fragments.len() - 1];
    let Some(mut rest) = key.strip_prefix(first.as_str()) else {
        return false;
    };

    // Middle fragments consume greedily left-to-right.
    for fragment in &fragments[1..fragments.len() - 1] {
        if fragment.is_empty() {
            continue;
        }
        match rest.find(fragment.as_str()) {
            Some(idx) => rest = &rest[idx + fragment.len()..],
            None => return false,
        }
    }

    rest.ends_with(last.as_str())
}

/// Cheap non-cryptographic key hash for in-process bucketing.
pub fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Stable hex digest used to address keys on the remote edge cache.
pub fn edge_digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
