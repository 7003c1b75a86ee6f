//! Routing policy: which layers serve which operation for which key.
//!
//! Decisions are derived per call, never stored. Precedence, first match
//! wins: explicit caller hint, registered prefix rules, observed-frequency
//! promotion, then the defaults. With intelligent routing disabled only
//! the defaults apply.

use std::sync::RwLock;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::key::KeyPattern;
use crate::layer::LayerName;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "routing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
}

/// A registered key-pattern routing rule.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub pattern: KeyPattern,
    pub read_layers: Vec<LayerName>,
    pub write_layers: Vec<LayerName>,
}

/// The per-key/operation layer selection, fastest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub layers: Vec<LayerName>,
}

impl RoutePlan {
    fn new(mut layers: Vec<LayerName>) -> Self {
        layers.sort_by_key(LayerName::priority);
        layers.dedup();
        Self { layers }
    }

    pub fn includes(&self, name: LayerName) -> bool {
        self.layers.contains(&name)
    }

    /// Layers strictly faster than `source` within this plan, for promotion.
    pub fn faster_than(&self, source: LayerName) -> Vec<LayerName> {
        self.layers
            .iter()
            .copied()
            .filter(|layer| layer.priority() < source.priority())
            .collect()
    }
}

const DEFAULT_READ_LAYERS: [LayerName; 3] =
    [LayerName::Memory, LayerName::Persistent, LayerName::Worker];
const DEFAULT_WRITE_LAYERS: [LayerName; 1] = [LayerName::Persistent];

/// Built-in prefix rules for the collaborator namespaces.
///
/// Computation results skip memory on write so cold results do not pollute
/// the LRU; frequency promotion pulls the hot ones in on read.
static DEFAULT_RULES: Lazy<Vec<RoutingRule>> = Lazy::new(|| {
    vec![
        RoutingRule {
            pattern: KeyPattern::prefix("computation:"),
            read_layers: vec![LayerName::Memory, LayerName::Persistent, LayerName::Worker],
            write_layers: vec![LayerName::Persistent, LayerName::Worker],
        },
        RoutingRule {
            pattern: KeyPattern::prefix("visualization:"),
            read_layers: vec![LayerName::Memory, LayerName::Persistent, LayerName::Worker],
            write_layers: vec![LayerName::Persistent, LayerName::Worker],
        },
        RoutingRule {
            pattern: KeyPattern::prefix("preference:"),
            read_layers: vec![LayerName::Memory, LayerName::Persistent],
            write_layers: vec![LayerName::Memory, LayerName::Persistent],
        },
        RoutingRule {
            pattern: KeyPattern::prefix("static:"),
            read_layers: vec![LayerName::Worker, LayerName::Edge],
            write_layers: vec![LayerName::Worker, LayerName::Edge],
        },
    ]
});

pub struct RoutingPolicy {
    rules: RwLock<Vec<RoutingRule>>,
    /// Per-session access counts driving frequency promotion.
    access_counts: DashMap<String, u32>,
    promote_after: u32,
    intelligent: bool,
}

impl RoutingPolicy {
    pub fn new(intelligent: bool, promote_after: u32) -> Self {
        Self {
            rules: RwLock::new(DEFAULT_RULES.clone()),
            access_counts: DashMap::new(),
            promote_after,
            intelligent,
        }
    }

    /// Register a rule ahead of the built-ins (later registrations win).
    pub fn install_rule(&self, rule: RoutingRule) {
        rw_write(&self.rules, SOURCE, "install_rule").insert(0, rule);
    }

    /// Count an access for frequency promotion; returns the running total.
    pub fn note_access(&self, key: &str) -> u32 {
        let mut count = self.access_counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget session access counts (session boundary).
    pub fn reset_session(&self) {
        self.access_counts.clear();
    }

    /// Compute the plan for one operation on one key.
    pub fn plan(&self, key: &str, operation: Operation, hint: Option<&[LayerName]>) -> RoutePlan {
        if let Some(layers) = hint {
            return RoutePlan::new(layers.to_vec());
        }

        if !self.intelligent {
            return self.default_plan(operation);
        }

        let rules = rw_read(&self.rules, SOURCE, "plan");
        let matched = rules.iter().find(|rule| rule.pattern.matches(key));
        let mut layers = match (matched, operation) {
            (Some(rule), Operation::Get) => rule.read_layers.clone(),
            (Some(rule), Operation::Set) => rule.write_layers.clone(),
            (None, Operation::Get) => DEFAULT_READ_LAYERS.to_vec(),
            (None, Operation::Set) => DEFAULT_WRITE_LAYERS.to_vec(),
        };
        drop(rules);

        if operation == Operation::Get
            && !layers.contains(&LayerName::Memory)
            && self.is_hot(key)
        {
            layers.push(LayerName::Memory);
        }

        RoutePlan::new(layers)
    }

    fn default_plan(&self, operation: Operation) -> RoutePlan {
        match operation {
            Operation::Get => RoutePlan::new(DEFAULT_READ_LAYERS.to_vec()),
            Operation::Set => RoutePlan::new(DEFAULT_WRITE_LAYERS.to_vec()),
        }
    }

    fn is_hot(&self, key: &str) -> bool {
        self.access_counts
            .get(key)
            .is_some_and(|count| *count >= self.promote_after)
    }
}
