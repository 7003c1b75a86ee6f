//! Prediction mining over navigation history.
//!
//! Pure derivation: given the bounded history and the per-key frequency
//! counters, produce ranked predictions of near-future accesses. No state,
//! no I/O; the engine owns both inputs.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use time::OffsetDateTime;

use crate::key::ResourceKind;

/// Confidence ceiling: mined evidence never claims certainty.
const CONFIDENCE_CAP: f64 = 0.95;
/// Successor predictions are expected within this horizon.
const SUCCESSOR_HORIZON_SECS: u64 = 30;
/// Frequency predictions are a weaker, slower signal.
const FREQUENCY_HORIZON_SECS: u64 = 120;

const PRIORITY_TRIGRAM: u8 = 3;
const PRIORITY_BIGRAM: u8 = 2;
const PRIORITY_FREQUENT: u8 = 1;

/// One predicted near-future access. Ephemeral; discarded with the session.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub key: String,
    pub confidence: f64,
    pub priority: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub estimated_access_time: OffsetDateTime,
    pub resource_kind: ResourceKind,
}

/// Successors of the most recent key, mined from repeated length-2/3
/// subsequences. A successor seen after the current length-2 context gets
/// the trigram priority.
pub(crate) fn successor_predictions(
    history: &[String],
    min_confidence: f64,
    now: OffsetDateTime,
) -> Vec<Prediction> {
    let Some(last) = history.last() else {
        return Vec::new();
    };

    let mut follows: HashMap<&str, u32> = HashMap::new();
    let mut last_seen_with_successor = 0u32;
    for window in history.windows(2) {
        if window[0] == *last {
            last_seen_with_successor += 1;
            *follows.entry(window[1].as_str()).or_insert(0) += 1;
        }
    }
    if last_seen_with_successor == 0 {
        return Vec::new();
    }

    // Keys that followed the exact (prev, last) context before.
    let mut trigram_successors: HashSet<&str> = HashSet::new();
    if history.len() >= 2 {
        let prev = &history[history.len() - 2];
        for window in history.windows(3) {
            if window[0] == *prev && window[1] == *last {
                trigram_successors.insert(window[2].as_str());
            }
        }
    }

    let mut predictions = Vec::new();
    for (successor, count) in follows {
        let confidence =
            (count as f64 / last_seen_with_successor as f64).min(CONFIDENCE_CAP);
        if confidence <= min_confidence {
            continue;
        }
        predictions.push(Prediction {
            key: successor.to_string(),
            confidence,
            priority: if trigram_successors.contains(successor) {
                PRIORITY_TRIGRAM
            } else {
                PRIORITY_BIGRAM
            },
            estimated_access_time: now + std::time::Duration::from_secs(SUCCESSOR_HORIZON_SECS),
            resource_kind: ResourceKind::from_key(successor),
        });
    }
    predictions
}

/// Frequently-used keys, with access counts normalized into confidence.
pub(crate) fn frequency_predictions(
    frequencies: &HashMap<String, u32>,
    floor: u32,
    now: OffsetDateTime,
) -> Vec<Prediction> {
    let Some(max) = frequencies.values().copied().max().filter(|max| *max > 0) else {
        return Vec::new();
    };

    frequencies
        .iter()
        .filter(|(_, count)| **count >= floor)
        .map(|(key, count)| Prediction {
            key: key.clone(),
            confidence: (*count as f64 / max as f64).min(CONFIDENCE_CAP),
            priority: PRIORITY_FREQUENT,
            estimated_access_time: now + std::time::Duration::from_secs(FREQUENCY_HORIZON_SECS),
            resource_kind: ResourceKind::from_key(key),
        })
        .collect()
}

/// Deduplicate by key (keeping the strongest claim), order by priority then
/// confidence, and cap the list.
pub(crate) fn rank(predictions: Vec<Prediction>, limit: usize) -> Vec<Prediction> {
    let mut best: HashMap<String, Prediction> = HashMap::new();
    for prediction in predictions {
        match best.get(&prediction.key) {
            Some(existing)
                if (existing.priority, existing.confidence)
                    >= (prediction.priority, prediction.confidence) => {}
            _ => {
                best.insert(prediction.key.clone(), prediction);
            }
        }
    }

    let mut ranked: Vec<Prediction> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.confidence.total_cmp(&a.confidence))
            .then(a.key.cmp(&b.key))
    });
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn empty_history_predicts_nothing() {
        assert!(successor_predictions(&[], 0.6, now()).is_empty());
        assert!(successor_predictions(&history(&["a"]), 0.6, now()).is_empty());
    }

    #[test]
    fn repeated_pair_predicts_successor() {
        // "lesson" is always followed by "exercise".
        let history = history(&[
            "documentation:lesson",
            "computation:exercise",
            "documentation:lesson",
            "computation:exercise",
            "documentation:lesson",
        ]);
        let predictions = successor_predictions(&history, 0.6, now());
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].key, "computation:exercise");
        assert!((predictions[0].confidence - 0.95).abs() < 1e-9); // capped
        assert_eq!(predictions[0].resource_kind, ResourceKind::Computation);
    }

    #[test]
    fn weak_successors_are_dropped() {
        // "hub" is followed by three different keys: 1/3 each, below 0.6.
        let history = history(&["hub", "a", "hub", "b", "hub", "c", "hub"]);
        assert!(successor_predictions(&history, 0.6, now()).is_empty());
    }

    #[test]
    fn trigram_context_outranks_bigram() {
        // After (intro, lesson) the next key was always "quiz"; "lesson"
        // alone was also followed by "quiz" from other contexts.
        let history = history(&[
            "intro", "lesson", "quiz", "intro", "lesson", "quiz", "intro", "lesson",
        ]);
        let predictions = successor_predictions(&history, 0.6, now());
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].key, "quiz");
        assert_eq!(predictions[0].priority, PRIORITY_TRIGRAM);
    }

    #[test]
    fn frequency_normalizes_against_max() {
        let mut frequencies = HashMap::new();
        frequencies.insert("computation:fib:10".to_string(), 10u32);
        frequencies.insert("preference:theme".to_string(), 5);
        frequencies.insert("documentation:rare".to_string(), 1);

        let predictions = frequency_predictions(&frequencies, 3, now());
        assert_eq!(predictions.len(), 2); // rare is under the floor

        let fib = predictions
            .iter()
            .find(|p| p.key == "computation:fib:10")
            .expect("fib prediction");
        assert!((fib.confidence - 0.95).abs() < 1e-9); // 10/10 capped
        let theme = predictions
            .iter()
            .find(|p| p.key == "preference:theme")
            .expect("theme prediction");
        assert!((theme.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rank_orders_priority_then_confidence() {
        let now = now();
        let make = |key: &str, priority: u8, confidence: f64| Prediction {
            key: key.to_string(),
            confidence,
            priority,
            estimated_access_time: now,
            resource_kind: ResourceKind::Opaque,
        };

        let ranked = rank(
            vec![
                make("low", 1, 0.9),
                make("high-weak", 3, 0.61),
                make("mid", 2, 0.8),
                make("high-strong", 3, 0.9),
            ],
            10,
        );
        let keys: Vec<&str> = ranked.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["high-strong", "high-weak", "mid", "low"]);
    }

    #[test]
    fn rank_deduplicates_keeping_strongest() {
        let now = now();
        let make = |priority: u8, confidence: f64| Prediction {
            key: "computation:fib:10".to_string(),
            confidence,
            priority,
            estimated_access_time: now,
            resource_kind: ResourceKind::Computation,
        };

        let ranked = rank(vec![make(1, 0.9), make(3, 0.7)], 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].priority, 3);
    }

    #[test]
    fn rank_truncates_to_limit() {
        let now = now();
        let predictions: Vec<Prediction> = (0..10)
            .map(|i| Prediction {
                key: format!("key-{i}"),
                confidence: 0.9,
                priority: 1,
                estimated_access_time: now,
                resource_kind: ResourceKind::Opaque,
            })
            .collect();
        assert_eq!(rank(predictions, 4).len(), 4);
    }
}
