//! End-to-end coordinator flows: write-then-read consistency, miss
//! semantics, promotion, and wildcard invalidation.

use lemma::{
    CacheCoordinator, CacheValue, GetOptions, KeyPattern, LayerName, SetOptions, Settings,
};

fn fib_result() -> CacheValue {
    CacheValue::Computation {
        algorithm: "fibonacci".to_string(),
        input: serde_json::json!({ "n": 10 }),
        result: serde_json::json!(55),
        metadata: serde_json::Value::Null,
    }
}

async fn coordinator() -> CacheCoordinator {
    CacheCoordinator::new(Settings::default())
        .await
        .expect("coordinator should build from default settings")
}

#[tokio::test]
async fn write_then_read_returns_the_written_value() {
    let cache = coordinator().await;

    let outcome = cache
        .set("computation:fib:10", fib_result(), SetOptions::default())
        .await;
    assert!(outcome.success);

    let lookup = cache.get("computation:fib:10", GetOptions::default()).await;
    assert!(lookup.from_cache);
    match lookup.value.expect("cached value") {
        CacheValue::Computation { result, .. } => assert_eq!(result, serde_json::json!(55)),
        other => panic!("unexpected value kind: {other:?}"),
    }
}

#[tokio::test]
async fn get_on_never_written_key_never_throws() {
    let cache = coordinator().await;
    let lookup = cache.get("computation:unknown", GetOptions::default()).await;
    assert!(!lookup.from_cache);
    assert!(lookup.value.is_none());
}

#[tokio::test]
async fn hit_promotes_into_faster_routed_layers() {
    let cache = coordinator().await;

    // Computation writes route to persistent + worker, skipping memory.
    cache
        .set("computation:fib:10", fib_result(), SetOptions::default())
        .await;

    // The read plan includes memory; the hit comes from persistent and
    // must be promoted upward.
    let lookup = cache.get("computation:fib:10", GetOptions::default()).await;
    assert_eq!(lookup.source, Some(LayerName::Persistent));

    let promoted = cache
        .get(
            "computation:fib:10",
            GetOptions {
                layers: Some(vec![LayerName::Memory]),
            },
        )
        .await;
    assert!(promoted.from_cache);
    assert_eq!(promoted.source, Some(LayerName::Memory));
}

#[tokio::test]
async fn wildcard_invalidation_clears_every_layer() {
    let cache = coordinator().await;
    cache
        .set("computation:fib:10", fib_result(), SetOptions::default())
        .await;
    cache
        .set(
            "preference:theme",
            CacheValue::Preference {
                value: serde_json::json!("dark"),
            },
            SetOptions::default(),
        )
        .await;

    let removed = cache.invalidate(&KeyPattern::All).await;
    assert!(removed >= 2);

    for key in ["computation:fib:10", "preference:theme"] {
        let lookup = cache.get(key, GetOptions::default()).await;
        assert!(!lookup.from_cache, "{key} should be gone");
    }
}

#[tokio::test]
async fn pattern_invalidation_spares_unrelated_keys() {
    let cache = coordinator().await;
    cache
        .set("computation:fib:10", fib_result(), SetOptions::default())
        .await;
    cache
        .set(
            "preference:theme",
            CacheValue::Preference {
                value: serde_json::json!("dark"),
            },
            SetOptions::default(),
        )
        .await;

    cache.invalidate(&KeyPattern::parse("computation:*")).await;

    assert!(
        !cache
            .get("computation:fib:10", GetOptions::default())
            .await
            .from_cache
    );
    assert!(
        cache
            .get("preference:theme", GetOptions::default())
            .await
            .from_cache
    );
}

#[tokio::test]
async fn frequency_promotion_pulls_hot_keys_into_memory() {
    let mut settings = Settings::default();
    settings.cache.promote_after_accesses = 2;
    let cache = CacheCoordinator::new(settings).await.expect("coordinator");

    // Install a route that never includes memory on its own.
    cache.routing().install_rule(lemma::routing::RoutingRule {
        pattern: KeyPattern::prefix("archive:"),
        read_layers: vec![LayerName::Persistent, LayerName::Worker],
        write_layers: vec![LayerName::Persistent],
    });

    cache
        .set(
            "archive:2021",
            CacheValue::Document {
                format: "markdown".to_string(),
                body: "archived notes".to_string(),
            },
            SetOptions::default(),
        )
        .await;

    // Two accesses cross the promotion threshold; the next read includes
    // memory and the hit is promoted into it.
    cache.get("archive:2021", GetOptions::default()).await;
    cache.get("archive:2021", GetOptions::default()).await;
    cache.get("archive:2021", GetOptions::default()).await;

    let memory_only = cache
        .get(
            "archive:2021",
            GetOptions {
                layers: Some(vec![LayerName::Memory]),
            },
        )
        .await;
    assert!(memory_only.from_cache);

    // Session reset forgets the counters.
    cache.reset_session();
}

#[tokio::test]
async fn performance_report_reflects_traffic() {
    let cache = coordinator().await;
    cache
        .set("computation:fib:10", fib_result(), SetOptions::default())
        .await;
    cache.get("computation:fib:10", GetOptions::default()).await;
    cache.get("computation:missing", GetOptions::default()).await;

    let report = cache.performance_report();
    assert_eq!(report.snapshot.gets, 2);
    assert!((report.snapshot.hit_rate - 0.5).abs() < 1e-9);
    assert!(report.snapshot.operations >= 3);
    assert!(!report.layers.is_empty());
}
