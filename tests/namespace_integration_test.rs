//! Multi-tenant isolation and lifecycle scenarios.

use std::sync::Arc;

use sluice::limiter::{AcquireRequest, LimiterConfig, RateLimiter};
use sluice::models::{Limit, ManualClock};
use sluice::namespace::NamespaceRegistry;
use sluice::provision::{Applier, LimitsManifest};
use sluice::store::{IndexName, MemoryStore, Repository, WideRowStore};
use sluice::Clock;

fn store_and_clock() -> (Arc<MemoryStore>, Arc<ManualClock>) {
    (Arc::new(MemoryStore::new()), Arc::new(ManualClock::at(1_705_329_045_000)))
}

fn limiter_in(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>, ns: &str) -> RateLimiter {
    RateLimiter::new(
        Arc::clone(store) as Arc<dyn WideRowStore>,
        LimiterConfig {
            namespace: ns.to_string(),
            ..LimiterConfig::default()
        },
        Arc::clone(clock) as Arc<dyn Clock>,
    )
}

#[tokio::test]
async fn test_namespace_isolation_and_purge() {
    let (store, clock) = store_and_clock();
    let registry = NamespaceRegistry::new(
        Arc::clone(&store) as Arc<dyn WideRowStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );

    let ns_a = registry.register("ns-a").await.unwrap();
    let ns_b = registry.register("ns-b").await.unwrap();
    assert_ne!(ns_a, ns_b);

    let limiter_a = limiter_in(&store, &clock, &ns_a);
    let limiter_b = limiter_in(&store, &clock, &ns_b);

    // the same entity id exists independently in both tenants
    limiter_a.create_entity(sluice::Entity::new("user-1")).await.unwrap();
    limiter_b.create_entity(sluice::Entity::new("user-1")).await.unwrap();

    limiter_a
        .set_limits("user-1", &[Limit::per_minute("rpm", 100)], Some("gpt-4"))
        .await
        .unwrap();

    // drain 90 of ns-a's capacity
    let mut lease = limiter_a
        .acquire(AcquireRequest::new("user-1", "gpt-4").consume("rpm", 90))
        .await
        .unwrap();
    lease.commit().await.unwrap();

    // ns-b's user-1 is untouched and still passes a 90-token consume
    let mut lease = limiter_b
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 90)
                .limits(vec![Limit::per_minute("rpm", 100)]),
        )
        .await
        .unwrap();
    lease.commit().await.unwrap();

    // delete and purge ns-a
    registry.delete("ns-a").await.unwrap();
    let purged = registry.purge(&ns_a).await.unwrap();
    assert!(purged > 0);

    // nothing remains under ns-a's namespace index
    let rows = store.query_index(IndexName::Gsi4, &ns_a, None).await.unwrap();
    assert!(rows.is_empty());
    assert!(registry.describe(&ns_a).await.unwrap().is_none());

    // ns-b is unaffected
    assert!(limiter_b.get_entity("user-1").await.unwrap().is_some());
    let available = limiter_b
        .available("user-1", "gpt-4", Some(&[Limit::per_minute("rpm", 100)]))
        .await
        .unwrap();
    assert_eq!(available["rpm"], 10);
}

#[tokio::test]
async fn test_bulk_register_stable_ids() {
    let (store, clock) = store_and_clock();
    let registry = NamespaceRegistry::new(
        Arc::clone(&store) as Arc<dyn WideRowStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );

    let names: Vec<String> = ["alpha", "beta", "gamma"].map(String::from).to_vec();
    let first = registry.register_many(&names).await.unwrap();
    let second = registry.register_many(&names).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_provisioned_namespace_round_trip() {
    let (store, clock) = store_and_clock();
    let registry = NamespaceRegistry::new(
        Arc::clone(&store) as Arc<dyn WideRowStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );

    let manifest = LimitsManifest::from_yaml(
        r#"
namespace: tenant-a
system:
  on_unavailable: block
  limits:
    rpm: {capacity: 50}
entities:
  user-1:
    resources:
      gpt-4:
        limits:
          rpm: {capacity: 5}
"#,
    )
    .unwrap();

    let ns = registry.register(&manifest.namespace).await.unwrap();
    let repo = Repository::new(Arc::clone(&store) as Arc<dyn WideRowStore>, ns.clone());
    let applier = Applier::new(repo, Arc::clone(&clock) as Arc<dyn Clock>);

    let result = applier.apply_manifest(&manifest).await.unwrap();
    assert!(result.is_clean());

    // the provisioned entity limit binds acquires in that namespace
    let limiter = limiter_in(&store, &clock, &ns);
    let mut lease = limiter
        .acquire(AcquireRequest::new("user-1", "gpt-4").consume("rpm", 5))
        .await
        .unwrap();
    lease.commit().await.unwrap();

    let err = limiter
        .acquire(AcquireRequest::new("user-1", "gpt-4").consume("rpm", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, sluice::SluiceError::RateLimitExceeded(_)));

    // a second apply changes nothing observable
    let second = applier.apply_manifest(&manifest).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.deleted, 0);
}
