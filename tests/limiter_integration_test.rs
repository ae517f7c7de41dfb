//! End-to-end limiter scenarios against the in-process store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice::limiter::{AcquireRequest, LimiterConfig, RateLimiter};
use sluice::models::{ConsumeMap, Entity, FailureMode, Limit, ManualClock};
use sluice::store::{
    DeleteOp, IndexName, Item, Key, MemoryStore, PutOp, StoreError, TransactItem, UpdateOp,
    WideRowStore,
};
use sluice::{SluiceError, Window};

fn fixture() -> (Arc<MemoryStore>, Arc<ManualClock>, RateLimiter) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at(1_705_329_045_000));
    let limiter = RateLimiter::new(
        Arc::clone(&store) as Arc<dyn WideRowStore>,
        LimiterConfig {
            namespace: "ns1".into(),
            ..LimiterConfig::default()
        },
        Arc::clone(&clock) as Arc<dyn sluice::Clock>,
    );
    (store, clock, limiter)
}

fn consume(pairs: &[(&str, i64)]) -> ConsumeMap {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[tokio::test]
async fn test_basic_rpm_exhaustion_and_refill() {
    let (_store, clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("rpm", 10)];

    // ten unit consumes drain the bucket
    for _ in 0..10 {
        let mut lease = limiter
            .acquire(
                AcquireRequest::new("user-1", "gpt-4")
                    .consume("rpm", 1)
                    .limits(limits.clone()),
            )
            .await
            .unwrap();
        lease.commit().await.unwrap();
    }

    // the eleventh is rejected with retry-after ~6s (1 token at 10/min)
    let err = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 1)
                .limits(limits.clone()),
        )
        .await
        .unwrap_err();
    let SluiceError::RateLimitExceeded(exc) = err else {
        panic!("expected RateLimitExceeded, got {err:?}");
    };
    assert!((5.5..6.5).contains(&exc.retry_after_seconds()), "{}", exc.retry_after_seconds());
    assert_eq!(exc.retry_after_header(), "6");

    // after six seconds of refill the next consume succeeds
    clock.advance(Duration::from_secs(6));
    let mut lease = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 1)
                .limits(limits),
        )
        .await
        .unwrap();
    lease.commit().await.unwrap();
}

#[tokio::test]
async fn test_multi_limit_tight_tpm() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("rpm", 100), Limit::per_minute("tpm", 1_000)];

    for _ in 0..5 {
        let mut lease = limiter
            .acquire(
                AcquireRequest::new("user-1", "gpt-4")
                    .consume("rpm", 1)
                    .consume("tpm", 200)
                    .limits(limits.clone()),
            )
            .await
            .unwrap();
        lease.commit().await.unwrap();
    }

    let err = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 1)
                .consume("tpm", 200)
                .limits(limits),
        )
        .await
        .unwrap_err();
    let SluiceError::RateLimitExceeded(exc) = err else {
        panic!("expected RateLimitExceeded");
    };

    let passed: Vec<&str> = exc.passed().iter().map(|s| s.limit_name()).collect();
    let violated: Vec<&str> = exc.violations().iter().map(|s| s.limit_name()).collect();
    assert_eq!(passed, vec!["rpm"]);
    assert_eq!(violated, vec!["tpm"]);
    // 200-token deficit at 1000/min refills in ~12s
    assert!((11.0..13.0).contains(&exc.retry_after_seconds()), "{}", exc.retry_after_seconds());
}

#[tokio::test]
async fn test_boundary_exact_capacity() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("rpm", 10)];

    // requested == available succeeds
    let mut lease = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 10)
                .limits(limits.clone()),
        )
        .await
        .unwrap();
    lease.commit().await.unwrap();

    let available = limiter.available("user-1", "gpt-4", Some(&limits)).await.unwrap();
    assert_eq!(available["rpm"], 0);
}

#[tokio::test]
async fn test_boundary_one_over_capacity() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("rpm", 10)];

    let err = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 11)
                .limits(limits),
        )
        .await
        .unwrap_err();
    let SluiceError::RateLimitExceeded(exc) = err else {
        panic!("expected RateLimitExceeded");
    };
    // one token of deficit at 10/min: one sixth of a minute
    let per_token = 6.0;
    assert!((exc.retry_after_seconds() - per_token).abs() < 0.5);
}

#[tokio::test]
async fn test_cascade_parent_blocks_child() {
    let (_store, _clock, limiter) = fixture();

    let mut parent = Entity::new("P");
    parent.cascade = false;
    limiter.create_entity(parent).await.unwrap();
    let mut child = Entity::new("C");
    child.parent_id = Some("P".into());
    child.cascade = true;
    limiter.create_entity(child).await.unwrap();

    limiter
        .set_limits("P", &[Limit::per_minute("rpm", 5)], Some("gpt-4"))
        .await
        .unwrap();

    let child_limits = vec![Limit::per_minute("rpm", 100)];
    let mut successes = 0;
    let mut blocking_entity = None;

    for _ in 0..9 {
        let result = limiter
            .acquire(
                AcquireRequest::new("C", "gpt-4")
                    .consume("rpm", 1)
                    .limits(child_limits.clone())
                    .cascade(true),
            )
            .await;
        match result {
            Ok(mut lease) => {
                lease.commit().await.unwrap();
                successes += 1;
            }
            Err(SluiceError::RateLimitExceeded(exc)) => {
                blocking_entity = Some(exc.violations()[0].entity_id.clone());
                break;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    // the parent's rpm=5 is the binding constraint
    assert_eq!(successes, 5);
    assert_eq!(blocking_entity.as_deref(), Some("P"));

    // both buckets were decremented on every success
    let child_avail = limiter.available("C", "gpt-4", Some(&child_limits)).await.unwrap();
    assert_eq!(child_avail["rpm"], 95);
    let parent_avail = limiter.available("P", "gpt-4", None).await.unwrap();
    assert_eq!(parent_avail["rpm"], 0);
}

#[tokio::test]
async fn test_lease_adjust_reconciles_actual_usage() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("tpm", 10_000)];

    // estimated 100 tokens, actual usage turns out to be 250
    let mut lease = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("tpm", 100)
                .limits(limits.clone()),
        )
        .await
        .unwrap();
    lease.adjust(consume(&[("tpm", 150)])).unwrap();
    assert_eq!(lease.consumed(), consume(&[("tpm", 250)]));
    lease.commit().await.unwrap();

    let available = limiter.available("user-1", "gpt-4", Some(&limits)).await.unwrap();
    assert_eq!(available["tpm"], 10_000 - 250);
}

#[tokio::test]
async fn test_lease_rollback_restores_bucket() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("tpm", 10_000)];

    let mut lease = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("tpm", 100)
                .limits(limits.clone()),
        )
        .await
        .unwrap();
    lease.adjust(consume(&[("tpm", 150)])).unwrap();
    // the caller's work failed; compensate
    lease.rollback().await.unwrap();

    let available = limiter.available("user-1", "gpt-4", Some(&limits)).await.unwrap();
    assert_eq!(available["tpm"], 10_000);
}

#[tokio::test]
async fn test_lease_checked_consume_rejects_over_limit() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("tpm", 1_000)];

    let mut lease = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("tpm", 500)
                .limits(limits.clone()),
        )
        .await
        .unwrap();

    // 600 more does not fit into the remaining 500
    let err = lease.consume(consume(&[("tpm", 600)])).await.unwrap_err();
    assert!(matches!(err, SluiceError::RateLimitExceeded(_)));

    // 300 fits
    lease.consume(consume(&[("tpm", 300)])).await.unwrap();
    assert_eq!(lease.consumed(), consume(&[("tpm", 800)]));
    lease.commit().await.unwrap();
}

#[tokio::test]
async fn test_negative_bucket_recovers_exactly() {
    let (_store, clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("tpm", 1_000)];

    // reserve 500 and reconcile actual usage of 1500: bucket goes 500 into debt
    let mut lease = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("tpm", 500)
                .limits(limits.clone()),
        )
        .await
        .unwrap();
    lease.adjust(consume(&[("tpm", 1_000)])).unwrap();
    lease.commit().await.unwrap();

    let available = limiter.available("user-1", "gpt-4", Some(&limits)).await.unwrap();
    assert_eq!(available["tpm"], -500);

    // 500 deficit at 1000/min repays in exactly 30 seconds
    clock.advance(Duration::from_secs(30));
    let available = limiter.available("user-1", "gpt-4", Some(&limits)).await.unwrap();
    assert_eq!(available["tpm"], 0);
}

#[tokio::test]
async fn test_concurrent_acquires_are_fully_accounted() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("rpm", 100)];

    // ADD-only counter mutation: whatever the interleaving, the final
    // balance is the initial balance minus the sum of admitted consumes
    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            let limits = limits.clone();
            tokio::spawn(async move {
                match limiter
                    .acquire(
                        AcquireRequest::new("user-1", "gpt-4")
                            .consume("rpm", 3)
                            .limits(limits),
                    )
                    .await
                {
                    Ok(mut lease) => {
                        lease.commit().await.unwrap();
                        true
                    }
                    Err(_) => false,
                }
            })
        })
        .collect();

    let mut admitted: i64 = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert!(admitted > 0);

    let available = limiter.available("user-1", "gpt-4", Some(&limits)).await.unwrap();
    assert_eq!(available["rpm"], 100 - admitted * 3);
}

// ============================================================================
// Unavailability policy
// ============================================================================

/// Store wrapper that can be flipped into a failing state.
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(false),
        }
    }

    fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WideRowStore for FlakyStore {
    async fn get_item(&self, key: &Key) -> Result<Option<Item>, StoreError> {
        self.check()?;
        self.inner.get_item(key).await
    }
    async fn batch_get(&self, keys: &[Key]) -> Result<HashMap<Key, Item>, StoreError> {
        self.check()?;
        self.inner.batch_get(keys).await
    }
    async fn put_item(&self, op: PutOp) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put_item(op).await
    }
    async fn update_item(&self, op: UpdateOp) -> Result<Item, StoreError> {
        self.check()?;
        self.inner.update_item(op).await
    }
    async fn delete_item(&self, op: DeleteOp) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_item(op).await
    }
    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.transact_write(items).await
    }
    async fn query_prefix(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>, StoreError> {
        self.check()?;
        self.inner.query_prefix(pk, sk_prefix).await
    }
    async fn query_index(
        &self,
        index: IndexName,
        pk: &str,
        sk_prefix: Option<&str>,
    ) -> Result<Vec<Item>, StoreError> {
        self.check()?;
        self.inner.query_index(index, pk, sk_prefix).await
    }
    async fn batch_delete(&self, keys: &[Key]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.batch_delete(keys).await
    }
    async fn ping(&self) -> bool {
        self.check().is_ok()
    }
}

async fn flaky_limiter(mode: FailureMode) -> (Arc<FlakyStore>, RateLimiter) {
    let store = Arc::new(FlakyStore::new());
    let limiter = RateLimiter::new(
        Arc::clone(&store) as Arc<dyn WideRowStore>,
        LimiterConfig {
            namespace: "ns1".into(),
            ..LimiterConfig::default()
        },
        Arc::new(ManualClock::at(0)),
    );
    limiter.set_system_defaults(&[], Some(mode)).await.unwrap();
    // prime the policy cache while the store is healthy
    let mut warm = limiter
        .acquire(
            AcquireRequest::new("warm", "gpt-4")
                .consume("rpm", 1)
                .limits(vec![Limit::per_minute("rpm", 10)]),
        )
        .await
        .unwrap();
    warm.commit().await.unwrap();
    (store, limiter)
}

#[tokio::test]
async fn test_on_unavailable_allow_admits() {
    let (store, limiter) = flaky_limiter(FailureMode::Allow).await;
    store.fail();

    let mut lease = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 1)
                .limits(vec![Limit::per_minute("rpm", 10)]),
        )
        .await
        .unwrap();
    assert!(lease.is_open());
    lease.commit().await.unwrap();
}

#[tokio::test]
async fn test_on_unavailable_block_raises() {
    let (store, limiter) = flaky_limiter(FailureMode::Block).await;
    store.fail();

    let err = limiter
        .acquire(
            AcquireRequest::new("user-1", "gpt-4")
                .consume("rpm", 1)
                .limits(vec![Limit::per_minute("rpm", 10)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SluiceError::Unavailable { .. }));
    assert!(!limiter.ping().await);
}

#[tokio::test]
async fn test_set_then_get_limits_round_trip() {
    let (_store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("rpm", 100), Limit::per_minute("tpm", 10_000)];

    limiter.set_limits("key-1", &limits, Some("gpt-4")).await.unwrap();
    let fetched = limiter.get_limits("key-1", Some("gpt-4")).await.unwrap();
    assert_eq!(fetched, limits);

    limiter.delete_limits("key-1", Some("gpt-4")).await.unwrap();
    assert!(limiter.get_limits("key-1", Some("gpt-4")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_entity_leaves_no_rows() {
    let (store, _clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("rpm", 100)];

    let mut entity = Entity::new("e1");
    entity.name = Some("to be removed".into());
    limiter.create_entity(entity).await.unwrap();
    limiter.set_limits("e1", &limits, Some("gpt-4")).await.unwrap();
    let mut lease = limiter
        .acquire(
            AcquireRequest::new("e1", "gpt-4")
                .consume("rpm", 1)
                .limits(limits),
        )
        .await
        .unwrap();
    lease.commit().await.unwrap();

    limiter.delete_entity("e1").await.unwrap();

    // nothing owned by e1 survives under either prefix
    let entity_rows = store.query_prefix("ns1/ENTITY#e1", "").await.unwrap();
    assert!(entity_rows.is_empty());
    let audit_rows = store.query_prefix("ns1/AUDIT#e1", "").await.unwrap();
    assert!(audit_rows.is_empty());
    let buckets = store
        .query_index(IndexName::Gsi3, "ns1/ENTITY#e1", None)
        .await
        .unwrap();
    assert!(buckets.is_empty());
}

#[tokio::test]
async fn test_usage_visible_after_aggregation() {
    use sluice::aggregator::{AggregatorConfig, MemoryObjectStore, ObjectStore, StreamAggregator};

    let (store, clock, limiter) = fixture();
    let limits = vec![Limit::per_minute("tpm", 10_000)];

    for _ in 0..3 {
        let mut lease = limiter
            .acquire(
                AcquireRequest::new("user-1", "gpt-4")
                    .consume("tpm", 100)
                    .limits(limits.clone()),
            )
            .await
            .unwrap();
        lease.commit().await.unwrap();
    }

    let aggregator = StreamAggregator::new(
        Arc::clone(&store) as Arc<dyn WideRowStore>,
        Arc::new(MemoryObjectStore::new()) as Arc<dyn ObjectStore>,
        Arc::clone(&clock) as Arc<dyn sluice::Clock>,
        AggregatorConfig::default(),
    );
    aggregator.process_batch(&store.drain_stream()).await;

    let usage = limiter.usage("user-1", "gpt-4", Window::Hourly).await.unwrap();
    assert_eq!(usage.len(), 1);
    // the first acquire is an insert; the two updates carry deltas
    assert_eq!(usage[0].counters["tpm"], 200);
}
