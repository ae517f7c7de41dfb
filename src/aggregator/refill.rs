//! Proactive refill and shard management
//!
//! The aggregator watches the stream for buckets trending empty and tops
//! them up ahead of client demand. The write is a pure ADD on `tk`
//! guarded by the shared `rf` timestamp: the ADD commutes with any
//! speculative consume a client lands between the stream snapshot and
//! this write, and a guard failure just means someone else already
//! advanced the bucket, so the refill is dropped without retry.
//!
//! Sharding is one-way. When the `__wcu__` virtual limit shows a shard
//! absorbing writes past the configured threshold, `shard_count` doubles
//! (guarded CAS on the canonical shard); the doubling then propagates by
//! creating the missing shard rows from the canonical attributes.

use std::collections::{BTreeMap, HashMap};

use crate::schema;
use crate::store::{
    AttrValue, Condition, Item, Key, PutOp, StoreError, StreamEventType, StreamRecord, UpdateOp,
    WideRowStore,
};

use super::delta::{is_bucket_record, namespace_of};

/// Refill-relevant view of one limit on one bucket shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitRefillInfo {
    /// Millitokens consumed across the batch (tc delta).
    pub tc_delta_milli: i64,
    /// Balance in the latest image.
    pub tk_milli: i64,
    /// Capacity.
    pub cp_milli: i64,
    /// Burst ceiling.
    pub bx_milli: i64,
    /// Refill amount per period.
    pub ra_milli: i64,
    /// Refill period.
    pub rp_ms: i64,
}

/// Latest per-bucket state reconstructed from a stream batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRefillState {
    /// Namespace of the bucket.
    pub namespace: String,
    /// Owning entity.
    pub entity_id: String,
    /// Resource.
    pub resource: String,
    /// Shard index of the observed row.
    pub shard: u32,
    /// Shard count in the latest image.
    pub shard_count: u32,
    /// Refill timestamp in the latest image: the optimistic-lock guard.
    pub rf_ms: i64,
    /// Per-limit refill info, `__wcu__` included.
    pub limits: BTreeMap<String, LimitRefillInfo>,
}

/// Fold a batch of stream records into one refill state per bucket,
/// summing consumption deltas and keeping the latest image's balances.
pub fn aggregate_bucket_states(records: &[StreamRecord]) -> HashMap<Key, BucketRefillState> {
    let mut states: HashMap<Key, BucketRefillState> = HashMap::new();

    for record in records {
        if record.event != StreamEventType::Modify || !is_bucket_record(&record.key) {
            continue;
        }
        let (Some(new_image), old_image) = (&record.new_image, &record.old_image) else {
            continue;
        };
        let Some(namespace) = namespace_of(&record.key) else {
            continue;
        };
        let Some(entity_id) = crate::store::get_s(new_image, "entity_id") else {
            continue;
        };
        let Some(resource) = crate::store::get_s(new_image, "resource") else {
            continue;
        };

        let entry = states.entry(record.key.clone()).or_insert_with(|| BucketRefillState {
            namespace: namespace.to_string(),
            entity_id: entity_id.to_string(),
            resource: resource.to_string(),
            shard: record
                .key
                .pk
                .rsplit('#')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            shard_count: 1,
            rf_ms: 0,
            limits: BTreeMap::new(),
        });

        entry.rf_ms = crate::store::get_n(new_image, "rf").unwrap_or(entry.rf_ms);
        entry.shard_count = crate::store::get_n(new_image, "shard_count").unwrap_or(1) as u32;

        for limit_name in schema::limit_names_in(new_image.keys().map(String::as_str)) {
            let field = |f: &str| crate::store::get_n(new_image, &schema::bucket_attr(&limit_name, f));
            let info = entry.limits.entry(limit_name.clone()).or_default();
            info.tk_milli = field(schema::FIELD_TK).unwrap_or(0);
            info.cp_milli = field(schema::FIELD_CP).unwrap_or(0);
            info.bx_milli = field(schema::FIELD_BX).unwrap_or(info.cp_milli);
            info.ra_milli = field(schema::FIELD_RA).unwrap_or(0);
            info.rp_ms = field(schema::FIELD_RP).unwrap_or(0);

            let tc_attr = schema::bucket_attr(&limit_name, schema::FIELD_TC);
            let new_tc = crate::store::get_n(new_image, &tc_attr).unwrap_or(0);
            let old_tc = old_image
                .as_ref()
                .and_then(|img| crate::store::get_n(img, &tc_attr))
                .unwrap_or(new_tc);
            info.tc_delta_milli += new_tc - old_tc;
        }
    }
    states
}

/// Millitokens earned by elapsed time, never exceeding the headroom to
/// the burst ceiling.
fn earned_milli(info: &LimitRefillInfo, elapsed_ms: i64) -> i64 {
    if info.rp_ms <= 0 || elapsed_ms <= 0 {
        return 0;
    }
    let accrued = ((elapsed_ms as i128 * info.ra_milli as i128) / info.rp_ms as i128) as i64;
    accrued.min((info.bx_milli - info.tk_milli).max(0))
}

/// Top up a bucket that is trending empty.
///
/// The trigger: for some limit, the balance projected to `now_ms` does
/// not cover the consumption observed in this batch, i.e. demand is
/// outpacing lazy refill. The write ADDs every limit's earned tokens and
/// advances `rf`, guarded on the stream-observed `rf`. Returns whether a
/// refill was written; a lost guard race is an expected no-op.
pub async fn try_refill_bucket(
    store: &dyn WideRowStore,
    state: &BucketRefillState,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let elapsed_ms = now_ms - state.rf_ms;
    if elapsed_ms <= 0 {
        return Ok(false);
    }

    let trending_empty = state.limits.values().any(|info| {
        let projected = info.tk_milli + earned_milli(info, elapsed_ms);
        info.tc_delta_milli > 0 && projected < info.tc_delta_milli
    });
    if !trending_empty {
        return Ok(false);
    }

    let key = Key::new(
        schema::pk_bucket(&state.namespace, &state.entity_id, &state.resource, state.shard),
        schema::SK_STATE,
    );
    let mut op = UpdateOp::new(key)
        .set("rf", now_ms)
        .condition(Condition::Equals("rf".into(), AttrValue::N(state.rf_ms)));
    for (limit_name, info) in &state.limits {
        let earned = earned_milli(info, elapsed_ms);
        if earned > 0 {
            op = op.add(schema::bucket_attr(limit_name, schema::FIELD_TK), earned);
        }
    }

    match store.update_item(op).await {
        Ok(_) => Ok(true),
        Err(StoreError::ConditionFailed) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Double `shard_count` on the canonical shard when the write-capacity
/// limit is consuming past `threshold` (fraction of capacity already
/// spent). Returns whether the count doubled.
pub async fn try_proactive_shard(
    store: &dyn WideRowStore,
    state: &BucketRefillState,
    threshold: f64,
) -> Result<bool, StoreError> {
    let Some(wcu) = state.limits.get(schema::WCU_LIMIT_NAME) else {
        return Ok(false);
    };
    if wcu.cp_milli <= 0 {
        return Ok(false);
    }
    let remaining = wcu.tk_milli.max(0) as f64 / wcu.cp_milli as f64;
    if remaining > 1.0 - threshold {
        return Ok(false);
    }

    let key = Key::new(
        schema::pk_bucket(&state.namespace, &state.entity_id, &state.resource, 0),
        schema::SK_STATE,
    );
    let op = UpdateOp::new(key)
        .set("shard_count", AttrValue::N(state.shard_count as i64 * 2))
        .condition(Condition::Equals(
            "shard_count".into(),
            AttrValue::N(state.shard_count as i64),
        ));

    match store.update_item(op).await {
        Ok(_) => Ok(true),
        Err(StoreError::ConditionFailed) => Ok(false),
        Err(err) => Err(err),
    }
}

/// React to a `shard_count` doubling observed on the stream by creating
/// the new shard rows. Shards N..2N-1 copy the canonical per-limit
/// configuration and start full. Returns how many shards were created.
pub async fn propagate_shard_count(
    store: &dyn WideRowStore,
    record: &StreamRecord,
) -> Result<u32, StoreError> {
    if record.event != StreamEventType::Modify || !is_bucket_record(&record.key) {
        return Ok(0);
    }
    let (Some(new_image), Some(old_image)) = (&record.new_image, &record.old_image) else {
        return Ok(0);
    };
    let old_count = crate::store::get_n(old_image, "shard_count").unwrap_or(1);
    let new_count = crate::store::get_n(new_image, "shard_count").unwrap_or(1);
    if new_count <= old_count {
        return Ok(0);
    }
    let Some(namespace) = namespace_of(&record.key) else {
        return Ok(0);
    };
    let Some(entity_id) = crate::store::get_s(new_image, "entity_id") else {
        return Ok(0);
    };
    let Some(resource) = crate::store::get_s(new_image, "resource") else {
        return Ok(0);
    };
    let rf_ms = crate::store::get_n(new_image, "rf").unwrap_or(0);

    let mut created = 0;
    for shard in old_count..new_count {
        let shard = shard as u32;
        let mut item = Item::new();
        item.insert("entity_id".into(), entity_id.into());
        item.insert("resource".into(), resource.into());
        item.insert("rf".into(), AttrValue::N(rf_ms));
        item.insert("shard_count".into(), AttrValue::N(new_count));
        if let Some(cascade) = crate::store::get_bool(new_image, "cascade") {
            item.insert("cascade".into(), AttrValue::Bool(cascade));
        }
        if let Some(parent) = crate::store::get_s(new_image, "parent_id") {
            item.insert("parent_id".into(), parent.into());
        }
        item.insert("GSI2PK".into(), schema::gsi2_pk_resource(namespace, resource).into());
        item.insert("GSI2SK".into(), schema::gsi2_sk_bucket(entity_id, shard).into());
        item.insert("GSI3PK".into(), schema::gsi3_pk_entity(namespace, entity_id).into());
        item.insert("GSI3SK".into(), schema::gsi3_sk_bucket(resource, shard).into());
        item.insert("GSI4PK".into(), namespace.into());

        for limit_name in schema::limit_names_in(new_image.keys().map(String::as_str)) {
            let src = |f: &str| {
                crate::store::get_n(new_image, &schema::bucket_attr(&limit_name, f)).unwrap_or(0)
            };
            let cp = src(schema::FIELD_CP);
            let bx = crate::store::get_n(new_image, &schema::bucket_attr(&limit_name, schema::FIELD_BX))
                .unwrap_or(cp);
            let attr = |f: &str| schema::bucket_attr(&limit_name, f);
            item.insert(attr(schema::FIELD_TK).into(), AttrValue::N(bx));
            item.insert(attr(schema::FIELD_CP).into(), AttrValue::N(cp));
            item.insert(attr(schema::FIELD_BX).into(), AttrValue::N(bx));
            item.insert(attr(schema::FIELD_RA).into(), AttrValue::N(src(schema::FIELD_RA)));
            item.insert(attr(schema::FIELD_RP).into(), AttrValue::N(src(schema::FIELD_RP)));
            item.insert(attr(schema::FIELD_TC).into(), AttrValue::N(0));
        }

        let key = Key::new(
            schema::pk_bucket(namespace, entity_id, resource, shard),
            schema::SK_STATE,
        );
        match store
            .put_item(PutOp::new(key, item).condition(Condition::KeyNotExists))
            .await
        {
            Ok(()) => created += 1,
            // Another aggregator already propagated this shard.
            Err(StoreError::ConditionFailed) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limit_info(tk: i64, cp: i64, ra: i64, rp: i64, tc_delta: i64) -> LimitRefillInfo {
        LimitRefillInfo {
            tc_delta_milli: tc_delta,
            tk_milli: tk,
            cp_milli: cp,
            bx_milli: cp,
            ra_milli: ra,
            rp_ms: rp,
        }
    }

    fn refill_state(rf_ms: i64, limits: &[(&str, LimitRefillInfo)]) -> BucketRefillState {
        BucketRefillState {
            namespace: "ns1".into(),
            entity_id: "e1".into(),
            resource: "gpt-4".into(),
            shard: 0,
            shard_count: 1,
            rf_ms,
            limits: limits.iter().map(|(n, i)| (n.to_string(), *i)).collect(),
        }
    }

    async fn seed_bucket(store: &MemoryStore, rf_ms: i64, tk: i64, tc: i64) {
        let mut item = Item::new();
        item.insert("PK".into(), "ns1/BUCKET#e1#gpt-4#0".into());
        item.insert("SK".into(), schema::SK_STATE.into());
        item.insert("entity_id".into(), "e1".into());
        item.insert("resource".into(), "gpt-4".into());
        item.insert("rf".into(), AttrValue::N(rf_ms));
        item.insert("shard_count".into(), AttrValue::N(1));
        let attr = |f: &str| schema::bucket_attr("tpm", f);
        item.insert(attr(schema::FIELD_TK).into(), AttrValue::N(tk));
        item.insert(attr(schema::FIELD_CP).into(), AttrValue::N(10_000_000));
        item.insert(attr(schema::FIELD_BX).into(), AttrValue::N(10_000_000));
        item.insert(attr(schema::FIELD_RA).into(), AttrValue::N(10_000_000));
        item.insert(attr(schema::FIELD_RP).into(), AttrValue::N(60_000));
        item.insert(attr(schema::FIELD_TC).into(), AttrValue::N(tc));

        let key = Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE);
        store.put_item(PutOp::new(key, item)).await.unwrap();
    }

    #[tokio::test]
    async fn test_refill_writes_when_depleted() {
        let store = MemoryStore::new();
        // depleted: 0 tokens, consumed 10k in batch, 10s ago
        seed_bucket(&store, 0, 0, 10_000_000).await;
        let state = refill_state(0, &[("tpm", limit_info(0, 10_000_000, 10_000_000, 60_000, 10_000_000))]);

        let refilled = try_refill_bucket(&store, &state, 10_000).await.unwrap();
        assert!(refilled);

        let item = store
            .get_raw(&Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE))
            .unwrap();
        let tk = crate::store::get_n(&item, &schema::bucket_attr("tpm", schema::FIELD_TK)).unwrap();
        // 10s of 10M/min is ~1.67M
        assert!(tk > 1_600_000 && tk < 1_700_000, "tk = {tk}");
        assert_eq!(crate::store::get_n(&item, "rf"), Some(10_000));
    }

    #[tokio::test]
    async fn test_refill_skipped_with_plenty_of_tokens() {
        let store = MemoryStore::new();
        seed_bucket(&store, 0, 9_000_000, 1_000_000).await;
        let state = refill_state(0, &[("tpm", limit_info(9_000_000, 10_000_000, 10_000_000, 60_000, 1_000_000))]);

        assert!(!try_refill_bucket(&store, &state, 60_000).await.unwrap());
        let item = store
            .get_raw(&Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE))
            .unwrap();
        assert_eq!(crate::store::get_n(&item, "rf"), Some(0));
    }

    #[tokio::test]
    async fn test_stale_rf_guard_is_noop() {
        let store = MemoryStore::new();
        seed_bucket(&store, 0, 0, 10_000_000).await;
        let state = refill_state(0, &[("tpm", limit_info(0, 10_000_000, 10_000_000, 60_000, 10_000_000))]);

        assert!(try_refill_bucket(&store, &state, 10_000).await.unwrap());
        // second attempt carries the stale rf guard
        assert!(!try_refill_bucket(&store, &state, 11_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_refill_commutes_with_concurrent_consume() {
        let store = MemoryStore::new();
        // 500 tokens left, heavy consumption
        seed_bucket(&store, 0, 500_000, 9_500_000).await;
        let state = refill_state(0, &[("tpm", limit_info(500_000, 10_000_000, 10_000_000, 60_000, 9_500_000))]);

        // a client speculatively consumes 1k tokens between the stream
        // snapshot and the refill (pure ADD, no rf change)
        let consume = UpdateOp::new(Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE))
            .add(schema::bucket_attr("tpm", schema::FIELD_TK), -1_000_000)
            .add(schema::bucket_attr("tpm", schema::FIELD_TC), 1_000_000);
        store.update_item(consume).await.unwrap();

        assert!(try_refill_bucket(&store, &state, 10_000).await.unwrap());

        let item = store
            .get_raw(&Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE))
            .unwrap();
        let tk = crate::store::get_n(&item, &schema::bucket_attr("tpm", schema::FIELD_TK)).unwrap();
        // 500k - 1M + ~1.67M: both the consume and the refill survive
        assert!(tk > 1_100_000 && tk < 1_200_000, "tk = {tk}");
    }

    #[tokio::test]
    async fn test_proactive_shard_doubles_count() {
        let store = MemoryStore::new();
        seed_bucket(&store, 0, 0, 0).await;

        let state = refill_state(
            0,
            &[(
                schema::WCU_LIMIT_NAME,
                // 10% of write capacity remaining
                limit_info(100_000, 1_000_000, 1_000_000, 60_000, 900_000),
            )],
        );
        assert!(try_proactive_shard(&store, &state, 0.8).await.unwrap());

        let item = store
            .get_raw(&Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE))
            .unwrap();
        assert_eq!(crate::store::get_n(&item, "shard_count"), Some(2));
    }

    #[tokio::test]
    async fn test_proactive_shard_below_threshold_is_noop() {
        let store = MemoryStore::new();
        seed_bucket(&store, 0, 0, 0).await;

        let state = refill_state(
            0,
            &[(
                schema::WCU_LIMIT_NAME,
                // 70% remaining: under the 80% consumption threshold
                limit_info(700_000, 1_000_000, 1_000_000, 60_000, 300_000),
            )],
        );
        assert!(!try_proactive_shard(&store, &state, 0.8).await.unwrap());
    }

    #[tokio::test]
    async fn test_propagate_creates_new_shards() {
        let store = MemoryStore::new();

        let mut image = Item::new();
        image.insert("entity_id".into(), "e1".into());
        image.insert("resource".into(), "gpt-4".into());
        image.insert("rf".into(), AttrValue::N(5_000));
        image.insert("shard_count".into(), AttrValue::N(2));
        let attr = |f: &str| schema::bucket_attr("rpm", f);
        image.insert(attr(schema::FIELD_TK).into(), AttrValue::N(50_000));
        image.insert(attr(schema::FIELD_CP).into(), AttrValue::N(100_000));
        image.insert(attr(schema::FIELD_BX).into(), AttrValue::N(100_000));
        image.insert(attr(schema::FIELD_RA).into(), AttrValue::N(100_000));
        image.insert(attr(schema::FIELD_RP).into(), AttrValue::N(60_000));
        image.insert(attr(schema::FIELD_TC).into(), AttrValue::N(50_000));

        let mut old_image = image.clone();
        old_image.insert("shard_count".into(), AttrValue::N(1));

        let record = StreamRecord {
            event: StreamEventType::Modify,
            key: Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE),
            old_image: Some(old_image),
            new_image: Some(image),
        };

        let created = propagate_shard_count(&store, &record).await.unwrap();
        assert_eq!(created, 1);

        let shard1 = store
            .get_raw(&Key::new("ns1/BUCKET#e1#gpt-4#1", schema::SK_STATE))
            .unwrap();
        // new shard starts full with zero consumption
        assert_eq!(
            crate::store::get_n(&shard1, &schema::bucket_attr("rpm", schema::FIELD_TK)),
            Some(100_000)
        );
        assert_eq!(
            crate::store::get_n(&shard1, &schema::bucket_attr("rpm", schema::FIELD_TC)),
            Some(0)
        );
        assert_eq!(crate::store::get_n(&shard1, "shard_count"), Some(2));

        // idempotent: a second propagation creates nothing
        assert_eq!(propagate_shard_count(&store, &record).await.unwrap(), 0);
    }

    #[test]
    fn test_aggregate_sums_tc_deltas_across_records() {
        let make = |old_tc: i64, new_tc: i64, rf: i64| {
            let mut new_image = Item::new();
            new_image.insert("entity_id".into(), "e1".into());
            new_image.insert("resource".into(), "gpt-4".into());
            new_image.insert("rf".into(), AttrValue::N(rf));
            let attr = |f: &str| schema::bucket_attr("tpm", f);
            new_image.insert(attr(schema::FIELD_TK).into(), AttrValue::N(0));
            new_image.insert(attr(schema::FIELD_CP).into(), AttrValue::N(10_000_000));
            new_image.insert(attr(schema::FIELD_BX).into(), AttrValue::N(10_000_000));
            new_image.insert(attr(schema::FIELD_RA).into(), AttrValue::N(10_000_000));
            new_image.insert(attr(schema::FIELD_RP).into(), AttrValue::N(60_000));
            new_image.insert(attr(schema::FIELD_TC).into(), AttrValue::N(new_tc));
            let mut old_image = new_image.clone();
            old_image.insert(attr(schema::FIELD_TC).into(), AttrValue::N(old_tc));
            StreamRecord {
                event: StreamEventType::Modify,
                key: Key::new("ns1/BUCKET#e1#gpt-4#0", schema::SK_STATE),
                old_image: Some(old_image),
                new_image: Some(new_image),
            }
        };

        let records = vec![make(0, 1_000_000, 1_000), make(1_000_000, 3_000_000, 2_000)];
        let states = aggregate_bucket_states(&records);
        assert_eq!(states.len(), 1);

        let state = states.values().next().unwrap();
        assert_eq!(state.rf_ms, 2_000);
        assert_eq!(state.limits["tpm"].tc_delta_milli, 3_000_000);
    }
}
