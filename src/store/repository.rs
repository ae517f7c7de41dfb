//! Typed repository over the wide-row store
//!
//! All store I/O for one namespace: entities, configs, composite buckets,
//! usage snapshots, audit records, and the version gate. Key and attribute
//! names come exclusively from [`crate::schema`]; upper layers receive
//! typed results and never see raw items. No business logic lives here.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use tracing::debug;

use super::ops::{Condition, DeleteOp, Key, PutOp, TransactItem, UpdateOp};
use super::value::{get_bool, get_n, get_s, AttrValue, Item};
use super::{IndexName, StoreError, WideRowStore, MAX_BATCH_GET, MAX_BATCH_WRITE};
use crate::error::{Result, SluiceError};
use crate::models::{
    AuditRecord, BucketState, Entity, FailureMode, Limit, UsageSnapshot, VersionRecord, Window,
    MILLI,
};
use crate::schema;

/// Default write-capacity budget tracked by the `__wcu__` virtual limit:
/// 1000 write units per minute per shard.
pub const WCU_DEFAULT_CAPACITY: i64 = 1000;

/// Refill period of the `__wcu__` virtual limit, in milliseconds.
pub const WCU_REFILL_PERIOD_MS: i64 = 60_000;

/// A composite bucket row decoded into per-limit states plus row metadata.
#[derive(Debug, Clone)]
pub struct BucketRow {
    /// Owning entity.
    pub entity_id: String,
    /// Resource the bucket throttles.
    pub resource: String,
    /// Shard index of this row.
    pub shard: u32,
    /// Total shard count recorded on the row.
    pub shard_count: u32,
    /// Shared refill timestamp.
    pub rf_ms: i64,
    /// Per-limit states, including `__wcu__`.
    pub states: Vec<BucketState>,
}

impl BucketRow {
    /// State of one limit, if present on the row.
    pub fn state(&self, limit_name: &str) -> Option<&BucketState> {
        self.states.iter().find(|s| s.limit_name == limit_name)
    }

    /// Per-limit states excluding the `__wcu__` infrastructure limit.
    pub fn user_states(&self) -> Vec<&BucketState> {
        self.states
            .iter()
            .filter(|s| s.limit_name != schema::WCU_LIMIT_NAME)
            .collect()
    }
}

/// Namespace-scoped repository.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn WideRowStore>,
    ns: String,
}

impl Repository {
    /// Repository over a store, scoped to one namespace id.
    pub fn new(store: Arc<dyn WideRowStore>, namespace_id: impl Into<String>) -> Self {
        Self {
            store,
            ns: namespace_id.into(),
        }
    }

    /// The namespace id every key is prefixed with.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Arc<dyn WideRowStore> {
        &self.store
    }

    /// Same store, different namespace.
    pub fn with_namespace(&self, namespace_id: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ns: namespace_id.into(),
        }
    }

    /// Health probe: false on any store error.
    pub async fn ping(&self) -> bool {
        self.store.ping().await
    }

    // ========================================================================
    // Entities
    // ========================================================================

    fn entity_key(&self, entity_id: &str) -> Key {
        Key::new(schema::pk_entity(&self.ns, entity_id), schema::SK_META)
    }

    fn entity_item(&self, entity: &Entity) -> Item {
        let mut item = Item::new();
        item.insert("entity_id".into(), entity.id.as_str().into());
        if let Some(name) = &entity.name {
            item.insert("name".into(), name.as_str().into());
        }
        if let Some(parent) = &entity.parent_id {
            item.insert("parent_id".into(), parent.as_str().into());
        }
        item.insert("cascade".into(), entity.cascade.into());
        if !entity.metadata.is_null() {
            item.insert("metadata".into(), AttrValue::from_json(&entity.metadata));
        }
        item.insert("GSI4PK".into(), self.ns.as_str().into());
        item
    }

    fn item_to_entity(item: &Item) -> Entity {
        Entity {
            id: get_s(item, "entity_id").unwrap_or_default().to_string(),
            name: get_s(item, "name").map(str::to_string),
            parent_id: get_s(item, "parent_id").map(str::to_string),
            cascade: get_bool(item, "cascade").unwrap_or(false),
            metadata: item
                .get("metadata")
                .map(AttrValue::to_json)
                .unwrap_or(serde_json::Value::Null),
        }
    }

    /// Create an entity, failing if it already exists. The audit record is
    /// written in the same transaction.
    pub async fn create_entity(&self, entity: &Entity, audit: Option<AuditRecord>) -> Result<()> {
        let put = PutOp::new(self.entity_key(&entity.id), self.entity_item(entity))
            .condition(Condition::KeyNotExists);

        let mut items = vec![TransactItem::Put(put)];
        if let Some(record) = audit {
            items.push(TransactItem::Put(self.audit_put_op(&record)));
        }

        self.store.transact_write(items).await.map_err(|err| match err {
            StoreError::ConditionFailed | StoreError::TransactionCanceled(_) => {
                SluiceError::EntityExists(entity.id.clone())
            }
            other => other.into(),
        })
    }

    /// Fetch one entity's metadata.
    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        let item = self.store.get_item(&self.entity_key(entity_id)).await?;
        Ok(item.as_ref().map(Self::item_to_entity))
    }

    /// All entities whose `parent_id` is the given entity.
    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<Entity>> {
        let rows = self.store.query_index(IndexName::Gsi4, &self.ns, None).await?;
        Ok(rows
            .iter()
            .filter(|item| get_s(item, "SK") == Some(schema::SK_META))
            .filter(|item| get_s(item, "parent_id") == Some(parent_id))
            .map(Self::item_to_entity)
            .collect())
    }

    /// Delete an entity and every row it owns: metadata, configs, usage
    /// snapshots, bucket shards, and audit history. Deletes are chunked and
    /// drained; registry counters for the entity's configs are released.
    pub async fn delete_entity(&self, entity_id: &str) -> Result<()> {
        let mut keys: Vec<Key> = Vec::new();
        let mut config_resources: Vec<String> = Vec::new();

        // Rows under the entity partition: #META, #CONFIG..., #USAGE...
        let entity_pk = schema::pk_entity(&self.ns, entity_id);
        for item in self.store.query_prefix(&entity_pk, "").await? {
            if let Some(sk) = get_s(&item, "SK") {
                if let Some(resource) = sk
                    .strip_prefix(schema::SK_CONFIG)
                    .and_then(|rest| rest.strip_prefix('#'))
                {
                    config_resources.push(resource.to_string());
                }
                keys.push(Key::new(entity_pk.clone(), sk.to_string()));
            }
        }

        // Bucket shards, discovered through GSI3.
        for item in self
            .store
            .query_index(IndexName::Gsi3, &schema::gsi3_pk_entity(&self.ns, entity_id), None)
            .await?
        {
            if let (Some(pk), Some(sk)) = (get_s(&item, "PK"), get_s(&item, "SK")) {
                keys.push(Key::new(pk.to_string(), sk.to_string()));
            }
        }

        // Audit history.
        let audit_pk = schema::pk_audit(&self.ns, entity_id);
        for item in self.store.query_prefix(&audit_pk, "").await? {
            if let Some(sk) = get_s(&item, "SK") {
                keys.push(Key::new(audit_pk.clone(), sk.to_string()));
            }
        }

        debug!(entity_id, rows = keys.len(), "deleting entity rows");
        for chunk in keys.chunks(MAX_BATCH_WRITE) {
            self.store.batch_delete(chunk).await?;
        }

        for resource in config_resources {
            self.release_registry_count(&resource).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Configs
    // ========================================================================

    fn config_item(&self, limits: &[Limit], extra: &[(&str, AttrValue)]) -> Item {
        let mut item = Item::new();
        for limit in limits {
            item.insert(schema::limit_attr(&limit.name, schema::FIELD_CP).into(), AttrValue::N(limit.capacity));
            item.insert(schema::limit_attr(&limit.name, schema::FIELD_BX).into(), AttrValue::N(limit.burst));
            item.insert(
                schema::limit_attr(&limit.name, schema::FIELD_RA).into(),
                AttrValue::N(limit.refill_amount),
            );
            item.insert(
                schema::limit_attr(&limit.name, schema::FIELD_RP).into(),
                AttrValue::N(limit.refill_period.as_secs() as i64),
            );
        }
        for (attr, value) in extra {
            item.insert((*attr).into(), value.clone());
        }
        item.insert("GSI4PK".into(), self.ns.as_str().into());
        item
    }

    fn item_to_limits(item: &Item) -> Vec<Limit> {
        let mut by_name: HashMap<&str, Limit> = HashMap::new();
        for (attr, value) in item {
            let Some((name, field)) = schema::parse_limit_attr(attr) else {
                continue;
            };
            let Some(n) = value.as_i64() else { continue };
            let limit = by_name.entry(name).or_insert_with(|| Limit {
                name: name.to_string(),
                capacity: 0,
                burst: 0,
                refill_amount: 0,
                refill_period: std::time::Duration::from_secs(60),
            });
            match field {
                schema::FIELD_CP => limit.capacity = n,
                schema::FIELD_BX => limit.burst = n,
                schema::FIELD_RA => limit.refill_amount = n,
                schema::FIELD_RP => limit.refill_period = std::time::Duration::from_secs(n as u64),
                _ => {}
            }
        }
        let mut limits: Vec<Limit> = by_name.into_values().collect();
        limits.sort_by(|a, b| a.name.cmp(&b.name));
        limits
    }

    /// Write system-level defaults and the optional unavailability policy.
    pub async fn set_system_config(
        &self,
        limits: &[Limit],
        on_unavailable: Option<FailureMode>,
    ) -> Result<()> {
        let mut extra: Vec<(&str, AttrValue)> = Vec::new();
        if let Some(mode) = on_unavailable {
            extra.push(("on_unavailable", AttrValue::S(mode.to_string())));
        }
        let key = Key::new(schema::pk_system(&self.ns), schema::sk_config(None));
        self.store
            .put_item(PutOp::new(key, self.config_item(limits, &extra)))
            .await?;
        Ok(())
    }

    /// Read system-level defaults. `None` when no system config exists.
    pub async fn get_system_config(&self) -> Result<Option<(Vec<Limit>, Option<FailureMode>)>> {
        let key = Key::new(schema::pk_system(&self.ns), schema::sk_config(None));
        let Some(item) = self.store.get_item(&key).await? else {
            return Ok(None);
        };
        let mode = get_s(&item, "on_unavailable").and_then(|s| s.parse().ok());
        Ok(Some((Self::item_to_limits(&item), mode)))
    }

    /// Remove system-level defaults.
    pub async fn delete_system_config(&self) -> Result<()> {
        let key = Key::new(schema::pk_system(&self.ns), schema::sk_config(None));
        self.store.delete_item(DeleteOp::new(key)).await?;
        Ok(())
    }

    /// Write resource-level defaults.
    pub async fn set_resource_config(&self, resource: &str, limits: &[Limit]) -> Result<()> {
        let key = Key::new(schema::pk_resource(&self.ns, resource), schema::sk_config(None));
        let item = self.config_item(limits, &[("resource", AttrValue::S(resource.into()))]);
        self.store.put_item(PutOp::new(key, item)).await?;
        Ok(())
    }

    /// Read resource-level defaults. Empty when none are stored.
    pub async fn get_resource_config(&self, resource: &str) -> Result<Vec<Limit>> {
        let key = Key::new(schema::pk_resource(&self.ns, resource), schema::sk_config(None));
        Ok(self
            .store
            .get_item(&key)
            .await?
            .map(|item| Self::item_to_limits(&item))
            .unwrap_or_default())
    }

    /// Remove resource-level defaults.
    pub async fn delete_resource_config(&self, resource: &str) -> Result<()> {
        let key = Key::new(schema::pk_resource(&self.ns, resource), schema::sk_config(None));
        self.store.delete_item(DeleteOp::new(key)).await?;
        Ok(())
    }

    /// Resources with stored resource-level defaults.
    pub async fn list_resource_configs(&self) -> Result<Vec<String>> {
        let rows = self.store.query_index(IndexName::Gsi4, &self.ns, None).await?;
        let mut resources: Vec<String> = rows
            .iter()
            .filter(|item| get_s(item, "SK") == Some(schema::SK_CONFIG))
            .filter_map(|item| get_s(item, "PK"))
            .filter_map(|pk| pk.split_once("/RESOURCE#").map(|(_, r)| r.to_string()))
            .collect();
        resources.sort();
        resources.dedup();
        Ok(resources)
    }

    /// Write entity-level limits, optionally scoped to a resource. The
    /// per-namespace config registry counter is bumped on first write of a
    /// resource-scoped config; re-writing the same config does not
    /// double-count.
    pub async fn set_entity_config(
        &self,
        entity_id: &str,
        resource: Option<&str>,
        limits: &[Limit],
        audit: Option<AuditRecord>,
    ) -> Result<()> {
        let key = Key::new(schema::pk_entity(&self.ns, entity_id), schema::sk_config(resource));
        let existed = self.store.get_item(&key).await?.is_some();

        let mut extra: Vec<(&str, AttrValue)> =
            vec![("entity_id", AttrValue::S(entity_id.into()))];
        if let Some(r) = resource {
            extra.push(("resource", AttrValue::S(r.into())));
        }

        let mut items = vec![TransactItem::Put(PutOp::new(key, self.config_item(limits, &extra)))];
        if let (Some(r), false) = (resource, existed) {
            items.push(TransactItem::Update(
                UpdateOp::new(Key::new(schema::pk_system(&self.ns), schema::SK_CONFIG_RESOURCES))
                    .add(schema::registry_attr(r), 1)
                    .set_if_not_exists("GSI4PK", self.ns.as_str()),
            ));
        }
        if let Some(record) = audit {
            items.push(TransactItem::Put(self.audit_put_op(&record)));
        }
        self.store.transact_write(items).await?;
        Ok(())
    }

    /// Read entity-level limits. Empty when none are stored.
    pub async fn get_entity_config(
        &self,
        entity_id: &str,
        resource: Option<&str>,
    ) -> Result<Vec<Limit>> {
        let key = Key::new(schema::pk_entity(&self.ns, entity_id), schema::sk_config(resource));
        Ok(self
            .store
            .get_item(&key)
            .await?
            .map(|item| Self::item_to_limits(&item))
            .unwrap_or_default())
    }

    /// Remove entity-level limits and release the registry counter.
    pub async fn delete_entity_config(
        &self,
        entity_id: &str,
        resource: Option<&str>,
        audit: Option<AuditRecord>,
    ) -> Result<()> {
        let key = Key::new(schema::pk_entity(&self.ns, entity_id), schema::sk_config(resource));
        let existed = self.store.get_item(&key).await?.is_some();

        let mut items = vec![TransactItem::Delete(DeleteOp::new(key))];
        if let Some(record) = audit {
            items.push(TransactItem::Put(self.audit_put_op(&record)));
        }
        self.store.transact_write(items).await?;

        if let (Some(r), true) = (resource, existed) {
            self.release_registry_count(r).await?;
        }
        Ok(())
    }

    /// Per-resource counters of entity-level configs in this namespace.
    pub async fn get_config_registry(&self) -> Result<HashMap<String, i64>> {
        let key = Key::new(schema::pk_system(&self.ns), schema::SK_CONFIG_RESOURCES);
        let Some(item) = self.store.get_item(&key).await? else {
            return Ok(HashMap::new());
        };
        Ok(item
            .iter()
            .filter_map(|(attr, value)| {
                let resource = schema::parse_registry_attr(attr)?;
                Some((resource.to_string(), value.as_i64()?))
            })
            .collect())
    }

    /// Decrement one registry counter, removing the attribute at zero.
    async fn release_registry_count(&self, resource: &str) -> Result<()> {
        let key = Key::new(schema::pk_system(&self.ns), schema::SK_CONFIG_RESOURCES);
        let attr = schema::registry_attr(resource);
        let new = self
            .store
            .update_item(UpdateOp::new(key.clone()).add(attr.clone(), -1))
            .await?;
        if new.get(&attr).and_then(AttrValue::as_i64).unwrap_or(0) <= 0 {
            self.store
                .update_item(UpdateOp::new(key).remove(attr))
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Buckets
    // ========================================================================

    /// Key of one bucket shard row.
    pub fn bucket_key(&self, entity_id: &str, resource: &str, shard: u32) -> Key {
        Key::new(
            schema::pk_bucket(&self.ns, entity_id, resource, shard),
            schema::SK_STATE,
        )
    }

    /// Decode a bucket row item.
    pub fn item_to_bucket_row(item: &Item) -> Option<BucketRow> {
        let entity_id = get_s(item, "entity_id")?.to_string();
        let resource = get_s(item, "resource")?.to_string();
        let rf_ms = get_n(item, "rf")?;
        let shard_count = get_n(item, "shard_count").unwrap_or(1) as u32;
        let shard = get_s(item, "PK")
            .and_then(|pk| pk.rsplit('#').next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let names = schema::limit_names_in(item.keys().map(String::as_str));
        let states = names
            .into_iter()
            .filter_map(|name| {
                let field = |f: &str| get_n(item, &schema::bucket_attr(&name, f));
                Some(BucketState {
                    entity_id: entity_id.clone(),
                    resource: resource.clone(),
                    limit_name: name.clone(),
                    tokens_milli: field(schema::FIELD_TK)?,
                    last_refill_ms: rf_ms,
                    capacity_milli: field(schema::FIELD_CP)?,
                    burst_milli: field(schema::FIELD_BX).or(field(schema::FIELD_CP))?,
                    refill_amount_milli: field(schema::FIELD_RA)?,
                    refill_period_ms: field(schema::FIELD_RP)?,
                })
            })
            .collect();

        Some(BucketRow {
            entity_id,
            resource,
            shard,
            shard_count,
            rf_ms,
            states,
        })
    }

    /// Read one bucket shard row.
    pub async fn get_bucket(
        &self,
        entity_id: &str,
        resource: &str,
        shard: u32,
    ) -> Result<Option<BucketRow>> {
        let item = self.store.get_item(&self.bucket_key(entity_id, resource, shard)).await?;
        Ok(item.as_ref().and_then(Self::item_to_bucket_row))
    }

    /// Batch-read bucket shard rows, chunked at the store's batch-get limit
    /// and deduplicated. The result is keyed by `(entity_id, resource)`.
    pub async fn batch_get_buckets(
        &self,
        requests: &[(String, String, u32)],
    ) -> Result<HashMap<(String, String), BucketRow>> {
        let mut keys: Vec<Key> = requests
            .iter()
            .map(|(entity, resource, shard)| self.bucket_key(entity, resource, *shard))
            .collect();
        keys.sort();
        keys.dedup();

        let chunks = keys.chunks(MAX_BATCH_GET).map(|chunk| self.store.batch_get(chunk));
        let mut rows = HashMap::new();
        for fetched in future::try_join_all(chunks).await? {
            for item in fetched.values() {
                if let Some(row) = Self::item_to_bucket_row(item) {
                    rows.insert((row.entity_id.clone(), row.resource.clone()), row);
                }
            }
        }
        Ok(rows)
    }

    /// Build the first-touch put for a bucket shard. The row starts with
    /// every user limit at its burst ceiling minus the speculative consume,
    /// plus the `__wcu__` infrastructure limit. Guarded on key absence so a
    /// concurrent first touch cancels the transaction and forces a re-read.
    pub fn build_bucket_put(
        &self,
        entity_id: &str,
        resource: &str,
        shard: u32,
        limits: &[Limit],
        consumed: &HashMap<String, i64>,
        now_ms: i64,
        cascade: bool,
        parent_id: Option<&str>,
    ) -> PutOp {
        let mut item = Item::new();
        item.insert("entity_id".into(), entity_id.into());
        item.insert("resource".into(), resource.into());
        item.insert("rf".into(), AttrValue::N(now_ms));
        item.insert("shard_count".into(), AttrValue::N(1));
        item.insert("cascade".into(), cascade.into());
        if let Some(parent) = parent_id {
            item.insert("parent_id".into(), parent.into());
        }
        item.insert("GSI2PK".into(), schema::gsi2_pk_resource(&self.ns, resource).into());
        item.insert("GSI2SK".into(), schema::gsi2_sk_bucket(entity_id, shard).into());
        item.insert("GSI3PK".into(), schema::gsi3_pk_entity(&self.ns, entity_id).into());
        item.insert("GSI3SK".into(), schema::gsi3_sk_bucket(resource, shard).into());
        item.insert("GSI4PK".into(), self.ns.as_str().into());

        for limit in limits {
            let consumed_milli = consumed.get(&limit.name).copied().unwrap_or(0) * MILLI;
            let attr = |f: &str| schema::bucket_attr(&limit.name, f);
            item.insert(attr(schema::FIELD_TK).into(), AttrValue::N(limit.burst_milli() - consumed_milli));
            item.insert(attr(schema::FIELD_CP).into(), AttrValue::N(limit.capacity_milli()));
            item.insert(attr(schema::FIELD_BX).into(), AttrValue::N(limit.burst_milli()));
            item.insert(attr(schema::FIELD_RA).into(), AttrValue::N(limit.refill_amount_milli()));
            item.insert(attr(schema::FIELD_RP).into(), AttrValue::N(limit.refill_period_ms()));
            item.insert(attr(schema::FIELD_TC).into(), AttrValue::N(consumed_milli));
        }

        // Seed the write-capacity virtual limit; one unit for this write.
        let wcu = |f: &str| schema::bucket_attr(schema::WCU_LIMIT_NAME, f);
        item.insert(wcu(schema::FIELD_TK).into(), AttrValue::N((WCU_DEFAULT_CAPACITY - 1) * MILLI));
        item.insert(wcu(schema::FIELD_CP).into(), AttrValue::N(WCU_DEFAULT_CAPACITY * MILLI));
        item.insert(wcu(schema::FIELD_BX).into(), AttrValue::N(WCU_DEFAULT_CAPACITY * MILLI));
        item.insert(wcu(schema::FIELD_RA).into(), AttrValue::N(WCU_DEFAULT_CAPACITY * MILLI));
        item.insert(wcu(schema::FIELD_RP).into(), AttrValue::N(WCU_REFILL_PERIOD_MS));
        item.insert(wcu(schema::FIELD_TC).into(), AttrValue::N(MILLI));

        PutOp::new(self.bucket_key(entity_id, resource, shard), item)
            .condition(Condition::KeyNotExists)
    }

    /// Build the conditional update for an existing bucket shard.
    ///
    /// `tk`/`tc` move with ADD so the write commutes with the aggregator's
    /// refill; the `rf` SET is guarded on the previously observed value,
    /// which is the optimistic lock serialising committed state.
    pub fn build_bucket_update(
        &self,
        entity_id: &str,
        resource: &str,
        shard: u32,
        old_rf_ms: i64,
        new_rf_ms: i64,
        consumed_milli: &[(String, i64)],
    ) -> UpdateOp {
        let mut op = UpdateOp::new(self.bucket_key(entity_id, resource, shard))
            .set("rf", new_rf_ms)
            .condition(Condition::Equals("rf".into(), AttrValue::N(old_rf_ms)));

        for (limit_name, delta_milli) in consumed_milli {
            op = op
                .add(schema::bucket_attr(limit_name, schema::FIELD_TK), -delta_milli)
                .add(schema::bucket_attr(limit_name, schema::FIELD_TC), *delta_milli);
        }

        // One write unit against the infrastructure limit.
        op.add(schema::bucket_attr(schema::WCU_LIMIT_NAME, schema::FIELD_TK), -MILLI)
            .add(schema::bucket_attr(schema::WCU_LIMIT_NAME, schema::FIELD_TC), MILLI)
    }

    /// Build an unconditional counter adjustment (lease commit/rollback).
    /// Pure ADDs: commutes with every other writer, so no `rf` guard.
    pub fn build_bucket_adjust(
        &self,
        entity_id: &str,
        resource: &str,
        shard: u32,
        deltas_milli: &[(String, i64)],
    ) -> UpdateOp {
        let mut op = UpdateOp::new(self.bucket_key(entity_id, resource, shard));
        for (limit_name, delta_milli) in deltas_milli {
            op = op
                .add(schema::bucket_attr(limit_name, schema::FIELD_TK), -delta_milli)
                .add(schema::bucket_attr(limit_name, schema::FIELD_TC), *delta_milli);
        }
        op
    }

    /// Submit the acquire transaction.
    pub async fn transact_acquire(&self, items: Vec<TransactItem>) -> std::result::Result<(), StoreError> {
        self.store.transact_write(items).await
    }

    /// All bucket shard rows of one entity, via GSI3.
    pub async fn get_entity_buckets(&self, entity_id: &str) -> Result<Vec<BucketRow>> {
        let rows = self
            .store
            .query_index(IndexName::Gsi3, &schema::gsi3_pk_entity(&self.ns, entity_id), None)
            .await?;
        Ok(rows.iter().filter_map(Self::item_to_bucket_row).collect())
    }

    /// All bucket states touching one resource across entities, via GSI2,
    /// optionally filtered to a single limit name.
    pub async fn get_resource_buckets(
        &self,
        resource: &str,
        limit_name: Option<&str>,
    ) -> Result<Vec<BucketState>> {
        let rows = self
            .store
            .query_index(IndexName::Gsi2, &schema::gsi2_pk_resource(&self.ns, resource), None)
            .await?;
        Ok(rows
            .iter()
            .filter(|item| get_s(item, "SK") == Some(schema::SK_STATE))
            .filter_map(Self::item_to_bucket_row)
            .flat_map(|row| row.states)
            .filter(|state| limit_name.map_or(true, |name| state.limit_name == name))
            .collect())
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Build the put for an audit record (transaction member).
    pub fn audit_put_op(&self, record: &AuditRecord) -> PutOp {
        let mut item = Item::new();
        item.insert("event_id".into(), record.event_id.as_str().into());
        item.insert("timestamp".into(), record.timestamp.as_str().into());
        item.insert("entity_id".into(), record.entity_id.as_str().into());
        item.insert("action".into(), record.action.to_string().into());
        if let Some(principal) = &record.principal {
            item.insert("principal".into(), principal.as_str().into());
        }
        if let Some(resource) = &record.resource {
            item.insert("resource".into(), resource.as_str().into());
        }
        if !record.details.is_null() {
            item.insert("details".into(), AttrValue::from_json(&record.details));
        }
        item.insert("ttl".into(), AttrValue::N(record.ttl_epoch_s));
        item.insert("GSI4PK".into(), self.ns.as_str().into());

        PutOp::new(
            Key::new(
                schema::pk_audit(&self.ns, &record.entity_id),
                schema::sk_audit(&record.event_id),
            ),
            item,
        )
    }

    /// Write one audit record outside a transaction.
    pub async fn put_audit(&self, record: &AuditRecord) -> Result<()> {
        self.store.put_item(self.audit_put_op(record)).await?;
        Ok(())
    }

    /// Audit history of an entity, in creation order.
    pub async fn query_audit(&self, entity_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = self
            .store
            .query_prefix(&schema::pk_audit(&self.ns, entity_id), schema::SK_AUDIT)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|item| {
                Some(AuditRecord {
                    event_id: get_s(item, "event_id")?.to_string(),
                    timestamp: get_s(item, "timestamp")?.to_string(),
                    entity_id: get_s(item, "entity_id")?.to_string(),
                    action: serde_json::from_value(serde_json::Value::String(
                        get_s(item, "action")?.to_string(),
                    ))
                    .ok()?,
                    principal: get_s(item, "principal").map(str::to_string),
                    resource: get_s(item, "resource").map(str::to_string),
                    details: item
                        .get("details")
                        .map(AttrValue::to_json)
                        .unwrap_or(serde_json::Value::Null),
                    ttl_epoch_s: get_n(item, "ttl")?,
                })
            })
            .collect())
    }

    // ========================================================================
    // Usage snapshots
    // ========================================================================

    /// Usage snapshots of one (entity, resource), newest window first.
    pub async fn query_usage(
        &self,
        entity_id: &str,
        resource: &str,
        window: Window,
    ) -> Result<Vec<UsageSnapshot>> {
        let prefix = format!("{}#{resource}#", schema::SK_USAGE);
        let rows = self
            .store
            .query_prefix(&schema::pk_entity(&self.ns, entity_id), &prefix)
            .await?;
        let mut snapshots: Vec<UsageSnapshot> = rows
            .iter()
            .filter(|item| get_s(item, "window") == Some(window.as_str()))
            .filter_map(|item| {
                let counters = item
                    .iter()
                    .filter(|(attr, _)| {
                        !attr.starts_with("GSI")
                            && ![
                                "PK", "SK", "entity_id", "resource", "window", "window_start",
                                "total_events", "ttl",
                            ]
                            .contains(&attr.as_str())
                    })
                    .filter_map(|(attr, value)| Some((attr.clone(), value.as_i64()?)))
                    .collect();
                Some(UsageSnapshot {
                    entity_id: get_s(item, "entity_id")?.to_string(),
                    resource: get_s(item, "resource")?.to_string(),
                    window,
                    window_start: get_s(item, "window_start")?.to_string(),
                    counters,
                    total_events: get_n(item, "total_events").unwrap_or(0),
                })
            })
            .collect();
        snapshots.sort_by(|a, b| b.window_start.cmp(&a.window_start));
        Ok(snapshots)
    }

    // ========================================================================
    // Version record
    // ========================================================================

    /// Read the deployment version record.
    pub async fn get_version_record(&self) -> Result<Option<VersionRecord>> {
        let key = Key::new(schema::pk_system(schema::RESERVED_NAMESPACE), schema::SK_VERSION);
        let Some(item) = self.store.get_item(&key).await? else {
            return Ok(None);
        };
        Ok(Some(VersionRecord {
            schema_version: get_n(&item, "schema_version").unwrap_or(0) as u32,
            min_client_version: get_s(&item, "min_client_version").unwrap_or("0.0.0").to_string(),
            aggregator_version: get_s(&item, "aggregator_version").map(str::to_string),
            updated_at_ms: get_n(&item, "updated_at").unwrap_or(0),
            updated_by: get_s(&item, "updated_by").map(str::to_string),
        }))
    }

    /// Write the deployment version record.
    pub async fn set_version_record(&self, record: &VersionRecord) -> Result<()> {
        let mut item = Item::new();
        item.insert("schema_version".into(), record.schema_version.into());
        item.insert("min_client_version".into(), record.min_client_version.as_str().into());
        if let Some(v) = &record.aggregator_version {
            item.insert("aggregator_version".into(), v.as_str().into());
        }
        item.insert("updated_at".into(), AttrValue::N(record.updated_at_ms));
        if let Some(by) = &record.updated_by {
            item.insert("updated_by".into(), by.as_str().into());
        }
        let key = Key::new(schema::pk_system(schema::RESERVED_NAMESPACE), schema::SK_VERSION);
        self.store.put_item(PutOp::new(key, item)).await?;
        Ok(())
    }
}
