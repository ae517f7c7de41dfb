//! In-process store backend
//!
//! A single ordered map behind one lock, which makes every transaction
//! trivially atomic and serialisable. Implements the full contract:
//! conditional writes, transactions, index queries (by attribute scan),
//! TTL expiry, and change-stream capture with before/after images.
//!
//! Backs the test suites and the local CLI state file. Not a production
//! store; the point is contract fidelity, not throughput.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::ops::{Condition, DeleteOp, Key, PutOp, TransactItem, UpdateOp};
use super::value::{AttrValue, Item};
use super::{
    IndexName, StoreError, StreamEventType, StreamRecord, WideRowStore, MAX_BATCH_GET,
    MAX_BATCH_WRITE, MAX_TRANSACT_ITEMS,
};
use async_trait::async_trait;

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<Key, Item>,
    stream: Vec<StreamRecord>,
}

/// In-memory [`WideRowStore`] with change-stream capture.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the captured change stream in commit order.
    pub fn drain_stream(&self) -> Vec<StreamRecord> {
        std::mem::take(&mut self.inner.lock().stream)
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().rows.is_empty()
    }

    /// Remove every row whose `ttl` attribute (epoch seconds) has passed,
    /// emitting REMOVE stream records the way the hosted store's expiry
    /// sweeper does. Returns the number of rows expired.
    pub fn expire_ttl(&self, now_epoch_s: i64) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<Key> = inner
            .rows
            .iter()
            .filter(|(_, item)| {
                item.get("ttl")
                    .and_then(AttrValue::as_i64)
                    .is_some_and(|ttl| ttl <= now_epoch_s)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            let old = inner.rows.remove(key);
            inner.stream.push(StreamRecord {
                event: StreamEventType::Remove,
                key: key.clone(),
                old_image: old,
                new_image: None,
            });
        }
        expired.len()
    }

    /// Serialize the full table to JSON (CLI state file).
    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let rows: Vec<serde_json::Value> = inner
            .rows
            .values()
            .map(|item| serde_json::to_value(item).unwrap_or(serde_json::Value::Null))
            .collect();
        serde_json::json!({ "rows": rows })
    }

    /// Restore a table previously produced by [`MemoryStore::to_json`].
    pub fn from_json(value: &serde_json::Value) -> Result<Self, StoreError> {
        let store = Self::new();
        let rows = value
            .get("rows")
            .and_then(|r| r.as_array())
            .ok_or_else(|| StoreError::Validation("state file missing 'rows'".into()))?;
        {
            let mut inner = store.inner.lock();
            for row in rows {
                let item: Item = serde_json::from_value(row.clone())
                    .map_err(|e| StoreError::Validation(format!("bad row in state file: {e}")))?;
                let key = key_of(&item)
                    .ok_or_else(|| StoreError::Validation("row without PK/SK".into()))?;
                inner.rows.insert(key, item);
            }
        }
        Ok(store)
    }

    /// Direct row read without going through the async trait (test helper).
    pub fn get_raw(&self, key: &Key) -> Option<Item> {
        self.inner.lock().rows.get(key).cloned()
    }
}

fn key_of(item: &Item) -> Option<Key> {
    Some(Key::new(
        item.get("PK")?.as_str()?.to_string(),
        item.get("SK")?.as_str()?.to_string(),
    ))
}

fn with_key_attrs(key: &Key, mut item: Item) -> Item {
    item.insert("PK".into(), AttrValue::S(key.pk.clone()));
    item.insert("SK".into(), AttrValue::S(key.sk.clone()));
    item
}

fn check_condition(condition: &Condition, existing: Option<&Item>) -> Result<(), StoreError> {
    let ok = match condition {
        Condition::KeyNotExists => existing.is_none(),
        Condition::AttributeExists(attr) => existing.is_some_and(|item| item.contains_key(attr)),
        Condition::Equals(attr, expected) => {
            existing.and_then(|item| item.get(attr)) == Some(expected)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::ConditionFailed)
    }
}

/// Apply an update to a row image, creating the row when absent.
fn apply_update(op: &UpdateOp, existing: Option<&Item>) -> Item {
    let mut item = existing.cloned().unwrap_or_default();
    for (attr, value) in &op.set {
        item.insert(attr.clone(), value.clone());
    }
    for (attr, value) in &op.set_if_not_exists {
        item.entry(attr.clone()).or_insert_with(|| value.clone());
    }
    for (attr, delta) in &op.add {
        let current = item.get(attr).and_then(AttrValue::as_i64).unwrap_or(0);
        item.insert(attr.clone(), AttrValue::N(current + delta));
    }
    for attr in &op.remove {
        item.remove(attr);
    }
    item
}

impl Inner {
    fn record(&mut self, key: &Key, old: Option<Item>, new: Option<Item>) {
        let event = match (&old, &new) {
            (None, Some(_)) => StreamEventType::Insert,
            (Some(_), Some(_)) => StreamEventType::Modify,
            _ => StreamEventType::Remove,
        };
        self.stream.push(StreamRecord {
            event,
            key: key.clone(),
            old_image: old,
            new_image: new,
        });
    }

    fn execute(&mut self, item: &TransactItem) -> Result<(), StoreError> {
        match item {
            TransactItem::Put(op) => {
                let old = self.rows.get(&op.key).cloned();
                if let Some(cond) = &op.condition {
                    check_condition(cond, old.as_ref())?;
                }
                let new = with_key_attrs(&op.key, op.item.clone());
                self.rows.insert(op.key.clone(), new.clone());
                self.record(&op.key, old, Some(new));
            }
            TransactItem::Update(op) => {
                let old = self.rows.get(&op.key).cloned();
                if let Some(cond) = &op.condition {
                    check_condition(cond, old.as_ref())?;
                }
                let new = with_key_attrs(&op.key, apply_update(op, old.as_ref()));
                self.rows.insert(op.key.clone(), new.clone());
                self.record(&op.key, old, Some(new));
            }
            TransactItem::Delete(op) => {
                let old = self.rows.get(&op.key).cloned();
                if let Some(cond) = &op.condition {
                    check_condition(cond, old.as_ref())?;
                }
                if old.is_some() {
                    self.rows.remove(&op.key);
                    self.record(&op.key, old, None);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WideRowStore for MemoryStore {
    async fn get_item(&self, key: &Key) -> Result<Option<Item>, StoreError> {
        Ok(self.inner.lock().rows.get(key).cloned())
    }

    async fn batch_get(&self, keys: &[Key]) -> Result<HashMap<Key, Item>, StoreError> {
        if keys.len() > MAX_BATCH_GET {
            return Err(StoreError::Validation(format!(
                "batch get of {} keys exceeds the {MAX_BATCH_GET}-key limit",
                keys.len()
            )));
        }
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .filter_map(|k| inner.rows.get(k).map(|item| (k.clone(), item.clone())))
            .collect())
    }

    async fn put_item(&self, op: PutOp) -> Result<(), StoreError> {
        self.inner.lock().execute(&TransactItem::Put(op))
    }

    async fn update_item(&self, op: UpdateOp) -> Result<Item, StoreError> {
        let mut inner = self.inner.lock();
        let key = op.key.clone();
        inner.execute(&TransactItem::Update(op))?;
        Ok(inner.rows.get(&key).cloned().unwrap_or_default())
    }

    async fn delete_item(&self, op: DeleteOp) -> Result<(), StoreError> {
        self.inner.lock().execute(&TransactItem::Delete(op))
    }

    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        if items.len() > MAX_TRANSACT_ITEMS {
            return Err(StoreError::Validation(format!(
                "transaction of {} items exceeds the {MAX_TRANSACT_ITEMS}-item limit",
                items.len()
            )));
        }

        let mut inner = self.inner.lock();

        // Validate every condition before mutating anything so the
        // transaction is all-or-nothing.
        let mut reasons = Vec::with_capacity(items.len());
        let mut any_failed = false;
        for item in &items {
            let existing = inner.rows.get(item.key());
            let condition = match item {
                TransactItem::Put(op) => &op.condition,
                TransactItem::Update(op) => &op.condition,
                TransactItem::Delete(op) => &op.condition,
            };
            match condition {
                Some(cond) if check_condition(cond, existing).is_err() => {
                    any_failed = true;
                    reasons.push("ConditionalCheckFailed".to_string());
                }
                _ => reasons.push("None".to_string()),
            }
        }
        if any_failed {
            return Err(StoreError::TransactionCanceled(reasons));
        }

        for item in &items {
            inner.execute(item)?;
        }
        Ok(())
    }

    async fn query_prefix(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .range(Key::new(pk, sk_prefix.to_string())..)
            .take_while(|(k, _)| k.pk == pk && k.sk.starts_with(sk_prefix))
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn query_index(
        &self,
        index: IndexName,
        pk: &str,
        sk_prefix: Option<&str>,
    ) -> Result<Vec<Item>, StoreError> {
        let inner = self.inner.lock();
        let pk_attr = index.pk_attr();
        let sk_attr = index.sk_attr();

        let mut matches: Vec<Item> = inner
            .rows
            .values()
            .filter(|item| item.get(pk_attr).and_then(AttrValue::as_str) == Some(pk))
            .filter(|item| match (sk_prefix, sk_attr) {
                (Some(prefix), Some(attr)) => item
                    .get(attr)
                    .and_then(AttrValue::as_str)
                    .is_some_and(|sk| sk.starts_with(prefix)),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();

        if let Some(attr) = sk_attr {
            matches.sort_by(|a, b| {
                let a_sk = a.get(attr).and_then(AttrValue::as_str).unwrap_or("");
                let b_sk = b.get(attr).and_then(AttrValue::as_str).unwrap_or("");
                a_sk.cmp(b_sk)
            });
        }
        Ok(matches)
    }

    async fn batch_delete(&self, keys: &[Key]) -> Result<(), StoreError> {
        if keys.len() > MAX_BATCH_WRITE {
            return Err(StoreError::Validation(format!(
                "batch delete of {} keys exceeds the {MAX_BATCH_WRITE}-item limit",
                keys.len()
            )));
        }
        let mut inner = self.inner.lock();
        for key in keys {
            let old = inner.rows.remove(key);
            if old.is_some() {
                inner.record(key, old, None);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}
