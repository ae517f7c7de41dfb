//! Namespace registry
//!
//! Multi-tenant bookkeeping in the reserved `_` namespace: a forward
//! record maps a human name to a minted 8-character opaque id, a reverse
//! record tracks the id's lifecycle. Deletion is soft (the forward
//! mapping disappears, data stays); purge is hard and walks the
//! namespace index deleting every data row in chunks.
//!
//! The reserved namespace `_` holds shared records and can never be
//! registered, deleted, recovered, or purged.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use crate::error::{Result, SluiceError};
use crate::models::{Clock, NamespaceRecord, NamespaceStatus};
use crate::schema;
use crate::store::{
    get_n, get_s, AttrValue, Condition, DeleteOp, IndexName, Item, Key, PutOp, StoreError,
    TransactItem, UpdateOp, WideRowStore, MAX_BATCH_WRITE,
};

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Forward/reverse namespace registry.
pub struct NamespaceRegistry {
    store: Arc<dyn WideRowStore>,
    clock: Arc<dyn Clock>,
}

impl NamespaceRegistry {
    /// Registry over a store.
    pub fn new(store: Arc<dyn WideRowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn forward_key(name: &str) -> Key {
        Key::new(schema::pk_system(schema::RESERVED_NAMESPACE), schema::sk_namespace(name))
    }

    fn reverse_key(id: &str) -> Key {
        Key::new(schema::pk_system(schema::RESERVED_NAMESPACE), schema::sk_nsid(id))
    }

    fn check_name(name: &str) -> Result<()> {
        if name == schema::RESERVED_NAMESPACE {
            return Err(SluiceError::Validation(format!(
                "'{}' is the reserved shared namespace",
                schema::RESERVED_NAMESPACE
            )));
        }
        if !schema::is_valid_name(name) {
            return Err(SluiceError::Validation(format!("invalid namespace name: '{name}'")));
        }
        Ok(())
    }

    fn mint_id() -> String {
        let mut rng = rand::thread_rng();
        (0..schema::NAMESPACE_ID_LEN)
            .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
            .collect()
    }

    fn item_to_record(item: &Item) -> Option<NamespaceRecord> {
        let status = match get_s(item, "status")? {
            "active" => NamespaceStatus::Active,
            "deleted" => NamespaceStatus::Deleted,
            _ => return None,
        };
        Some(NamespaceRecord {
            id: get_s(item, "namespace_id")?.to_string(),
            name: get_s(item, "name")?.to_string(),
            status,
            created_at_ms: get_n(item, "created_at").unwrap_or(0),
            deleted_at_ms: get_n(item, "deleted_at"),
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a namespace, returning its id. Idempotent: an existing
    /// name returns the id it already has.
    pub async fn register(&self, name: &str) -> Result<String> {
        Self::check_name(name)?;

        if let Some(id) = self.resolve(name).await? {
            return Ok(id);
        }

        let id = Self::mint_id();
        let now_ms = self.clock.now_ms();

        let mut forward = Item::new();
        forward.insert("name".into(), name.into());
        forward.insert("namespace_id".into(), id.as_str().into());
        forward.insert("GSI4PK".into(), schema::RESERVED_NAMESPACE.into());

        let mut reverse = Item::new();
        reverse.insert("namespace_id".into(), id.as_str().into());
        reverse.insert("name".into(), name.into());
        reverse.insert("status".into(), "active".into());
        reverse.insert("created_at".into(), AttrValue::N(now_ms));
        reverse.insert("GSI4PK".into(), schema::RESERVED_NAMESPACE.into());

        let result = self
            .store
            .transact_write(vec![
                TransactItem::Put(
                    PutOp::new(Self::forward_key(name), forward).condition(Condition::KeyNotExists),
                ),
                TransactItem::Put(PutOp::new(Self::reverse_key(&id), reverse)),
            ])
            .await;

        match result {
            Ok(()) => {
                info!(namespace = name, namespace_id = %id, "namespace registered");
                Ok(id)
            }
            // Lost a registration race: the winner's id is authoritative.
            Err(StoreError::TransactionCanceled(_)) | Err(StoreError::ConditionFailed) => self
                .resolve(name)
                .await?
                .ok_or_else(|| SluiceError::Conflict(format!("registration race on '{name}'"))),
            Err(err) => Err(err.into()),
        }
    }

    /// Register many namespaces. Idempotent as a whole: re-running with
    /// the same names returns the identical id map.
    pub async fn register_many(&self, names: &[String]) -> Result<BTreeMap<String, String>> {
        let mut ids = BTreeMap::new();
        for name in names {
            ids.insert(name.clone(), self.register(name).await?);
        }
        Ok(ids)
    }

    /// Resolve a name to its namespace id.
    pub async fn resolve(&self, name: &str) -> Result<Option<String>> {
        let item = self.store.get_item(&Self::forward_key(name)).await?;
        Ok(item.as_ref().and_then(|i| get_s(i, "namespace_id")).map(str::to_string))
    }

    /// Describe a namespace by id.
    pub async fn describe(&self, id: &str) -> Result<Option<NamespaceRecord>> {
        let item = self.store.get_item(&Self::reverse_key(id)).await?;
        Ok(item.as_ref().and_then(Self::item_to_record))
    }

    /// Active namespaces, sorted by name.
    pub async fn list(&self) -> Result<Vec<NamespaceRecord>> {
        Ok(self
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.status == NamespaceStatus::Active)
            .collect())
    }

    /// Soft-deleted namespaces awaiting recovery or purge.
    pub async fn orphans(&self) -> Result<Vec<NamespaceRecord>> {
        Ok(self
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.status == NamespaceStatus::Deleted)
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<NamespaceRecord>> {
        let rows = self
            .store
            .query_prefix(&schema::pk_system(schema::RESERVED_NAMESPACE), "#NSID#")
            .await?;
        let mut records: Vec<NamespaceRecord> =
            rows.iter().filter_map(Self::item_to_record).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Soft-delete a namespace: the forward mapping is removed, the
    /// reverse record is marked deleted, data rows are untouched. A
    /// missing name is a no-op.
    pub async fn delete(&self, name: &str) -> Result<()> {
        Self::check_name(name)?;
        let Some(id) = self.resolve(name).await? else {
            return Ok(());
        };

        self.store
            .transact_write(vec![
                TransactItem::Delete(DeleteOp::new(Self::forward_key(name))),
                TransactItem::Update(
                    UpdateOp::new(Self::reverse_key(&id))
                        .set("status", "deleted")
                        .set("deleted_at", self.clock.now_ms()),
                ),
            ])
            .await?;
        info!(namespace = name, namespace_id = %id, "namespace soft-deleted");
        Ok(())
    }

    /// Restore a soft-deleted namespace by id. Fails when the id is
    /// unknown, still active, or its name has since been re-registered
    /// under a different id.
    pub async fn recover(&self, id: &str) -> Result<NamespaceRecord> {
        let Some(record) = self.describe(id).await? else {
            return Err(SluiceError::NamespaceNotFound(id.to_string()));
        };
        if record.status == NamespaceStatus::Active {
            return Err(SluiceError::Validation(format!(
                "namespace '{}' ({id}) is active; nothing to recover",
                record.name
            )));
        }
        if let Some(existing) = self.resolve(&record.name).await? {
            if existing != id {
                return Err(SluiceError::Conflict(format!(
                    "name '{}' was re-registered to '{existing}'",
                    record.name
                )));
            }
        }

        let mut forward = Item::new();
        forward.insert("name".into(), record.name.as_str().into());
        forward.insert("namespace_id".into(), id.into());
        forward.insert("GSI4PK".into(), schema::RESERVED_NAMESPACE.into());

        self.store
            .transact_write(vec![
                TransactItem::Put(PutOp::new(Self::forward_key(&record.name), forward)),
                TransactItem::Update(
                    UpdateOp::new(Self::reverse_key(id))
                        .set("status", "active")
                        .remove("deleted_at"),
                ),
            ])
            .await?;

        info!(namespace = %record.name, namespace_id = %id, "namespace recovered");
        self.describe(id)
            .await?
            .ok_or_else(|| SluiceError::NamespaceNotFound(id.to_string()))
    }

    /// Hard-delete every data row of a soft-deleted namespace, then the
    /// reverse record. Returns the number of data rows deleted.
    pub async fn purge(&self, id: &str) -> Result<usize> {
        if id == schema::RESERVED_NAMESPACE {
            return Err(SluiceError::Validation(
                "the reserved namespace cannot be purged".into(),
            ));
        }
        let Some(record) = self.describe(id).await? else {
            return Ok(0);
        };
        if record.status == NamespaceStatus::Active {
            return Err(SluiceError::Validation(format!(
                "namespace '{}' ({id}) is active; delete it before purging",
                record.name
            )));
        }

        let mut deleted = 0;
        loop {
            let rows = self.store.query_index(IndexName::Gsi4, id, None).await?;
            if rows.is_empty() {
                break;
            }
            let keys: Vec<Key> = rows
                .iter()
                .filter_map(|item| {
                    Some(Key::new(
                        get_s(item, "PK")?.to_string(),
                        get_s(item, "SK")?.to_string(),
                    ))
                })
                .collect();
            for chunk in keys.chunks(MAX_BATCH_WRITE) {
                self.store.batch_delete(chunk).await?;
                deleted += chunk.len();
            }
            debug!(namespace_id = %id, deleted, "purge pass completed");
        }

        self.store
            .delete_item(DeleteOp::new(Self::reverse_key(id)))
            .await?;
        info!(namespace_id = %id, rows = deleted, "namespace purged");
        Ok(deleted)
    }
}
