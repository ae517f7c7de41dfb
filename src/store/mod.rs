//! Wide-row store contract and in-process backend
//!
//! The limiter requires a partitioned table with conditional writes,
//! multi-row transactions (≤ 25 items), batch gets (≤ 100 keys), three
//! secondary indexes, item TTL, and a change stream emitting OLD and NEW
//! images. [`WideRowStore`] captures exactly that contract; [`MemoryStore`]
//! is a faithful in-process implementation used by tests and the local CLI
//! backend. Production bindings to a hosted store live outside this crate.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod ops;
pub mod repository;
pub mod value;

pub use memory::MemoryStore;
pub use ops::{Condition, DeleteOp, Key, PutOp, TransactItem, UpdateOp};
pub use repository::Repository;
pub use value::{get_bool, get_n, get_s, AttrValue, Item};

/// Maximum members of one transaction.
pub const MAX_TRANSACT_ITEMS: usize = 25;

/// Maximum keys in one batch get.
pub const MAX_BATCH_GET: usize = 100;

/// Maximum deletions in one batch write.
pub const MAX_BATCH_WRITE: usize = 25;

/// Store-level errors. Converted into the crate taxonomy at the repository
/// boundary; absence is modelled as `Option`, not an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write precondition did not hold.
    #[error("conditional check failed")]
    ConditionFailed,

    /// A transaction was canceled; one reason per member, in order.
    #[error("transaction canceled: {0:?}")]
    TransactionCanceled(Vec<String>),

    /// Malformed request (oversized batch, empty transaction, bad key).
    #[error("validation error: {0}")]
    Validation(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Throttled past the client-side retry budget.
    #[error("throttled")]
    Throttled,
}

/// Secondary indexes of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexName {
    /// Resource → entity: cross-entity resource aggregation. Keys
    /// `GSI2PK`/`GSI2SK`.
    Gsi2,
    /// Entity → bucket shards: shard discovery without a scan. Keys
    /// `GSI3PK`/`GSI3SK`.
    Gsi3,
    /// Namespace → items: namespace purge only. Key `GSI4PK`.
    Gsi4,
}

impl IndexName {
    /// Attribute holding this index's partition key.
    pub fn pk_attr(&self) -> &'static str {
        match self {
            IndexName::Gsi2 => "GSI2PK",
            IndexName::Gsi3 => "GSI3PK",
            IndexName::Gsi4 => "GSI4PK",
        }
    }

    /// Attribute holding this index's sort key, when it has one.
    pub fn sk_attr(&self) -> Option<&'static str> {
        match self {
            IndexName::Gsi2 => Some("GSI2SK"),
            IndexName::Gsi3 => Some("GSI3SK"),
            IndexName::Gsi4 => None,
        }
    }
}

// ============================================================================
// Change stream
// ============================================================================

/// Kind of change a stream record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventType {
    /// Row created.
    Insert,
    /// Row mutated.
    Modify,
    /// Row deleted (including TTL expiry).
    Remove,
}

/// One change-data-capture record, with before/after images.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Change kind.
    pub event: StreamEventType,
    /// Key of the changed row.
    pub key: Key,
    /// Row image before the change. Absent on insert.
    pub old_image: Option<Item>,
    /// Row image after the change. Absent on remove.
    pub new_image: Option<Item>,
}

// ============================================================================
// Store trait
// ============================================================================

/// The wide-row store contract.
///
/// Items returned by reads always carry their `PK`/`SK` attributes, so
/// callers can identify rows coming back from index queries.
#[async_trait]
pub trait WideRowStore: Send + Sync {
    /// Read one row.
    async fn get_item(&self, key: &Key) -> Result<Option<Item>, StoreError>;

    /// Read up to [`MAX_BATCH_GET`] rows. Missing keys are simply absent
    /// from the result.
    async fn batch_get(&self, keys: &[Key]) -> Result<HashMap<Key, Item>, StoreError>;

    /// Write a full row.
    async fn put_item(&self, op: PutOp) -> Result<(), StoreError>;

    /// Apply a partial update, returning the new row image.
    async fn update_item(&self, op: UpdateOp) -> Result<Item, StoreError>;

    /// Delete a row.
    async fn delete_item(&self, op: DeleteOp) -> Result<(), StoreError>;

    /// Apply up to [`MAX_TRANSACT_ITEMS`] writes atomically. Either every
    /// member applies or none does; condition failures cancel the whole
    /// transaction.
    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<(), StoreError>;

    /// All rows of one partition whose sort key starts with `sk_prefix`,
    /// in sort-key order.
    async fn query_prefix(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>, StoreError>;

    /// All rows of one index partition, optionally filtered by an index
    /// sort-key prefix.
    async fn query_index(
        &self,
        index: IndexName,
        pk: &str,
        sk_prefix: Option<&str>,
    ) -> Result<Vec<Item>, StoreError>;

    /// Delete up to [`MAX_BATCH_WRITE`] rows, non-transactionally.
    async fn batch_delete(&self, keys: &[Key]) -> Result<(), StoreError>;

    /// Health probe. False on any client error.
    async fn ping(&self) -> bool;
}
