//! Typed write operations
//!
//! Upper layers never assemble expression strings; they build these typed
//! operations and the store executes them. Conditions are the optimistic
//! locks: bucket writes guard on the shared `rf` timestamp, first-touch
//! puts guard on key absence.

use super::value::{AttrValue, Item};

/// Primary key of one row.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    /// Partition key.
    pub pk: String,
    /// Sort key.
    pub sk: String,
}

impl Key {
    /// Build a key.
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

/// A write precondition. Evaluated against the current row (or its absence)
/// atomically with the write.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The row must not exist.
    KeyNotExists,
    /// The named attribute must exist.
    AttributeExists(String),
    /// The named attribute must equal the value. Fails when the row or the
    /// attribute is absent.
    Equals(String, AttrValue),
}

/// Full-row write.
#[derive(Debug, Clone, PartialEq)]
pub struct PutOp {
    /// Target row.
    pub key: Key,
    /// Attributes to store. Key attributes are injected by the store.
    pub item: Item,
    /// Optional precondition.
    pub condition: Option<Condition>,
}

impl PutOp {
    /// Unconditional put.
    pub fn new(key: Key, item: Item) -> Self {
        Self {
            key,
            item,
            condition: None,
        }
    }

    /// Attach a precondition.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Partial-row update. `add` applies to integer attributes, creating the
/// row or the attribute at zero when missing, which is what makes counter
/// updates commute between writers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOp {
    /// Target row.
    pub key: Key,
    /// Unconditional attribute assignments.
    pub set: Vec<(String, AttrValue)>,
    /// Assignments applied only when the attribute is absent.
    pub set_if_not_exists: Vec<(String, AttrValue)>,
    /// Commutative integer increments.
    pub add: Vec<(String, i64)>,
    /// Attributes to remove.
    pub remove: Vec<String>,
    /// Optional precondition.
    pub condition: Option<Condition>,
}

impl UpdateOp {
    /// Empty update on a row.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    /// Assign an attribute.
    pub fn set(mut self, attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set.push((attr.into(), value.into()));
        self
    }

    /// Assign an attribute only if it is absent.
    pub fn set_if_not_exists(mut self, attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_if_not_exists.push((attr.into(), value.into()));
        self
    }

    /// Increment an integer attribute.
    pub fn add(mut self, attr: impl Into<String>, delta: i64) -> Self {
        self.add.push((attr.into(), delta));
        self
    }

    /// Remove an attribute.
    pub fn remove(mut self, attr: impl Into<String>) -> Self {
        self.remove.push(attr.into());
        self
    }

    /// Attach a precondition.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Row deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOp {
    /// Target row.
    pub key: Key,
    /// Optional precondition.
    pub condition: Option<Condition>,
}

impl DeleteOp {
    /// Unconditional delete.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            condition: None,
        }
    }

    /// Attach a precondition.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// One member of an atomic multi-row transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactItem {
    /// Full-row write.
    Put(PutOp),
    /// Partial update.
    Update(UpdateOp),
    /// Deletion.
    Delete(DeleteOp),
}

impl TransactItem {
    /// Target key of this transaction member.
    pub fn key(&self) -> &Key {
        match self {
            TransactItem::Put(op) => &op.key,
            TransactItem::Update(op) => &op.key,
            TransactItem::Delete(op) => &op.key,
        }
    }
}
