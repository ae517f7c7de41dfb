//! Applying limit changes to the store
//!
//! Writes diff-computed changes one at a time through the repository and
//! finally rewrites the `#PROVISIONER` managed-set record with a content
//! hash. Single-writer per namespace; a failed change is recorded and the
//! remaining changes still apply.

use tracing::{info, warn};

use crate::error::Result;
use crate::models::{AuditAction, AuditRecord, Clock};
use crate::provision::differ::{Change, ChangeAction, ChangeData, ChangeLevel};
use crate::provision::manifest::{decls_to_limits, LimitsManifest, ManagedSet};
use crate::schema;
use crate::store::{AttrValue, Item, Key, PutOp, Repository};
use std::sync::Arc;

/// Outcome of one apply run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyResult {
    /// Items newly created.
    pub created: usize,
    /// Items rewritten.
    pub updated: usize,
    /// Items removed.
    pub deleted: usize,
    /// Per-change failures; the run continued past them.
    pub errors: Vec<String>,
}

impl ApplyResult {
    /// Whether every change applied.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total changes applied.
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Applies manifest changes to one namespace.
pub struct Applier {
    repo: Repository,
    clock: Arc<dyn Clock>,
    principal: Option<String>,
    audit_retention_days: i64,
}

impl Applier {
    /// Applier over a namespace-scoped repository.
    pub fn new(repo: Repository, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            principal: None,
            audit_retention_days: 90,
        }
    }

    /// Record a principal on the apply audit trail.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    fn state_key(&self) -> Key {
        Key::new(schema::pk_system(self.repo.namespace()), schema::SK_PROVISIONER)
    }

    /// Load the previously applied managed set. Empty when this namespace
    /// was never provisioned.
    pub async fn load_state(&self) -> Result<ManagedSet> {
        let Some(item) = self.repo.store().get_item(&self.state_key()).await? else {
            return Ok(ManagedSet::default());
        };
        let managed = item
            .get("managed")
            .map(AttrValue::to_json)
            .and_then(|json| serde_json::from_value(json).ok())
            .unwrap_or_default();
        Ok(managed)
    }

    /// Content hash of the last applied manifest, if any.
    pub async fn last_content_hash(&self) -> Result<Option<String>> {
        let item = self.repo.store().get_item(&self.state_key()).await?;
        Ok(item
            .as_ref()
            .and_then(|i| crate::store::get_s(i, "content_hash"))
            .map(str::to_string))
    }

    /// Persist the managed set and content hash after an apply.
    pub async fn save_state(&self, manifest: &LimitsManifest) -> Result<()> {
        let managed = serde_json::to_value(manifest.managed_set()).unwrap_or_default();
        let mut item = Item::new();
        item.insert("managed".into(), AttrValue::from_json(&managed));
        item.insert("content_hash".into(), manifest.content_hash().into());
        item.insert("applied_at".into(), AttrValue::N(self.clock.now_ms()));
        item.insert("namespace".into(), manifest.namespace.as_str().into());
        item.insert("GSI4PK".into(), self.repo.namespace().into());
        self.repo.store().put_item(PutOp::new(self.state_key(), item)).await?;
        Ok(())
    }

    /// Apply one change list.
    pub async fn apply(&self, changes: &[Change]) -> ApplyResult {
        let mut result = ApplyResult::default();
        for change in changes {
            match self.apply_one(change).await {
                Ok(()) => match change.action {
                    ChangeAction::Create => result.created += 1,
                    ChangeAction::Update => result.updated += 1,
                    ChangeAction::Delete => result.deleted += 1,
                },
                Err(err) => {
                    warn!(
                        action = ?change.action,
                        level = ?change.level,
                        target = change.target.as_deref().unwrap_or("-"),
                        %err,
                        "failed to apply change"
                    );
                    result.errors.push(format!(
                        "{:?} {:?} {}: {err}",
                        change.action,
                        change.level,
                        change.target.as_deref().unwrap_or("-")
                    ));
                }
            }
        }
        result
    }

    async fn apply_one(&self, change: &Change) -> Result<()> {
        match (change.level, change.action) {
            (ChangeLevel::System, ChangeAction::Delete) => self.repo.delete_system_config().await,
            (ChangeLevel::System, _) => {
                let Some(ChangeData::System(system)) = &change.data else {
                    return Err(crate::error::SluiceError::Validation(
                        "system change without payload".into(),
                    ));
                };
                self.repo
                    .set_system_config(&decls_to_limits(&system.limits), system.on_unavailable)
                    .await
            }
            (ChangeLevel::Resource, action) => {
                let resource = change.target.as_deref().ok_or_else(|| {
                    crate::error::SluiceError::Validation("resource change without target".into())
                })?;
                if action == ChangeAction::Delete {
                    self.repo.delete_resource_config(resource).await
                } else {
                    let Some(ChangeData::Limits(limits)) = &change.data else {
                        return Err(crate::error::SluiceError::Validation(
                            "resource change without payload".into(),
                        ));
                    };
                    self.repo
                        .set_resource_config(resource, &decls_to_limits(limits))
                        .await
                }
            }
            (ChangeLevel::Entity, action) => {
                let target = change.target.as_deref().ok_or_else(|| {
                    crate::error::SluiceError::Validation("entity change without target".into())
                })?;
                let (entity_id, resource) = target.split_once('/').ok_or_else(|| {
                    crate::error::SluiceError::Validation(format!(
                        "entity change target '{target}' is not 'entity/resource'"
                    ))
                })?;
                if action == ChangeAction::Delete {
                    self.repo
                        .delete_entity_config(entity_id, Some(resource), None)
                        .await
                } else {
                    let Some(ChangeData::Limits(limits)) = &change.data else {
                        return Err(crate::error::SluiceError::Validation(
                            "entity change without payload".into(),
                        ));
                    };
                    self.repo
                        .set_entity_config(entity_id, Some(resource), &decls_to_limits(limits), None)
                        .await
                }
            }
        }
    }

    /// Full provisioning run: load the previous state, diff, apply, save
    /// the new state, and audit the run. An unchanged manifest is detected
    /// by its content hash and produces zero changes.
    pub async fn apply_manifest(&self, manifest: &LimitsManifest) -> Result<ApplyResult> {
        if self.last_content_hash().await?.as_deref() == Some(manifest.content_hash().as_str()) {
            info!(namespace = %manifest.namespace, "manifest unchanged; nothing to apply");
            return Ok(ApplyResult::default());
        }

        let previous = self.load_state().await?;
        let changes = crate::provision::differ::compute_diff(manifest, &previous);
        info!(
            namespace = %manifest.namespace,
            changes = changes.len(),
            "applying manifest"
        );

        let result = self.apply(&changes).await;
        self.save_state(manifest).await?;

        let now_ms = self.clock.now_ms();
        self.repo
            .put_audit(&AuditRecord {
                event_id: uuid::Uuid::now_v7().to_string(),
                timestamp: chrono::DateTime::from_timestamp_millis(now_ms)
                    .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                    .unwrap_or_default(),
                entity_id: "system".into(),
                action: AuditAction::ApplyManifest,
                principal: self.principal.clone(),
                resource: None,
                details: serde_json::json!({
                    "namespace": manifest.namespace,
                    "content_hash": manifest.content_hash(),
                    "created": result.created,
                    "updated": result.updated,
                    "deleted": result.deleted,
                }),
                ttl_epoch_s: now_ms / 1000 + self.audit_retention_days * 86_400,
            })
            .await?;

        Ok(result)
    }
}
