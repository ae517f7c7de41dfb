//! Diff engine for declarative limits
//!
//! Compares a parsed manifest against the previously applied managed
//! set and produces an ordered list of changes. Only items the previous
//! apply managed are ever deleted; configuration written outside the
//! manifest is never touched.

use std::collections::{BTreeMap, BTreeSet};

use crate::provision::manifest::{LimitDecl, LimitsManifest, ManagedSet, SystemDecl};

/// What to do with one configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// Item is new to the managed set.
    Create,
    /// Item was managed before and is rewritten.
    Update,
    /// Item left the manifest and is removed.
    Delete,
}

/// Which configuration tier the change targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeLevel {
    /// System defaults.
    System,
    /// Resource defaults.
    Resource,
    /// Entity × resource limits.
    Entity,
}

/// Payload of a create/update change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeData {
    /// System block, including the unavailability policy.
    System(SystemDecl),
    /// Limits of a resource or entity×resource config.
    Limits(BTreeMap<String, LimitDecl>),
}

/// One change to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// What to do.
    pub action: ChangeAction,
    /// Configuration tier.
    pub level: ChangeLevel,
    /// Resource name, `entity/resource` pair, or `None` for system.
    pub target: Option<String>,
    /// Payload for create/update; `None` for delete.
    pub data: Option<ChangeData>,
}

/// Compute the ordered change list: system first, then resources
/// (writes before deletes, each sorted), then entity×resource pairs.
pub fn compute_diff(manifest: &LimitsManifest, previous: &ManagedSet) -> Vec<Change> {
    let mut changes = Vec::new();

    // --- System ---
    if let Some(system) = &manifest.system {
        changes.push(Change {
            action: if previous.managed_system {
                ChangeAction::Update
            } else {
                ChangeAction::Create
            },
            level: ChangeLevel::System,
            target: None,
            data: Some(ChangeData::System(system.clone())),
        });
    } else if previous.managed_system {
        changes.push(Change {
            action: ChangeAction::Delete,
            level: ChangeLevel::System,
            target: None,
            data: None,
        });
    }

    // --- Resources ---
    let prev_resources: BTreeSet<&str> =
        previous.managed_resources.iter().map(String::as_str).collect();
    for (resource, decl) in &manifest.resources {
        changes.push(Change {
            action: if prev_resources.contains(resource.as_str()) {
                ChangeAction::Update
            } else {
                ChangeAction::Create
            },
            level: ChangeLevel::Resource,
            target: Some(resource.clone()),
            data: Some(ChangeData::Limits(decl.limits.clone())),
        });
    }
    for resource in &previous.managed_resources {
        if !manifest.resources.contains_key(resource) {
            changes.push(Change {
                action: ChangeAction::Delete,
                level: ChangeLevel::Resource,
                target: Some(resource.clone()),
                data: None,
            });
        }
    }

    // --- Entities ---
    let prev_pairs: BTreeSet<(String, String)> = previous
        .managed_entities
        .iter()
        .flat_map(|(entity, resources)| {
            resources.iter().map(move |r| (entity.clone(), r.clone()))
        })
        .collect();
    let curr_pairs: BTreeSet<(String, String)> = manifest
        .entities
        .iter()
        .flat_map(|(entity, decl)| {
            decl.resources.keys().map(move |r| (entity.clone(), r.clone()))
        })
        .collect();

    for (entity, resource) in &curr_pairs {
        changes.push(Change {
            action: if prev_pairs.contains(&(entity.clone(), resource.clone())) {
                ChangeAction::Update
            } else {
                ChangeAction::Create
            },
            level: ChangeLevel::Entity,
            target: Some(format!("{entity}/{resource}")),
            data: Some(ChangeData::Limits(
                manifest.entities[entity].resources[resource].limits.clone(),
            )),
        });
    }
    for (entity, resource) in prev_pairs.difference(&curr_pairs) {
        changes.push(Change {
            action: ChangeAction::Delete,
            level: ChangeLevel::Entity,
            target: Some(format!("{entity}/{resource}")),
            data: None,
        });
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(yaml: &str) -> LimitsManifest {
        LimitsManifest::from_yaml(yaml).unwrap()
    }

    const FULL: &str = r#"
namespace: a
system:
  limits:
    rpm: {capacity: 100}
resources:
  gpt-4:
    limits:
      tpm: {capacity: 1000}
entities:
  user-1:
    resources:
      gpt-4:
        limits:
          tpm: {capacity: 500}
"#;

    #[test]
    fn test_everything_created_from_empty_state() {
        let changes = compute_diff(&manifest(FULL), &ManagedSet::default());
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.action == ChangeAction::Create));
        assert_eq!(changes[0].level, ChangeLevel::System);
        assert_eq!(changes[1].target.as_deref(), Some("gpt-4"));
        assert_eq!(changes[2].target.as_deref(), Some("user-1/gpt-4"));
    }

    #[test]
    fn test_managed_items_update() {
        let m = manifest(FULL);
        let changes = compute_diff(&m, &m.managed_set());
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.action == ChangeAction::Update));
    }

    #[test]
    fn test_removed_items_delete() {
        let previous = manifest(FULL).managed_set();
        let shrunk = manifest("namespace: a\nsystem:\n  limits:\n    rpm: {capacity: 100}\n");
        let changes = compute_diff(&shrunk, &previous);

        let deletes: Vec<&Change> =
            changes.iter().filter(|c| c.action == ChangeAction::Delete).collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0].level, ChangeLevel::Resource);
        assert_eq!(deletes[1].target.as_deref(), Some("user-1/gpt-4"));
    }

    #[test]
    fn test_system_removed() {
        let previous = ManagedSet {
            managed_system: true,
            ..ManagedSet::default()
        };
        let changes = compute_diff(&manifest("namespace: a\n"), &previous);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Delete);
        assert_eq!(changes[0].level, ChangeLevel::System);
    }

    #[test]
    fn test_unmanaged_items_untouched() {
        // previous state manages nothing: an empty manifest changes nothing
        let changes = compute_diff(&manifest("namespace: a\n"), &ManagedSet::default());
        assert!(changes.is_empty());
    }
}
