//! YAML manifest parsing and validation
//!
//! The declarative shape of a namespace's limits:
//!
//! ```yaml
//! namespace: tenant-a
//! system:
//!   on_unavailable: allow
//!   limits:
//!     rpm: {capacity: 100}
//! resources:
//!   gpt-4:
//!     limits:
//!       tpm: {capacity: 10000, refill_amount: 10000, refill_period: 60}
//! entities:
//!   user-1:
//!     resources:
//!       gpt-4:
//!         limits:
//!           tpm: {capacity: 500}
//! ```
//!
//! `burst` is accepted as a back-compat alias for `capacity`;
//! `refill_amount` defaults to the capacity and `refill_period` to 60
//! seconds.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SluiceError};
use crate::models::{FailureMode, Limit};
use crate::schema;

/// One declared limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitDecl {
    /// Bucket ceiling in whole tokens.
    pub capacity: i64,
    /// Tokens refilled per period.
    pub refill_amount: i64,
    /// Refill period in seconds.
    pub refill_period: i64,
}

#[derive(Debug, Deserialize)]
struct RawLimitDecl {
    #[serde(default)]
    capacity: Option<i64>,
    #[serde(default)]
    burst: Option<i64>,
    #[serde(default)]
    refill_amount: Option<i64>,
    #[serde(default)]
    refill_period: Option<i64>,
}

impl<'de> Deserialize<'de> for LimitDecl {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawLimitDecl::deserialize(deserializer)?;
        // burst is the historical spelling of the ceiling; when present it
        // wins over capacity
        let capacity = raw
            .burst
            .or(raw.capacity)
            .ok_or_else(|| serde::de::Error::custom("limit requires 'capacity'"))?;
        Ok(LimitDecl {
            capacity,
            refill_amount: raw.refill_amount.unwrap_or(capacity),
            refill_period: raw.refill_period.unwrap_or(60),
        })
    }
}

impl LimitDecl {
    /// Materialise as a [`Limit`].
    pub fn to_limit(self, name: &str) -> Limit {
        Limit {
            name: name.to_string(),
            capacity: self.capacity,
            burst: self.capacity,
            refill_amount: self.refill_amount,
            refill_period: Duration::from_secs(self.refill_period.max(0) as u64),
        }
    }
}

/// Materialise a limits map as sorted [`Limit`]s.
pub fn decls_to_limits(decls: &BTreeMap<String, LimitDecl>) -> Vec<Limit> {
    decls.iter().map(|(name, decl)| decl.to_limit(name)).collect()
}

/// System-level block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemDecl {
    /// System default limits.
    #[serde(default)]
    pub limits: BTreeMap<String, LimitDecl>,
    /// Unavailability policy.
    #[serde(default)]
    pub on_unavailable: Option<FailureMode>,
}

/// Resource-level block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Resource default limits.
    #[serde(default)]
    pub limits: BTreeMap<String, LimitDecl>,
}

/// Entity × resource block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityResourceDecl {
    /// Entity-specific limits for one resource.
    #[serde(default)]
    pub limits: BTreeMap<String, LimitDecl>,
}

/// Entity block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDecl {
    /// Per-resource limit blocks.
    #[serde(default)]
    pub resources: BTreeMap<String, EntityResourceDecl>,
}

/// The managed-set fingerprint persisted between applies. Only items in
/// the previous managed set are ever deleted, so hand-written configs
/// outside the manifest survive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedSet {
    /// Whether the system block was managed.
    #[serde(default)]
    pub managed_system: bool,
    /// Managed resource names.
    #[serde(default)]
    pub managed_resources: Vec<String>,
    /// Managed entity → resources.
    #[serde(default)]
    pub managed_entities: BTreeMap<String, Vec<String>>,
}

/// A parsed limits manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsManifest {
    /// Namespace name the manifest provisions.
    pub namespace: String,
    /// System block.
    #[serde(default)]
    pub system: Option<SystemDecl>,
    /// Resource blocks.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDecl>,
    /// Entity blocks.
    #[serde(default)]
    pub entities: BTreeMap<String, EntityDecl>,
}

impl LimitsManifest {
    /// Parse and validate a YAML manifest.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: LimitsManifest = serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Validation(format!("invalid manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(SluiceError::Validation("'namespace' is required".into()));
        }
        if self.namespace != schema::RESERVED_NAMESPACE && !schema::is_valid_name(&self.namespace) {
            return Err(SluiceError::Validation(format!(
                "invalid namespace name: '{}'",
                self.namespace
            )));
        }

        let mut limit_names: Vec<&str> = Vec::new();
        if let Some(system) = &self.system {
            limit_names.extend(system.limits.keys().map(String::as_str));
        }
        for resource in self.resources.values() {
            limit_names.extend(resource.limits.keys().map(String::as_str));
        }
        for entity in self.entities.values() {
            for resource in entity.resources.values() {
                limit_names.extend(resource.limits.keys().map(String::as_str));
            }
        }
        for name in limit_names {
            if !schema::is_valid_limit_name(name) || name == schema::WCU_LIMIT_NAME {
                return Err(SluiceError::Validation(format!("invalid limit name: '{name}'")));
            }
        }
        Ok(())
    }

    /// Extract the managed set this manifest covers.
    pub fn managed_set(&self) -> ManagedSet {
        ManagedSet {
            managed_system: self.system.is_some(),
            managed_resources: self.resources.keys().cloned().collect(),
            managed_entities: self
                .entities
                .iter()
                .map(|(id, entity)| (id.clone(), entity.resources.keys().cloned().collect()))
                .collect(),
        }
    }

    /// Deterministic content fingerprint of the manifest.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{digest:x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
namespace: tenant-a
system:
  on_unavailable: allow
  limits:
    rpm: {capacity: 100}
resources:
  gpt-4:
    limits:
      tpm: {capacity: 10000, refill_amount: 10000, refill_period: 60}
entities:
  user-1:
    resources:
      gpt-4:
        limits:
          tpm: {capacity: 500}
"#;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = LimitsManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.namespace, "tenant-a");

        let system = manifest.system.as_ref().unwrap();
        assert_eq!(system.on_unavailable, Some(FailureMode::Allow));
        assert_eq!(system.limits["rpm"].capacity, 100);
        // shorthand defaults
        assert_eq!(system.limits["rpm"].refill_amount, 100);
        assert_eq!(system.limits["rpm"].refill_period, 60);

        assert_eq!(manifest.resources["gpt-4"].limits["tpm"].capacity, 10_000);
        assert_eq!(
            manifest.entities["user-1"].resources["gpt-4"].limits["tpm"].capacity,
            500
        );
    }

    #[test]
    fn test_burst_is_capacity_alias() {
        let manifest = LimitsManifest::from_yaml(
            "namespace: a\nsystem:\n  limits:\n    rpm: {capacity: 10, burst: 25}\n",
        )
        .unwrap();
        assert_eq!(manifest.system.unwrap().limits["rpm"].capacity, 25);
    }

    #[test]
    fn test_namespace_required() {
        assert!(LimitsManifest::from_yaml("system:\n  limits: {}\n").is_err());
        assert!(LimitsManifest::from_yaml("namespace: ''\n").is_err());
    }

    #[test]
    fn test_capacity_required() {
        let err = LimitsManifest::from_yaml("namespace: a\nsystem:\n  limits:\n    rpm: {refill_amount: 5}\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_limit_name_rejected() {
        let err = LimitsManifest::from_yaml("namespace: a\nsystem:\n  limits:\n    r-pm: {capacity: 5}\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_managed_set() {
        let manifest = LimitsManifest::from_yaml(MANIFEST).unwrap();
        let managed = manifest.managed_set();
        assert!(managed.managed_system);
        assert_eq!(managed.managed_resources, vec!["gpt-4"]);
        assert_eq!(managed.managed_entities["user-1"], vec!["gpt-4"]);
    }

    #[test]
    fn test_content_hash_stable_and_sensitive() {
        let a = LimitsManifest::from_yaml(MANIFEST).unwrap();
        let b = LimitsManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let c = LimitsManifest::from_yaml(&MANIFEST.replace("500", "600")).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_decl_to_limit() {
        let decl = LimitDecl {
            capacity: 100,
            refill_amount: 50,
            refill_period: 30,
        };
        let limit = decl.to_limit("rpm");
        assert_eq!(limit.name, "rpm");
        assert_eq!(limit.capacity, 100);
        assert_eq!(limit.burst, 100);
        assert_eq!(limit.refill_amount, 50);
        assert_eq!(limit.refill_period, Duration::from_secs(30));
    }
}
