//! Three-tier limit resolution
//!
//! Resolution order for an `(entity, resource)` pair:
//!
//! 1. Entity config scoped to the resource (most specific).
//! 2. Entity config with no resource scope.
//! 3. Resource-level default.
//! 4. System-level default.
//! 5. Caller-supplied fallback.
//!
//! With `use_stored_limits = false` the stored tiers are skipped entirely
//! and only the caller's limits apply. Every lookup goes through the
//! [`ConfigCache`], including the entity-metadata reads the cascade walk
//! performs.

use std::sync::Arc;

use crate::config::cache::ConfigCache;
use crate::error::{Result, SluiceError};
use crate::models::{Entity, FailureMode, Limit};
use crate::store::Repository;

/// Cached three-tier config resolver.
#[derive(Clone)]
pub struct ConfigResolver {
    repo: Repository,
    cache: Arc<ConfigCache>,
}

impl ConfigResolver {
    /// Resolver over a repository and a shared cache.
    pub fn new(repo: Repository, cache: Arc<ConfigCache>) -> Self {
        Self { repo, cache }
    }

    /// The shared cache handle.
    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    /// Resolve the effective limits for an `(entity, resource)` pair.
    ///
    /// Returns a `Validation` error when no tier yields any limits: an
    /// acquire without limits would silently admit everything.
    pub async fn resolve_limits(
        &self,
        entity_id: &str,
        resource: &str,
        caller_limits: Option<&[Limit]>,
        use_stored_limits: bool,
    ) -> Result<Vec<Limit>> {
        if use_stored_limits {
            let repo = self.repo.clone();
            let limits = self
                .cache
                .get_entity_limits(entity_id, Some(resource), || async move {
                    repo.get_entity_config(entity_id, Some(resource)).await
                })
                .await?;
            if !limits.is_empty() {
                return Ok(limits);
            }

            let repo = self.repo.clone();
            let limits = self
                .cache
                .get_entity_limits(entity_id, None, || async move {
                    repo.get_entity_config(entity_id, None).await
                })
                .await?;
            if !limits.is_empty() {
                return Ok(limits);
            }

            let repo = self.repo.clone();
            let limits = self
                .cache
                .get_resource_limits(resource, || async move {
                    repo.get_resource_config(resource).await
                })
                .await?;
            if !limits.is_empty() {
                return Ok(limits);
            }

            let (limits, _) = self.system_config().await?;
            if !limits.is_empty() {
                return Ok(limits);
            }
        }

        if let Some(limits) = caller_limits {
            if !limits.is_empty() {
                return Ok(limits.to_vec());
            }
        }

        Err(SluiceError::Validation(format!(
            "no limits configured for entity '{entity_id}' on resource '{resource}' \
             and no caller limits supplied"
        )))
    }

    /// System config through the cache.
    async fn system_config(&self) -> Result<(Vec<Limit>, Option<FailureMode>)> {
        let repo = self.repo.clone();
        self.cache
            .get_system(|| async move {
                Ok(repo.get_system_config().await?.unwrap_or((Vec::new(), None)))
            })
            .await
    }

    /// The system-wide unavailability policy. Defaults to fail-closed.
    pub async fn failure_mode(&self) -> Result<FailureMode> {
        let (_, mode) = self.system_config().await?;
        Ok(mode.unwrap_or_default())
    }

    /// Entity metadata through the cache (cascade-chain reads).
    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        let repo = self.repo.clone();
        self.cache
            .get_entity(entity_id, || async move { repo.get_entity(entity_id).await })
            .await
    }

    /// Drop every cached entry. Called after any configuration mutation.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn resolver() -> (ConfigResolver, Repository) {
        let repo = Repository::new(Arc::new(MemoryStore::new()), "ns1");
        let resolver = ConfigResolver::new(repo.clone(), Arc::new(ConfigCache::default()));
        (resolver, repo)
    }

    #[tokio::test]
    async fn test_entity_resource_config_wins() {
        let (resolver, repo) = resolver();
        repo.set_system_config(&[Limit::per_minute("rpm", 10)], None).await.unwrap();
        repo.set_resource_config("gpt-4", &[Limit::per_minute("rpm", 50)]).await.unwrap();
        repo.set_entity_config("e1", Some("gpt-4"), &[Limit::per_minute("rpm", 500)], None)
            .await
            .unwrap();

        let limits = resolver.resolve_limits("e1", "gpt-4", None, true).await.unwrap();
        assert_eq!(limits[0].capacity, 500);
    }

    #[tokio::test]
    async fn test_falls_through_to_resource_then_system() {
        let (resolver, repo) = resolver();
        repo.set_system_config(&[Limit::per_minute("rpm", 10)], None).await.unwrap();
        repo.set_resource_config("gpt-4", &[Limit::per_minute("rpm", 50)]).await.unwrap();

        let limits = resolver.resolve_limits("e1", "gpt-4", None, true).await.unwrap();
        assert_eq!(limits[0].capacity, 50);

        let limits = resolver.resolve_limits("e1", "other", None, true).await.unwrap();
        assert_eq!(limits[0].capacity, 10);
    }

    #[tokio::test]
    async fn test_caller_limits_as_last_resort() {
        let (resolver, _repo) = resolver();
        let fallback = [Limit::per_minute("rpm", 7)];
        let limits = resolver.resolve_limits("e1", "gpt-4", Some(&fallback), true).await.unwrap();
        assert_eq!(limits[0].capacity, 7);
    }

    #[tokio::test]
    async fn test_use_stored_false_skips_stored_tiers() {
        let (resolver, repo) = resolver();
        repo.set_entity_config("e1", Some("gpt-4"), &[Limit::per_minute("rpm", 500)], None)
            .await
            .unwrap();

        let fallback = [Limit::per_minute("rpm", 7)];
        let limits = resolver
            .resolve_limits("e1", "gpt-4", Some(&fallback), false)
            .await
            .unwrap();
        assert_eq!(limits[0].capacity, 7);
    }

    #[tokio::test]
    async fn test_no_limits_anywhere_is_validation_error() {
        let (resolver, _repo) = resolver();
        let err = resolver.resolve_limits("e1", "gpt-4", None, true).await.unwrap_err();
        assert!(matches!(err, SluiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failure_mode_defaults_to_block() {
        let (resolver, repo) = resolver();
        assert_eq!(resolver.failure_mode().await.unwrap(), FailureMode::Block);

        repo.set_system_config(&[], Some(FailureMode::Allow)).await.unwrap();
        resolver.invalidate();
        assert_eq!(resolver.failure_mode().await.unwrap(), FailureMode::Allow);
    }

    #[tokio::test]
    async fn test_config_mutation_visible_after_invalidate() {
        let (resolver, repo) = resolver();
        repo.set_resource_config("gpt-4", &[Limit::per_minute("rpm", 50)]).await.unwrap();
        let limits = resolver.resolve_limits("e1", "gpt-4", None, true).await.unwrap();
        assert_eq!(limits[0].capacity, 50);

        repo.set_resource_config("gpt-4", &[Limit::per_minute("rpm", 99)]).await.unwrap();
        // still cached
        let limits = resolver.resolve_limits("e1", "gpt-4", None, true).await.unwrap();
        assert_eq!(limits[0].capacity, 50);

        resolver.invalidate();
        let limits = resolver.resolve_limits("e1", "gpt-4", None, true).await.unwrap();
        assert_eq!(limits[0].capacity, 99);
    }

    #[tokio::test]
    async fn test_entity_lookup_negative_cached() {
        let (resolver, repo) = resolver();
        assert!(resolver.get_entity("ghost").await.unwrap().is_none());

        // create after the negative entry; still absent until invalidation
        repo.create_entity(&crate::models::Entity::new("ghost"), None).await.unwrap();
        assert!(resolver.get_entity("ghost").await.unwrap().is_none());

        resolver.invalidate();
        assert!(resolver.get_entity("ghost").await.unwrap().is_some());
    }
}
