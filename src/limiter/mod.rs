//! Rate limiter: the acquire protocol and administrative surface
//!
//! The protocol centre of the system. An acquire resolves configuration,
//! resolves the cascade chain, reads every affected bucket in one batched
//! get, speculatively refills-and-consumes locally, and submits ONE
//! transaction carrying a conditional update (or first-touch put) per
//! bucket. Optimistic-lock collisions are refreshed and retried with
//! bounded exponential backoff; violations surface as
//! [`RateLimitExceeded`] with per-limit statuses and a retry-after.
//!
//! There is exactly one suspension point between the speculative read and
//! the transactional write (the store round trip), so the critical
//! section is bounded by one network hop regardless of what the caller
//! does inside the lease body.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::bucket;
use crate::config::{CacheStats, ConfigCache, ConfigResolver};
use crate::error::{RateLimitExceeded, Result, SluiceError};
use crate::models::{
    AuditAction, AuditRecord, BucketState, Clock, ConsumeMap, Entity, FailureMode, Limit,
    LimitStatus, SystemClock, UsageSnapshot, VersionRecord, Window, MILLI,
};
use crate::schema;
use crate::store::repository::BucketRow;
use crate::store::{Repository, StoreError, TransactItem, UpdateOp, WideRowStore};

mod lease;

pub use lease::Lease;
use lease::LeaseTarget;

/// Client crate version, recorded against the deployment's minimum.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Configuration
// ============================================================================

/// Limiter tuning knobs.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Namespace id every key is scoped to.
    pub namespace: String,
    /// Config cache TTL. Zero disables caching.
    pub cache_ttl: Duration,
    /// Upper bound on the cascade parent walk.
    pub max_cascade_depth: usize,
    /// Attempts for optimistic-lock retries.
    pub retry_attempts: u32,
    /// Base delay of the exponential backoff.
    pub retry_base_delay: Duration,
    /// Audit record retention before archival.
    pub audit_retention_days: i64,
    /// Principal recorded on audit records.
    pub principal: Option<String>,
    /// Skip the schema version gate (read-only inspection).
    pub skip_version_check: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            namespace: schema::RESERVED_NAMESPACE.to_string(),
            cache_ttl: Duration::from_secs(60),
            max_cascade_depth: 10,
            retry_attempts: 5,
            retry_base_delay: Duration::from_millis(5),
            audit_retention_days: 90,
            principal: None,
            skip_version_check: false,
        }
    }
}

// ============================================================================
// Acquire request
// ============================================================================

/// Parameters of one acquire.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Entity to charge.
    pub entity_id: String,
    /// Resource being consumed.
    pub resource: String,
    /// Tokens to consume per limit name.
    pub consume: ConsumeMap,
    /// Caller-supplied fallback limits.
    pub limits: Option<Vec<Limit>>,
    /// Whether stored configuration takes precedence over `limits`.
    pub use_stored_limits: bool,
    /// Override the entity's cascade flag for this acquire.
    pub cascade: Option<bool>,
}

impl AcquireRequest {
    /// Acquire against an entity and resource.
    pub fn new(entity_id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            resource: resource.into(),
            consume: ConsumeMap::new(),
            limits: None,
            use_stored_limits: true,
            cascade: None,
        }
    }

    /// Add one limit's consumption.
    pub fn consume(mut self, limit_name: impl Into<String>, amount: i64) -> Self {
        self.consume.insert(limit_name.into(), amount);
        self
    }

    /// Provide fallback limits.
    pub fn limits(mut self, limits: Vec<Limit>) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Ignore stored configuration and use only the supplied limits.
    pub fn without_stored_limits(mut self) -> Self {
        self.use_stored_limits = false;
        self
    }

    /// Force cascade on or off for this acquire.
    pub fn cascade(mut self, cascade: bool) -> Self {
        self.cascade = Some(cascade);
        self
    }
}

// ============================================================================
// Acquire planning internals
// ============================================================================

/// One chain member's write plan for an attempt.
struct EntityPlan {
    entity_id: String,
    resource: String,
    shard: u32,
    cascade: bool,
    parent_id: Option<String>,
    limits: Vec<Limit>,
    row: Option<BucketRow>,
}

/// One node of the resolved cascade chain.
struct ChainNode {
    entity_id: String,
    cascade: bool,
    parent_id: Option<String>,
}

// ============================================================================
// RateLimiter
// ============================================================================

/// Distributed hierarchical token-bucket rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    repo: Repository,
    resolver: ConfigResolver,
    cache: Arc<ConfigCache>,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
    /// Stable per-client token used to route shard selection.
    client_token: u64,
}

impl RateLimiter {
    /// Build a limiter without touching the store. Use [`connect`] when
    /// the deployment version gate should run.
    ///
    /// [`connect`]: RateLimiter::connect
    pub fn new(store: Arc<dyn WideRowStore>, config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let repo = Repository::new(store, config.namespace.clone());
        let cache = Arc::new(ConfigCache::new(config.cache_ttl));
        let resolver = ConfigResolver::new(repo.clone(), Arc::clone(&cache));
        let client_token = rand::thread_rng().gen();
        Self {
            repo,
            resolver,
            cache,
            clock,
            config,
            client_token,
        }
    }

    /// Build a limiter with the system clock and default config.
    pub fn with_defaults(store: Arc<dyn WideRowStore>) -> Self {
        Self::new(store, LimiterConfig::default(), Arc::new(SystemClock))
    }

    /// Build a limiter and run the schema version gate, unless the config
    /// skips it.
    pub async fn connect(
        store: Arc<dyn WideRowStore>,
        config: LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let limiter = Self::new(store, config, clock);
        if !limiter.config.skip_version_check {
            limiter.check_version().await?;
        }
        Ok(limiter)
    }

    /// The namespace-scoped repository this limiter writes through.
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Config cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Health probe against the store.
    pub async fn ping(&self) -> bool {
        self.repo.ping().await
    }

    /// Verify this client against the deployed version record. A missing
    /// record passes: there is nothing to disagree with.
    pub async fn check_version(&self) -> Result<()> {
        let Some(record) = self.repo.get_version_record().await? else {
            return Ok(());
        };
        if record.schema_version != schema::SCHEMA_VERSION
            || version_key(CLIENT_VERSION) < version_key(&record.min_client_version)
        {
            return Err(SluiceError::VersionMismatch {
                schema_version: record.schema_version,
                min_client_version: record.min_client_version,
                client_version: CLIENT_VERSION.to_string(),
            });
        }
        Ok(())
    }

    /// Write the version record for this deployment.
    pub async fn write_version_record(&self, aggregator_version: Option<String>) -> Result<()> {
        self.repo
            .set_version_record(&VersionRecord {
                schema_version: schema::SCHEMA_VERSION,
                min_client_version: CLIENT_VERSION.to_string(),
                aggregator_version,
                updated_at_ms: self.clock.now_ms(),
                updated_by: self.config.principal.clone(),
            })
            .await
    }

    // ========================================================================
    // Acquire
    // ========================================================================

    /// Reserve capacity. Returns a [`Lease`] whose speculative consumption
    /// is already persisted; the lease must be committed or rolled back.
    ///
    /// On infrastructure failure the system-wide `on_unavailable` policy
    /// decides between failing closed and admitting with an open lease.
    /// The policy never applies to rate-limit violations.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<Lease> {
        self.validate_request(&request)?;
        match self.acquire_inner(&request).await {
            Ok(lease) => Ok(lease),
            Err(err) if err.is_infrastructure() => {
                let mode = self
                    .resolver
                    .failure_mode()
                    .await
                    .unwrap_or(FailureMode::Block);
                match mode {
                    FailureMode::Allow => {
                        warn!(
                            entity_id = %request.entity_id,
                            resource = %request.resource,
                            %err,
                            "store unavailable; admitting per on_unavailable=allow"
                        );
                        Ok(Lease::open(
                            self.repo.clone(),
                            Arc::clone(&self.clock),
                            request.resource,
                        ))
                    }
                    FailureMode::Block => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn validate_request(&self, request: &AcquireRequest) -> Result<()> {
        if !schema::is_valid_name(&request.entity_id) {
            return Err(SluiceError::Validation(format!(
                "invalid entity id: '{}'",
                request.entity_id
            )));
        }
        if !schema::is_valid_name(&request.resource) {
            return Err(SluiceError::Validation(format!(
                "invalid resource name: '{}'",
                request.resource
            )));
        }
        if request.consume.is_empty() {
            return Err(SluiceError::Validation("consume map is empty".into()));
        }
        for (name, amount) in &request.consume {
            if !schema::is_valid_limit_name(name) || name == schema::WCU_LIMIT_NAME {
                return Err(SluiceError::Validation(format!("invalid limit name: '{name}'")));
            }
            if *amount < 0 {
                return Err(SluiceError::Validation(format!(
                    "negative consume for '{name}': {amount}"
                )));
            }
        }
        Ok(())
    }

    async fn acquire_inner(&self, request: &AcquireRequest) -> Result<Lease> {
        let chain = self.resolve_chain(&request.entity_id, request.cascade).await?;
        let primary_limits = self
            .resolver
            .resolve_limits(
                &request.entity_id,
                &request.resource,
                request.limits.as_deref(),
                request.use_stored_limits,
            )
            .await?;

        // Unknown limit names in the consume map are caller bugs, not
        // violations.
        for name in request.consume.keys() {
            if !primary_limits.iter().any(|l| &l.name == name) {
                return Err(SluiceError::Validation(format!(
                    "consume names unknown limit '{name}'"
                )));
            }
        }

        let mut limits_by_entity: HashMap<String, Vec<Limit>> = HashMap::new();
        limits_by_entity.insert(request.entity_id.clone(), primary_limits.clone());
        for node in chain.iter().skip(1) {
            let stored = self
                .resolver
                .resolve_limits(&node.entity_id, &request.resource, None, true)
                .await;
            let limits = match stored {
                Ok(limits) => limits,
                // Ancestors without any stored tier inherit the primary's
                // effective limits.
                Err(SluiceError::Validation(_)) => primary_limits.clone(),
                Err(err) => return Err(err),
            };
            limits_by_entity.insert(node.entity_id.clone(), limits);
        }

        let mut attempt: u32 = 0;
        loop {
            let plans = self.build_plans(request, &chain, &limits_by_entity).await?;
            let now_ms = self.clock.now_ms();

            let (ok, statuses) = self.evaluate(&plans, &request.consume, now_ms);
            if !ok {
                return Err(RateLimitExceeded::new(statuses).into());
            }

            let items = self.build_transaction(request, &plans, now_ms);
            match self.repo.transact_acquire(items).await {
                Ok(()) => {
                    let targets = plans
                        .iter()
                        .map(|p| LeaseTarget {
                            entity_id: p.entity_id.clone(),
                            shard: p.shard,
                        })
                        .collect();
                    return Ok(Lease::new(
                        self.repo.clone(),
                        Arc::clone(&self.clock),
                        request.resource.clone(),
                        targets,
                        request.consume.clone(),
                    ));
                }
                Err(StoreError::ConditionFailed) | Err(StoreError::TransactionCanceled(_)) => {
                    attempt += 1;
                    if attempt >= self.config.retry_attempts {
                        return Err(SluiceError::Conflict(format!(
                            "acquire lost the optimistic lock {attempt} times"
                        )));
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        entity_id = %request.entity_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "optimistic lock collision; refreshing and retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Exponential backoff with full jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter = rand::thread_rng().gen_range(0..=base.max(1));
        Duration::from_millis(exp + jitter)
    }

    /// Resolve the effective cascade chain, primary entity first. The walk
    /// is bounded and cycle-checked; entities without a stored record are
    /// legal chain members (buckets do not require metadata rows).
    async fn resolve_chain(
        &self,
        entity_id: &str,
        cascade_override: Option<bool>,
    ) -> Result<Vec<ChainNode>> {
        let primary = self.resolver.get_entity(entity_id).await?;
        let cascade = cascade_override.unwrap_or(primary.as_ref().is_some_and(|e| e.cascade));

        let mut chain = vec![ChainNode {
            entity_id: entity_id.to_string(),
            cascade,
            parent_id: primary.as_ref().and_then(|e| e.parent_id.clone()),
        }];
        if !cascade {
            return Ok(chain);
        }

        let mut visited: HashSet<String> = [entity_id.to_string()].into();
        let mut next = primary.and_then(|e| e.parent_id);
        while let Some(parent_id) = next {
            if !visited.insert(parent_id.clone()) {
                return Err(SluiceError::Validation(format!(
                    "cascade cycle through entity '{parent_id}'"
                )));
            }
            if chain.len() >= self.config.max_cascade_depth {
                return Err(SluiceError::Validation(format!(
                    "cascade chain exceeds depth {}",
                    self.config.max_cascade_depth
                )));
            }
            let parent = self.resolver.get_entity(&parent_id).await?;
            chain.push(ChainNode {
                entity_id: parent_id,
                cascade: true,
                parent_id: parent.as_ref().and_then(|e| e.parent_id.clone()),
            });
            next = parent.and_then(|e| e.parent_id);
        }
        Ok(chain)
    }

    /// Stable shard routing: the same client always lands on the same
    /// shard of a bucket, different clients spread across shards.
    fn route_shard(&self, entity_id: &str, resource: &str, shard_count: u32) -> u32 {
        if shard_count <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        self.client_token.hash(&mut hasher);
        entity_id.hash(&mut hasher);
        resource.hash(&mut hasher);
        (hasher.finish() % shard_count as u64) as u32
    }

    /// Read bucket rows for the chain (shard 0 first to learn the shard
    /// count, then the routed shard where it differs) and assemble one
    /// write plan per chain entity.
    async fn build_plans(
        &self,
        request: &AcquireRequest,
        chain: &[ChainNode],
        limits_by_entity: &HashMap<String, Vec<Limit>>,
    ) -> Result<Vec<EntityPlan>> {
        let canonical: Vec<(String, String, u32)> = chain
            .iter()
            .map(|n| (n.entity_id.clone(), request.resource.clone(), 0))
            .collect();
        let mut rows = self.repo.batch_get_buckets(&canonical).await?;

        let mut routed: Vec<(String, u32)> = Vec::new();
        for node in chain {
            let key = (node.entity_id.clone(), request.resource.clone());
            let shard_count = rows.get(&key).map_or(1, |row| row.shard_count);
            let shard = self.route_shard(&node.entity_id, &request.resource, shard_count);
            routed.push((node.entity_id.clone(), shard));
        }

        let reroutes: Vec<(String, String, u32)> = routed
            .iter()
            .filter(|(_, shard)| *shard != 0)
            .map(|(entity, shard)| (entity.clone(), request.resource.clone(), *shard))
            .collect();
        if !reroutes.is_empty() {
            let rerouted = self.repo.batch_get_buckets(&reroutes).await?;
            // Routed rows replace the canonical shard's view; a missing
            // routed row means first touch on that shard.
            for (entity, _) in routed.iter().filter(|(_, s)| *s != 0) {
                let key = (entity.clone(), request.resource.clone());
                match rerouted.get(&key) {
                    Some(row) => {
                        rows.insert(key, row.clone());
                    }
                    None => {
                        rows.remove(&key);
                    }
                }
            }
        }

        Ok(chain
            .iter()
            .zip(routed)
            .map(|(node, (_, shard))| EntityPlan {
                entity_id: node.entity_id.clone(),
                resource: request.resource.clone(),
                shard,
                cascade: node.cascade,
                parent_id: node.parent_id.clone(),
                limits: limits_by_entity
                    .get(&node.entity_id)
                    .cloned()
                    .unwrap_or_default(),
                row: rows.remove(&(node.entity_id.clone(), request.resource.clone())),
            })
            .collect())
    }

    /// Speculatively refill-and-consume every plan. Returns the statuses
    /// of all evaluated limits; `ok` is false when any limit would be
    /// violated at `now_ms`.
    fn evaluate(
        &self,
        plans: &[EntityPlan],
        consume: &ConsumeMap,
        now_ms: i64,
    ) -> (bool, Vec<LimitStatus>) {
        let mut all_ok = true;
        let mut statuses = Vec::new();
        for plan in plans {
            let states = self.plan_states(plan, consume, now_ms);
            let (ok, entity_statuses) = bucket::would_refill_satisfy(&states, consume, now_ms);
            all_ok &= ok;
            statuses.extend(entity_statuses);
        }
        (all_ok, statuses)
    }

    /// Current per-limit states of a plan, synthesising full buckets for
    /// limits with no stored counters yet.
    fn plan_states(&self, plan: &EntityPlan, consume: &ConsumeMap, now_ms: i64) -> Vec<BucketState> {
        plan.limits
            .iter()
            .filter(|limit| consume.contains_key(&limit.name))
            .map(|limit| {
                plan.row
                    .as_ref()
                    .and_then(|row| row.state(&limit.name))
                    .cloned()
                    .unwrap_or_else(|| {
                        BucketState::from_limit(&plan.entity_id, &plan.resource, limit, now_ms)
                    })
            })
            .collect()
    }

    /// Build the single acquire transaction: a first-touch put or a
    /// conditional update per chain bucket.
    fn build_transaction(
        &self,
        request: &AcquireRequest,
        plans: &[EntityPlan],
        now_ms: i64,
    ) -> Vec<TransactItem> {
        plans
            .iter()
            .map(|plan| {
                // Ancestors only account for limits they define.
                let consumed: HashMap<String, i64> = request
                    .consume
                    .iter()
                    .filter(|(name, _)| plan.limits.iter().any(|l| &l.name == *name))
                    .map(|(name, amount)| (name.clone(), *amount))
                    .collect();

                match &plan.row {
                    None => TransactItem::Put(self.repo.build_bucket_put(
                        &plan.entity_id,
                        &request.resource,
                        plan.shard,
                        &plan.limits,
                        &consumed,
                        now_ms,
                        plan.cascade,
                        plan.parent_id.as_deref(),
                    )),
                    Some(row) => {
                        let new_rf = now_ms.max(row.rf_ms);
                        let present: Vec<(String, i64)> = consumed
                            .iter()
                            .filter(|(name, _)| row.state(name).is_some())
                            .map(|(name, amount)| (name.clone(), amount * MILLI))
                            .collect();
                        let mut op = self.repo.build_bucket_update(
                            &plan.entity_id,
                            &request.resource,
                            plan.shard,
                            row.rf_ms,
                            new_rf,
                            &present,
                        );
                        // Limits added to the config after the bucket was
                        // created: seed their counters in the same write.
                        for limit in plan
                            .limits
                            .iter()
                            .filter(|l| consumed.contains_key(&l.name) && row.state(&l.name).is_none())
                        {
                            let consumed_milli = consumed[&limit.name] * MILLI;
                            op = seed_missing_limit(op, limit, consumed_milli);
                        }
                        TransactItem::Update(op)
                    }
                }
            })
            .collect()
    }

    // ========================================================================
    // Capacity queries
    // ========================================================================

    /// Whole tokens currently available per limit, including projected
    /// refill. Buckets that do not exist yet report their full burst.
    pub async fn available(
        &self,
        entity_id: &str,
        resource: &str,
        limits: Option<&[Limit]>,
    ) -> Result<BTreeMap<String, i64>> {
        let resolved = self
            .resolver
            .resolve_limits(entity_id, resource, limits, true)
            .await?;
        let row = self.routed_bucket(entity_id, resource).await?;
        let now_ms = self.clock.now_ms();

        Ok(resolved
            .iter()
            .map(|limit| {
                let available = row
                    .as_ref()
                    .and_then(|r| r.state(&limit.name))
                    .map(|state| bucket::calculate_available(state, now_ms))
                    .unwrap_or(limit.burst);
                (limit.name.clone(), available)
            })
            .collect())
    }

    /// Seconds until refill alone would satisfy `needed`. Zero when the
    /// capacity is already there.
    pub async fn time_until_available(
        &self,
        entity_id: &str,
        resource: &str,
        needed: &ConsumeMap,
        limits: Option<&[Limit]>,
    ) -> Result<f64> {
        let resolved = self
            .resolver
            .resolve_limits(entity_id, resource, limits, true)
            .await?;
        let row = self.routed_bucket(entity_id, resource).await?;
        let now_ms = self.clock.now_ms();

        let mut wait: f64 = 0.0;
        for (name, amount) in needed {
            let Some(limit) = resolved.iter().find(|l| &l.name == name) else {
                continue;
            };
            let state = row
                .as_ref()
                .and_then(|r| r.state(name))
                .cloned()
                .unwrap_or_else(|| BucketState::from_limit(entity_id, resource, limit, now_ms));
            let refill = bucket::refill_state(&state, now_ms);
            let deficit = amount * MILLI - refill.new_tokens_milli;
            wait = wait.max(bucket::calculate_retry_after(
                deficit,
                state.refill_amount_milli,
                state.refill_period_ms,
            ));
        }
        Ok(wait)
    }

    async fn routed_bucket(&self, entity_id: &str, resource: &str) -> Result<Option<BucketRow>> {
        let canonical = self.repo.get_bucket(entity_id, resource, 0).await?;
        let shard_count = canonical.as_ref().map_or(1, |r| r.shard_count);
        let shard = self.route_shard(entity_id, resource, shard_count);
        if shard == 0 {
            return Ok(canonical);
        }
        self.repo.get_bucket(entity_id, resource, shard).await
    }

    // ========================================================================
    // Entity management
    // ========================================================================

    /// Create an entity. Fails when it already exists.
    pub async fn create_entity(&self, entity: Entity) -> Result<Entity> {
        if !schema::is_valid_name(&entity.id) {
            return Err(SluiceError::Validation(format!("invalid entity id: '{}'", entity.id)));
        }
        let audit = self.audit_record(
            AuditAction::CreateEntity,
            &entity.id,
            None,
            serde_json::json!({ "parent_id": entity.parent_id, "cascade": entity.cascade }),
        );
        self.repo.create_entity(&entity, Some(audit)).await?;
        self.cache.invalidate();
        Ok(entity)
    }

    /// Fetch an entity.
    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        self.repo.get_entity(entity_id).await
    }

    /// Entities whose parent is the given entity.
    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<Entity>> {
        self.repo.get_children(parent_id).await
    }

    /// Delete an entity and every row it owns.
    pub async fn delete_entity(&self, entity_id: &str) -> Result<()> {
        self.repo.delete_entity(entity_id).await?;
        self.cache.invalidate();
        Ok(())
    }

    // ========================================================================
    // Limit configuration
    // ========================================================================

    /// Store entity-level limits, optionally scoped to one resource.
    pub async fn set_limits(
        &self,
        entity_id: &str,
        limits: &[Limit],
        resource: Option<&str>,
    ) -> Result<()> {
        validate_limits(limits)?;
        let audit = self.audit_record(
            AuditAction::SetLimits,
            entity_id,
            resource,
            limits_json(limits),
        );
        self.repo
            .set_entity_config(entity_id, resource, limits, Some(audit))
            .await?;
        self.cache.invalidate();
        Ok(())
    }

    /// Read stored entity-level limits.
    pub async fn get_limits(&self, entity_id: &str, resource: Option<&str>) -> Result<Vec<Limit>> {
        self.repo.get_entity_config(entity_id, resource).await
    }

    /// Remove stored entity-level limits.
    pub async fn delete_limits(&self, entity_id: &str, resource: Option<&str>) -> Result<()> {
        let audit = self.audit_record(AuditAction::DeleteLimits, entity_id, resource, serde_json::Value::Null);
        self.repo
            .delete_entity_config(entity_id, resource, Some(audit))
            .await?;
        self.cache.invalidate();
        Ok(())
    }

    /// Store system-wide defaults and the unavailability policy.
    pub async fn set_system_defaults(
        &self,
        limits: &[Limit],
        on_unavailable: Option<FailureMode>,
    ) -> Result<()> {
        validate_limits(limits)?;
        self.repo.set_system_config(limits, on_unavailable).await?;
        self.repo
            .put_audit(&self.audit_record(
                AuditAction::SetSystemDefaults,
                AUDIT_SYSTEM_ENTITY,
                None,
                limits_json(limits),
            ))
            .await?;
        self.cache.invalidate();
        Ok(())
    }

    /// Read system-wide defaults.
    pub async fn get_system_defaults(&self) -> Result<Option<(Vec<Limit>, Option<FailureMode>)>> {
        self.repo.get_system_config().await
    }

    /// Remove system-wide defaults.
    pub async fn delete_system_defaults(&self) -> Result<()> {
        self.repo.delete_system_config().await?;
        self.repo
            .put_audit(&self.audit_record(
                AuditAction::DeleteSystemDefaults,
                AUDIT_SYSTEM_ENTITY,
                None,
                serde_json::Value::Null,
            ))
            .await?;
        self.cache.invalidate();
        Ok(())
    }

    /// Store resource-level defaults.
    pub async fn set_resource_defaults(&self, resource: &str, limits: &[Limit]) -> Result<()> {
        validate_limits(limits)?;
        self.repo.set_resource_config(resource, limits).await?;
        self.repo
            .put_audit(&self.audit_record(
                AuditAction::SetResourceDefaults,
                AUDIT_SYSTEM_ENTITY,
                Some(resource),
                limits_json(limits),
            ))
            .await?;
        self.cache.invalidate();
        Ok(())
    }

    /// Read resource-level defaults.
    pub async fn get_resource_defaults(&self, resource: &str) -> Result<Vec<Limit>> {
        self.repo.get_resource_config(resource).await
    }

    /// Remove resource-level defaults.
    pub async fn delete_resource_defaults(&self, resource: &str) -> Result<()> {
        self.repo.delete_resource_config(resource).await?;
        self.repo
            .put_audit(&self.audit_record(
                AuditAction::DeleteResourceDefaults,
                AUDIT_SYSTEM_ENTITY,
                Some(resource),
                serde_json::Value::Null,
            ))
            .await?;
        self.cache.invalidate();
        Ok(())
    }

    /// Resources with stored defaults.
    pub async fn list_resource_defaults(&self) -> Result<Vec<String>> {
        self.repo.list_resource_configs().await
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Audit trail of an entity, in creation order.
    pub async fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditRecord>> {
        self.repo.query_audit(entity_id).await
    }

    /// Usage snapshots of an (entity, resource), newest first.
    pub async fn usage(
        &self,
        entity_id: &str,
        resource: &str,
        window: Window,
    ) -> Result<Vec<UsageSnapshot>> {
        self.repo.query_usage(entity_id, resource, window).await
    }

    fn audit_record(
        &self,
        action: AuditAction,
        entity_id: &str,
        resource: Option<&str>,
        details: serde_json::Value,
    ) -> AuditRecord {
        let now_ms = self.clock.now_ms();
        AuditRecord {
            event_id: uuid::Uuid::now_v7().to_string(),
            timestamp: format_timestamp(now_ms),
            entity_id: entity_id.to_string(),
            action,
            principal: self.config.principal.clone(),
            resource: resource.map(str::to_string),
            details,
            ttl_epoch_s: now_ms / 1000 + self.config.audit_retention_days * 86_400,
        }
    }
}

/// Pseudo-entity owning the audit partitions of system- and
/// resource-level mutations.
pub const AUDIT_SYSTEM_ENTITY: &str = "system";

/// Extend a bucket update with initial counters for a limit the row does
/// not carry yet. ADD on the absent attribute starts from zero, so the
/// seeded balance lands at burst minus the consumption.
fn seed_missing_limit(op: UpdateOp, limit: &Limit, consumed_milli: i64) -> UpdateOp {
    let attr = |f: &str| schema::bucket_attr(&limit.name, f);
    op.set_if_not_exists(attr(schema::FIELD_CP), limit.capacity_milli())
        .set_if_not_exists(attr(schema::FIELD_BX), limit.burst_milli())
        .set_if_not_exists(attr(schema::FIELD_RA), limit.refill_amount_milli())
        .set_if_not_exists(attr(schema::FIELD_RP), limit.refill_period_ms())
        .add(attr(schema::FIELD_TK), limit.burst_milli() - consumed_milli)
        .add(attr(schema::FIELD_TC), consumed_milli)
}

fn validate_limits(limits: &[Limit]) -> Result<()> {
    for limit in limits {
        if !schema::is_valid_limit_name(&limit.name) || limit.name == schema::WCU_LIMIT_NAME {
            return Err(SluiceError::Validation(format!("invalid limit name: '{}'", limit.name)));
        }
        if limit.capacity < 0 || limit.burst < 0 || limit.refill_amount < 0 {
            return Err(SluiceError::Validation(format!(
                "limit '{}' has negative parameters",
                limit.name
            )));
        }
    }
    Ok(())
}

fn limits_json(limits: &[Limit]) -> serde_json::Value {
    serde_json::json!({
        "limits": limits
            .iter()
            .map(|l| {
                serde_json::json!({
                    "name": l.name,
                    "capacity": l.capacity,
                    "burst": l.burst,
                    "refill_amount": l.refill_amount,
                    "refill_period_s": l.refill_period.as_secs(),
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn format_timestamp(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

/// Order-comparable key of a dotted version string.
fn version_key(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.').map(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .unwrap_or(0)
    });
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
