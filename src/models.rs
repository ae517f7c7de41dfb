//! Core domain types shared across the limiter, repository, and aggregator.
//!
//! All token arithmetic uses millitokens (integer ×1000) so that refill
//! rates like "100 tokens / 60s" stay exact under integer division.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One thousand millitokens per token.
pub const MILLI: i64 = 1000;

/// Requested consumption per limit name, e.g. `{"rpm": 1, "tpm": 200}`.
///
/// Ordered so that transaction items are built deterministically.
pub type ConsumeMap = BTreeMap<String, i64>;

// ============================================================================
// Limits
// ============================================================================

/// A named rate limit: capacity, burst ceiling, and refill rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Limit name, e.g. `rpm` or `tpm`. Becomes part of attribute names.
    pub name: String,
    /// Steady-state capacity in whole tokens.
    pub capacity: i64,
    /// Burst ceiling in whole tokens. Refill never exceeds this.
    pub burst: i64,
    /// Tokens added per refill period.
    pub refill_amount: i64,
    /// Refill period.
    pub refill_period: Duration,
}

impl Limit {
    /// Create a limit with explicit refill parameters. Burst defaults to
    /// capacity.
    pub fn new(name: impl Into<String>, capacity: i64, refill_amount: i64, refill_period: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            burst: capacity,
            refill_amount,
            refill_period,
        }
    }

    /// `n` tokens per second, full refresh each second.
    pub fn per_second(name: impl Into<String>, n: i64) -> Self {
        Self::new(name, n, n, Duration::from_secs(1))
    }

    /// `n` tokens per minute, full refresh each minute.
    pub fn per_minute(name: impl Into<String>, n: i64) -> Self {
        Self::new(name, n, n, Duration::from_secs(60))
    }

    /// `n` tokens per hour, full refresh each hour.
    pub fn per_hour(name: impl Into<String>, n: i64) -> Self {
        Self::new(name, n, n, Duration::from_secs(3600))
    }

    /// Override the burst ceiling.
    pub fn with_burst(mut self, burst: i64) -> Self {
        self.burst = burst;
        self
    }

    /// Capacity in millitokens.
    pub fn capacity_milli(&self) -> i64 {
        self.capacity * MILLI
    }

    /// Burst ceiling in millitokens.
    pub fn burst_milli(&self) -> i64 {
        self.burst * MILLI
    }

    /// Refill amount in millitokens.
    pub fn refill_amount_milli(&self) -> i64 {
        self.refill_amount * MILLI
    }

    /// Refill period in milliseconds.
    pub fn refill_period_ms(&self) -> i64 {
        self.refill_period.as_millis() as i64
    }
}

// ============================================================================
// Bucket state
// ============================================================================

/// Live token state of one limit on one (entity, resource) bucket.
///
/// `tokens_milli` may be negative: post-hoc reconciliation can push a bucket
/// into debt, which subsequent refill repays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    /// Owning entity id.
    pub entity_id: String,
    /// Resource the bucket throttles.
    pub resource: String,
    /// Limit name this state belongs to.
    pub limit_name: String,
    /// Current balance in millitokens. Negative means debt.
    pub tokens_milli: i64,
    /// Timestamp of the last refill (epoch ms). Shared by all limits of the
    /// composite bucket row.
    pub last_refill_ms: i64,
    /// Capacity in millitokens.
    pub capacity_milli: i64,
    /// Burst ceiling in millitokens.
    pub burst_milli: i64,
    /// Refill amount per period in millitokens.
    pub refill_amount_milli: i64,
    /// Refill period in milliseconds.
    pub refill_period_ms: i64,
}

impl BucketState {
    /// Fresh bucket for a limit, full at the burst ceiling.
    pub fn from_limit(entity_id: &str, resource: &str, limit: &Limit, now_ms: i64) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            resource: resource.to_string(),
            limit_name: limit.name.clone(),
            tokens_milli: limit.burst_milli(),
            last_refill_ms: now_ms,
            capacity_milli: limit.capacity_milli(),
            burst_milli: limit.burst_milli(),
            refill_amount_milli: limit.refill_amount_milli(),
            refill_period_ms: limit.refill_period_ms(),
        }
    }

    /// The limit parameters of this state, reconstructed in whole tokens.
    pub fn limit(&self) -> Limit {
        Limit {
            name: self.limit_name.clone(),
            capacity: self.capacity_milli / MILLI,
            burst: self.burst_milli / MILLI,
            refill_amount: self.refill_amount_milli / MILLI,
            refill_period: Duration::from_millis(self.refill_period_ms as u64),
        }
    }

    /// Whole tokens currently available, rounded toward negative infinity so
    /// that a bucket in debt never reports a token it does not have.
    pub fn available_tokens(&self) -> i64 {
        self.tokens_milli.div_euclid(MILLI)
    }
}

// ============================================================================
// Limit status
// ============================================================================

/// Outcome of evaluating one limit during an acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitStatus {
    /// Entity whose bucket was evaluated. Under cascade this may be an
    /// ancestor of the entity passed to `acquire`.
    pub entity_id: String,
    /// Resource the bucket throttles.
    pub resource: String,
    /// The limit that was evaluated.
    pub limit: Limit,
    /// Tokens requested against this limit.
    pub requested: i64,
    /// Whole tokens that were available at evaluation time.
    pub available: i64,
    /// Whether the request exceeded this limit.
    pub exceeded: bool,
    /// Seconds until refill alone would satisfy the request. Zero when the
    /// limit passed.
    pub retry_after_seconds: f64,
}

impl LimitStatus {
    /// Name of the evaluated limit.
    pub fn limit_name(&self) -> &str {
        &self.limit.name
    }

    /// JSON shape used in the 429 response body.
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "entity_id": self.entity_id,
            "resource": self.resource,
            "limit_name": self.limit.name,
            "available": self.available,
            "requested": self.requested,
            "exceeded": self.exceeded,
            "retry_after_seconds": self.retry_after_seconds,
            "capacity": self.limit.capacity,
            "burst": self.limit.burst,
        })
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Entity metadata: a tenant, project, API key, or any other principal that
/// owns buckets. Hierarchy is expressed by `parent_id` references walked at
/// request time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier, unique within the namespace.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Parent entity for cascading limits.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Whether acquires against this entity also consume from ancestors.
    #[serde(default)]
    pub cascade: bool,
    /// Opaque caller metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Entity {
    /// New root entity with no parent and no metadata.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            parent_id: None,
            cascade: false,
            metadata: serde_json::Value::Null,
        }
    }
}

// ============================================================================
// Failure policy
// ============================================================================

/// What to do when the store is unreachable during an acquire.
///
/// Consulted only on infrastructure errors, never on rate-limit violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Raise `RateLimiterUnavailable`; callers translate to a 5xx.
    Block,
    /// Admit the request and continue without accounting.
    Allow,
}

impl Default for FailureMode {
    fn default() -> Self {
        FailureMode::Block
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureMode::Block => write!(f, "block"),
            FailureMode::Allow => write!(f, "allow"),
        }
    }
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(FailureMode::Block),
            "allow" => Ok(FailureMode::Allow),
            other => Err(format!("unknown failure mode: {other}")),
        }
    }
}

// ============================================================================
// Namespaces
// ============================================================================

/// Lifecycle status of a registered namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceStatus {
    /// Namespace is live.
    Active,
    /// Soft-deleted: forward mapping removed, data retained until purge.
    Deleted,
}

impl fmt::Display for NamespaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceStatus::Active => write!(f, "active"),
            NamespaceStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Reverse registry record of a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Opaque 8-character namespace id.
    pub id: String,
    /// Human-readable name it was registered under.
    pub name: String,
    /// Current lifecycle status.
    pub status: NamespaceStatus,
    /// Registration timestamp (epoch ms).
    pub created_at_ms: i64,
    /// Soft-deletion timestamp, when status is `Deleted`.
    #[serde(default)]
    pub deleted_at_ms: Option<i64>,
}

// ============================================================================
// Version record
// ============================================================================

/// Deployment version gate, written by the deployer and checked at client
/// init unless explicitly skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Table schema version.
    pub schema_version: u32,
    /// Minimum client crate version allowed against this schema.
    pub min_client_version: String,
    /// Version of the deployed aggregator, if any.
    #[serde(default)]
    pub aggregator_version: Option<String>,
    /// Last update timestamp (epoch ms).
    pub updated_at_ms: i64,
    /// Who performed the deployment.
    #[serde(default)]
    pub updated_by: Option<String>,
}

// ============================================================================
// Audit
// ============================================================================

/// Administrative action recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Entity created.
    CreateEntity,
    /// Entity and all owned rows deleted.
    DeleteEntity,
    /// Entity-level limits written.
    SetLimits,
    /// Entity-level limits removed.
    DeleteLimits,
    /// System defaults written.
    SetSystemDefaults,
    /// System defaults removed.
    DeleteSystemDefaults,
    /// Resource defaults written.
    SetResourceDefaults,
    /// Resource defaults removed.
    DeleteResourceDefaults,
    /// Declarative manifest applied.
    ApplyManifest,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::CreateEntity => "create_entity",
            AuditAction::DeleteEntity => "delete_entity",
            AuditAction::SetLimits => "set_limits",
            AuditAction::DeleteLimits => "delete_limits",
            AuditAction::SetSystemDefaults => "set_system_defaults",
            AuditAction::DeleteSystemDefaults => "delete_system_defaults",
            AuditAction::SetResourceDefaults => "set_resource_defaults",
            AuditAction::DeleteResourceDefaults => "delete_resource_defaults",
            AuditAction::ApplyManifest => "apply_manifest",
        };
        write!(f, "{s}")
    }
}

/// Immutable audit event. The sort-key suffix is the `event_id`, a UUIDv7,
/// so stream order equals creation order within a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Time-ordered event id (UUIDv7).
    pub event_id: String,
    /// Client wall-clock timestamp, ISO-8601 UTC.
    pub timestamp: String,
    /// Entity the action targeted.
    pub entity_id: String,
    /// Action performed.
    pub action: AuditAction,
    /// Acting principal, when known.
    #[serde(default)]
    pub principal: Option<String>,
    /// Resource the action targeted, when scoped to one.
    #[serde(default)]
    pub resource: Option<String>,
    /// Structured action details.
    #[serde(default)]
    pub details: serde_json::Value,
    /// Archival horizon (epoch seconds). Expiry routes the record through
    /// the stream to the archiver.
    pub ttl_epoch_s: i64,
}

// ============================================================================
// Usage snapshots
// ============================================================================

/// Aggregation window granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    /// One hour, starting on the hour.
    Hourly,
    /// One day, starting at midnight UTC.
    Daily,
    /// One calendar month.
    Monthly,
}

impl Window {
    /// Storage spelling of the window kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Hourly => "hourly",
            Window::Daily => "daily",
            Window::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One rolling usage snapshot row, as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Entity the usage belongs to.
    pub entity_id: String,
    /// Resource consumed.
    pub resource: String,
    /// Window granularity.
    pub window: Window,
    /// ISO timestamp of the window start.
    pub window_start: String,
    /// Whole tokens consumed per limit within the window.
    pub counters: BTreeMap<String, i64>,
    /// Number of consumption events folded into the snapshot.
    pub total_events: i64,
}

// ============================================================================
// Clock
// ============================================================================

/// Injectable wall-clock. The limiter and aggregator never read system time
/// directly, so tests can drive refill deterministically.
pub trait Clock: Send + Sync {
    /// Milliseconds since the UNIX epoch.
    fn now_ms(&self) -> i64;
}

/// System wall-clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    /// Clock starting at the given epoch-ms instant.
    pub fn at(ms: i64) -> Self {
        Self { ms: AtomicI64::new(ms) }
    }

    /// Advance the clock.
    pub fn advance(&self, delta: Duration) {
        self.ms.fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute instant.
    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}
