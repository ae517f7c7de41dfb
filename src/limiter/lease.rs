//! Lease: the scoped handle returned by a successful acquire
//!
//! The speculative consumption is already persisted when a lease is
//! handed out. The lease then tracks post-hoc corrections and guarantees
//! one of two exits:
//!
//! - `commit()` writes the accumulated adjustments (one ADD-only
//!   transaction across the cascade chain), or writes nothing when the
//!   caller made none.
//! - `rollback()` issues the compensating negation of everything the
//!   acquire wrote, restoring the buckets as if it never happened. The
//!   compensation is best-effort: a failure is logged, never raised, so
//!   the caller's in-flight error is not replaced by a different one.
//!
//! Using a lease after either exit fails loudly with `LeaseClosed`.

use std::sync::Arc;

use tracing::{error, warn};

use crate::bucket;
use crate::error::{RateLimitExceeded, Result, SluiceError};
use crate::models::{Clock, ConsumeMap, MILLI};
use crate::store::{Repository, TransactItem};

/// One bucket row the lease writes to: a chain entity and its routed shard.
#[derive(Debug, Clone)]
pub(crate) struct LeaseTarget {
    pub entity_id: String,
    pub shard: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    /// Normal lease: adjustments accumulate, exit pending.
    Active,
    /// Store was unreachable and the policy admitted the request. Every
    /// operation is a no-op; there is nothing to commit or reverse.
    Open,
    /// Terminal: adjustments written.
    Committed,
    /// Terminal: acquire compensated.
    Released,
}

/// Scoped reservation of rate-limit capacity.
pub struct Lease {
    repo: Repository,
    clock: Arc<dyn Clock>,
    resource: String,
    targets: Vec<LeaseTarget>,
    /// Consumption persisted by the acquire transaction.
    written: ConsumeMap,
    /// Adjustments accumulated since acquire, not yet persisted.
    pending: ConsumeMap,
    state: LeaseState,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("resource", &self.resource)
            .field("targets", &self.targets)
            .field("written", &self.written)
            .field("pending", &self.pending)
            .field("state", &self.state)
            .finish()
    }
}

impl Lease {
    pub(crate) fn new(
        repo: Repository,
        clock: Arc<dyn Clock>,
        resource: String,
        targets: Vec<LeaseTarget>,
        written: ConsumeMap,
    ) -> Self {
        Self {
            repo,
            clock,
            resource,
            targets,
            written,
            pending: ConsumeMap::new(),
            state: LeaseState::Active,
        }
    }

    /// Lease handed out under `on_unavailable = allow`: admits the caller
    /// without accounting.
    pub(crate) fn open(repo: Repository, clock: Arc<dyn Clock>, resource: String) -> Self {
        Self {
            repo,
            clock,
            resource,
            targets: Vec::new(),
            written: ConsumeMap::new(),
            pending: ConsumeMap::new(),
            state: LeaseState::Open,
        }
    }

    /// Whether this lease was admitted without accounting (fail-open).
    pub fn is_open(&self) -> bool {
        self.state == LeaseState::Open
    }

    /// Total consumption this lease represents: the acquire's speculative
    /// consumption plus accumulated adjustments.
    pub fn consumed(&self) -> ConsumeMap {
        let mut total = self.written.clone();
        for (name, delta) in &self.pending {
            *total.entry(name.clone()).or_insert(0) += delta;
        }
        total.retain(|_, v| *v != 0);
        total
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            LeaseState::Active | LeaseState::Open => Ok(()),
            LeaseState::Committed => Err(SluiceError::LeaseClosed { state: "committed" }),
            LeaseState::Released => Err(SluiceError::LeaseClosed { state: "released" }),
        }
    }

    /// Record additional consumption, checked against current bucket
    /// state. Raises `RateLimitExceeded` when the additional amount does
    /// not fit; nothing is persisted until `commit`.
    pub async fn consume(&mut self, deltas: ConsumeMap) -> Result<()> {
        self.ensure_active()?;
        if self.state == LeaseState::Open {
            return Ok(());
        }

        let requests: Vec<(String, String, u32)> = self
            .targets
            .iter()
            .map(|t| (t.entity_id.clone(), self.resource.clone(), t.shard))
            .collect();
        let rows = self.repo.batch_get_buckets(&requests).await?;

        let now_ms = self.clock.now_ms();
        let mut statuses = Vec::new();
        let mut ok = true;
        for target in &self.targets {
            let Some(row) = rows.get(&(target.entity_id.clone(), self.resource.clone())) else {
                continue;
            };
            let states: Vec<_> = row.user_states().into_iter().cloned().collect();
            let (fits, entity_statuses) = bucket::would_refill_satisfy(&states, &deltas, now_ms);
            ok &= fits;
            statuses.extend(entity_statuses);
        }

        if !ok {
            return Err(RateLimitExceeded::new(statuses).into());
        }
        for (name, delta) in deltas {
            *self.pending.entry(name).or_insert(0) += delta;
        }
        Ok(())
    }

    /// Record an unchecked correction of already-reserved consumption. May
    /// push the bucket negative on commit; never waits, never fails on
    /// capacity.
    pub fn adjust(&mut self, deltas: ConsumeMap) -> Result<()> {
        self.ensure_active()?;
        if self.state == LeaseState::Open {
            return Ok(());
        }
        for (name, delta) in deltas {
            *self.pending.entry(name).or_insert(0) += delta;
        }
        Ok(())
    }

    /// Return tokens that were reserved but not used.
    pub fn release(&mut self, amounts: ConsumeMap) -> Result<()> {
        self.adjust(amounts.into_iter().map(|(name, v)| (name, -v)).collect())
    }

    /// Persist accumulated adjustments and close the lease. With no
    /// adjustments nothing is written: the acquire already persisted the
    /// speculative consumption.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.state == LeaseState::Open {
            self.state = LeaseState::Committed;
            return Ok(());
        }

        let deltas: Vec<(String, i64)> = self
            .pending
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(name, v)| (name.clone(), v * MILLI))
            .collect();

        if !deltas.is_empty() {
            let items: Vec<TransactItem> = self
                .targets
                .iter()
                .map(|t| {
                    TransactItem::Update(self.repo.build_bucket_adjust(
                        &t.entity_id,
                        &self.resource,
                        t.shard,
                        &deltas,
                    ))
                })
                .collect();
            self.repo.transact_acquire(items).await?;
        }

        self.state = LeaseState::Committed;
        Ok(())
    }

    /// Reverse everything the acquire persisted and close the lease.
    ///
    /// Called on the caller's error path. A failed compensation leaves
    /// drift that refill eventually repays; it is logged for alerting and
    /// never surfaced, so the in-flight error stays what it was.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.state == LeaseState::Open {
            self.state = LeaseState::Released;
            return Ok(());
        }

        let reversal: Vec<(String, i64)> = self
            .written
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(name, v)| (name.clone(), -v * MILLI))
            .collect();

        if !reversal.is_empty() {
            let items: Vec<TransactItem> = self
                .targets
                .iter()
                .map(|t| {
                    TransactItem::Update(self.repo.build_bucket_adjust(
                        &t.entity_id,
                        &self.resource,
                        t.shard,
                        &reversal,
                    ))
                })
                .collect();
            if let Err(err) = self.repo.transact_acquire(items).await {
                error!(
                    resource = %self.resource,
                    %err,
                    "lease compensation failed; bucket drift until refill"
                );
            }
        }

        self.state = LeaseState::Released;
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.state == LeaseState::Active && !self.written.is_empty() {
            warn!(
                resource = %self.resource,
                "lease dropped while active; speculative consumption was not \
                 committed or rolled back"
            );
        }
    }
}
