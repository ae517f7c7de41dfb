//! Token-bucket arithmetic
//!
//! Pure refill/consume/retry-after math over [`BucketState`]. Everything is
//! integer millitokens; elapsed-time refill truncates, and the truncation
//! error is bounded by one millitoken per refill. No I/O, no clock access:
//! callers pass `now_ms` explicitly.

use crate::models::{BucketState, ConsumeMap, LimitStatus, MILLI};

/// Result of a refill computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillResult {
    /// Balance after refill, capped at the burst ceiling.
    pub new_tokens_milli: i64,
    /// Advanced refill timestamp.
    pub new_last_refill_ms: i64,
}

/// Result of a checked consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeResult {
    /// Whether the requested tokens were available.
    pub success: bool,
    /// Balance after refill and (on success) consumption.
    pub new_tokens_milli: i64,
    /// Advanced refill timestamp.
    pub new_last_refill_ms: i64,
    /// Whole tokens available after refill, before consumption.
    pub available: i64,
    /// Seconds until refill alone would cover the deficit. Zero on success.
    pub retry_after_seconds: f64,
}

/// Refill a balance for elapsed wall-clock time.
///
/// `added = elapsed * refill_amount / refill_period`, integer-truncated.
/// The result is capped at `burst_milli`; a negative balance refills toward
/// zero and the cap only engages once the balance is positive, so a bucket
/// deep in debt may overshoot past zero up to burst when enough time has
/// elapsed. The refill timestamp never moves backwards.
pub fn refill_bucket(
    tokens_milli: i64,
    last_refill_ms: i64,
    now_ms: i64,
    burst_milli: i64,
    refill_amount_milli: i64,
    refill_period_ms: i64,
) -> RefillResult {
    let elapsed = (now_ms - last_refill_ms).max(0);
    let added = if refill_period_ms > 0 {
        ((elapsed as i128 * refill_amount_milli as i128) / refill_period_ms as i128) as i64
    } else {
        0
    };
    RefillResult {
        new_tokens_milli: (tokens_milli.saturating_add(added)).min(burst_milli),
        new_last_refill_ms: now_ms.max(last_refill_ms),
    }
}

/// Refill a [`BucketState`] in place, returning the refill result.
pub fn refill_state(state: &BucketState, now_ms: i64) -> RefillResult {
    refill_bucket(
        state.tokens_milli,
        state.last_refill_ms,
        now_ms,
        state.burst_milli,
        state.refill_amount_milli,
        state.refill_period_ms,
    )
}

/// Seconds of refill needed to cover a deficit.
pub fn calculate_retry_after(
    deficit_milli: i64,
    refill_amount_milli: i64,
    refill_period_ms: i64,
) -> f64 {
    if deficit_milli <= 0 || refill_amount_milli <= 0 || refill_period_ms <= 0 {
        return 0.0;
    }
    // refill rate in millitokens per second
    let rate = refill_amount_milli as f64 / (refill_period_ms as f64 / 1000.0);
    deficit_milli as f64 / rate
}

/// Refill, then consume `requested_tokens` if the balance covers them.
///
/// On failure the balance is unchanged (beyond the refill) and
/// `retry_after_seconds` reports how long refill alone needs to cover the
/// deficit.
pub fn try_consume(state: &BucketState, requested_tokens: i64, now_ms: i64) -> ConsumeResult {
    let refill = refill_state(state, now_ms);
    let requested_milli = requested_tokens * MILLI;
    let available = refill.new_tokens_milli.div_euclid(MILLI);

    if refill.new_tokens_milli >= requested_milli {
        ConsumeResult {
            success: true,
            new_tokens_milli: refill.new_tokens_milli - requested_milli,
            new_last_refill_ms: refill.new_last_refill_ms,
            available,
            retry_after_seconds: 0.0,
        }
    } else {
        let deficit = requested_milli - refill.new_tokens_milli;
        ConsumeResult {
            success: false,
            new_tokens_milli: refill.new_tokens_milli,
            new_last_refill_ms: refill.new_last_refill_ms,
            available,
            retry_after_seconds: calculate_retry_after(
                deficit,
                state.refill_amount_milli,
                state.refill_period_ms,
            ),
        }
    }
}

/// Refill, then subtract `delta_tokens` unchecked. The balance may go
/// negative; a negative delta returns tokens (the next refill caps the
/// balance at burst). Used by lease adjustment and compensation. Never
/// waits.
pub fn force_consume(state: &BucketState, delta_tokens: i64, now_ms: i64) -> (i64, i64) {
    let refill = refill_state(state, now_ms);
    (
        refill.new_tokens_milli - delta_tokens * MILLI,
        refill.new_last_refill_ms,
    )
}

/// Project the whole tokens available at `now_ms` without mutating anything.
pub fn calculate_available(state: &BucketState, now_ms: i64) -> i64 {
    refill_state(state, now_ms).new_tokens_milli.div_euclid(MILLI)
}

/// Preview whether a request would succeed at the current wall clock, given
/// possibly stale in-memory states.
///
/// Used on the acquire retry path: after a conditional-check failure the
/// snapshot is slightly stale, and this decides between another round trip
/// and a definitive rejection. Limits absent from `consume` are skipped and
/// produce no status.
pub fn would_refill_satisfy(
    states: &[BucketState],
    consume: &ConsumeMap,
    now_ms: i64,
) -> (bool, Vec<LimitStatus>) {
    let mut statuses = Vec::new();
    let mut would_help = true;

    for state in states {
        let Some(&requested) = consume.get(&state.limit_name) else {
            continue;
        };
        let result = try_consume(state, requested, now_ms);
        if !result.success {
            would_help = false;
        }
        statuses.push(LimitStatus {
            entity_id: state.entity_id.clone(),
            resource: state.resource.clone(),
            limit: state.limit(),
            requested,
            available: result.available,
            exceeded: !result.success,
            retry_after_seconds: result.retry_after_seconds,
        });
    }

    (would_help, statuses)
}
