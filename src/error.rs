//! Crate-wide error taxonomy.
//!
//! Rate-limit violations are a domain outcome, not a fault: they carry the
//! full per-limit status and a retry-after. Infrastructure failures wrap the
//! underlying cause and are the only kind subject to the `on_unavailable`
//! policy. Optimistic-lock collisions are retried internally and only
//! surface as `Conflict` once the retry budget is exhausted.

use thiserror::Error;

use crate::models::LimitStatus;
use crate::store::StoreError;

/// Result type for limiter operations.
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Errors surfaced by the limiter, repository, registry, and provisioner.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Bad input: malformed name, reserved namespace, negative consume,
    /// unknown limit. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Entity already exists.
    #[error("Entity already exists: {0}")]
    EntityExists(String),

    /// Namespace id or name does not exist.
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Write lost an optimistic-concurrency race past the retry budget, or
    /// a uniqueness condition failed.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A limit was exceeded. Carries per-limit statuses and retry-after.
    #[error(transparent)]
    RateLimitExceeded(#[from] RateLimitExceeded),

    /// The store is unreachable, throttled past the retry budget, or timed
    /// out. Subject to the `on_unavailable` policy during acquire.
    #[error("Rate limiter unavailable: {message}")]
    Unavailable {
        /// Human-readable description of the failure.
        message: String,
        /// Underlying store error, when one exists.
        #[source]
        source: Option<StoreError>,
    },

    /// Client and deployed schema versions disagree.
    #[error(
        "Version mismatch: schema v{schema_version} requires client >= {min_client_version}, \
         this client is {client_version}"
    )]
    VersionMismatch {
        /// Schema version found in the table.
        schema_version: u32,
        /// Minimum client version the deployment allows.
        min_client_version: String,
        /// Version of this crate.
        client_version: String,
    },

    /// A lease was used after commit or rollback.
    #[error("Lease already {state}: no further operations are allowed")]
    LeaseClosed {
        /// Terminal state the lease reached.
        state: &'static str,
    },
}

impl SluiceError {
    /// Convenience constructor for infrastructure failures without a store
    /// cause.
    pub fn unavailable(message: impl Into<String>) -> Self {
        SluiceError::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Whether this error is an infrastructure failure (and therefore
    /// eligible for the `on_unavailable` policy).
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SluiceError::Unavailable { .. })
    }
}

impl From<StoreError> for SluiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed => SluiceError::Conflict("conditional check failed".into()),
            StoreError::TransactionCanceled(reasons) => {
                SluiceError::Conflict(format!("transaction canceled: {}", reasons.join("; ")))
            }
            StoreError::Validation(msg) => SluiceError::Validation(msg),
            err @ (StoreError::Unavailable(_) | StoreError::Throttled) => SluiceError::Unavailable {
                message: err.to_string(),
                source: Some(err),
            },
        }
    }
}

// ============================================================================
// RateLimitExceeded
// ============================================================================

/// A rate-limit violation, carrying the status of every evaluated limit.
///
/// `statuses` always contains at least one violation; passed limits are
/// included so callers can report the full picture.
#[derive(Debug, Clone)]
pub struct RateLimitExceeded {
    /// Status of every limit evaluated during the acquire.
    pub statuses: Vec<LimitStatus>,
}

impl RateLimitExceeded {
    /// Build from evaluated statuses. At least one must be a violation.
    pub fn new(statuses: Vec<LimitStatus>) -> Self {
        debug_assert!(
            statuses.iter().any(|s| s.exceeded),
            "RateLimitExceeded requires at least one violated status"
        );
        Self { statuses }
    }

    /// The violated limits.
    pub fn violations(&self) -> Vec<&LimitStatus> {
        self.statuses.iter().filter(|s| s.exceeded).collect()
    }

    /// The limits that passed.
    pub fn passed(&self) -> Vec<&LimitStatus> {
        self.statuses.iter().filter(|s| !s.exceeded).collect()
    }

    /// The most constraining violation (longest retry-after).
    pub fn primary(&self) -> Option<&LimitStatus> {
        self.statuses
            .iter()
            .filter(|s| s.exceeded)
            .max_by(|a, b| {
                a.retry_after_seconds
                    .partial_cmp(&b.retry_after_seconds)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Seconds until the most constraining violated limit would be satisfied
    /// by refill alone.
    pub fn retry_after_seconds(&self) -> f64 {
        self.primary().map(|s| s.retry_after_seconds).unwrap_or(0.0)
    }

    /// Retry-after in whole milliseconds.
    pub fn retry_after_ms(&self) -> i64 {
        (self.retry_after_seconds() * 1000.0).round() as i64
    }

    /// Value for an HTTP `Retry-After` header: seconds, rounded up.
    pub fn retry_after_header(&self) -> String {
        (self.retry_after_seconds().ceil() as i64).to_string()
    }

    /// Body of a 429 response.
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": "rate_limit_exceeded",
            "message": self.to_string(),
            "retry_after_seconds": self.retry_after_seconds(),
            "retry_after_ms": self.retry_after_ms(),
            "limits": self.statuses.iter().map(|s| s.as_json()).collect::<Vec<_>>(),
        })
    }
}

impl std::error::Error for RateLimitExceeded {}

impl std::fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .statuses
            .iter()
            .filter(|s| s.exceeded)
            .map(|s| format!("{} ({}/{} available)", s.limit.name, s.available, s.requested))
            .collect();
        write!(
            f,
            "Rate limit exceeded for {}: retry after {:.1}s",
            names.join(", "),
            self.retry_after_seconds()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Limit;

    fn status(name: &str, exceeded: bool, retry_after: f64) -> LimitStatus {
        LimitStatus {
            entity_id: "e1".into(),
            resource: "gpt-4".into(),
            limit: Limit::per_minute(name, 10),
            requested: 20,
            available: 10,
            exceeded,
            retry_after_seconds: retry_after,
        }
    }

    #[test]
    fn test_single_violation() {
        let exc = RateLimitExceeded::new(vec![status("rpm", true, 6.0)]);
        assert_eq!(exc.violations().len(), 1);
        assert_eq!(exc.passed().len(), 0);
        assert_eq!(exc.retry_after_seconds(), 6.0);
        assert_eq!(exc.retry_after_ms(), 6000);
    }

    #[test]
    fn test_primary_is_longest_retry() {
        let exc = RateLimitExceeded::new(vec![
            status("rpm", true, 6.0),
            status("tpm", true, 60.0),
            status("rpd", false, 0.0),
        ]);
        assert_eq!(exc.primary().unwrap().limit.name, "tpm");
        assert_eq!(exc.retry_after_seconds(), 60.0);
        assert_eq!(exc.passed().len(), 1);
    }

    #[test]
    fn test_retry_after_header_rounds_up() {
        let exc = RateLimitExceeded::new(vec![status("rpm", true, 5.2)]);
        assert_eq!(exc.retry_after_header(), "6");
    }

    #[test]
    fn test_as_json_structure() {
        let exc = RateLimitExceeded::new(vec![status("rpm", true, 6.0), status("tpm", false, 0.0)]);
        let body = exc.as_json();
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert!(body["retry_after_seconds"].as_f64().unwrap() > 0.0);
        assert_eq!(body["limits"].as_array().unwrap().len(), 2);
        assert_eq!(body["limits"][0]["exceeded"], true);
    }

    #[test]
    fn test_store_error_mapping() {
        let err: SluiceError = StoreError::ConditionFailed.into();
        assert!(matches!(err, SluiceError::Conflict(_)));

        let err: SluiceError = StoreError::Throttled.into();
        assert!(err.is_infrastructure());

        let err: SluiceError = StoreError::Validation("bad".into()).into();
        assert!(matches!(err, SluiceError::Validation(_)));
    }
}
