//! # SLUICE - Distributed Rate Limiting Engine
//!
//! A distributed, hierarchical, multi-limit token-bucket rate limiter
//! whose state lives exclusively in a single wide-row key-value store.
//! Stateless clients enforce multi-dimensional limits (requests-per-minute
//! AND tokens-per-minute) with cascading parent–child entities, without a
//! central coordinator and without holding locks across user work.
//!
//! ## Architecture
//!
//! - `schema`: Deterministic key and attribute naming
//! - `models`: Limits, bucket states, entities, clocks
//! - `bucket`: Pure millitoken refill/consume arithmetic
//! - `store`: Wide-row store contract, in-process backend, typed repository
//! - `config`: Three-tier limit resolution with negative caching
//! - `limiter`: The acquire-commit-adjust lease protocol
//! - `aggregator`: Stream-driven snapshots, proactive refill, sharding,
//!   audit archival
//! - `namespace`: Multi-tenant registry with soft delete and purge
//! - `provision`: Declarative YAML manifests with diff-based application
//! - `cli`: Admin command-line surface

#![warn(missing_docs)]
#![warn(clippy::all)]

// Key and attribute naming - foundational, no I/O
pub mod schema;

// Shared domain types
pub mod models;

// Error taxonomy
pub mod error;

// Token bucket arithmetic
pub mod bucket;

// Store contract, in-process backend, repository
pub mod store;

// Config cache and resolver
pub mod config;

// Limiter and lease protocol
pub mod limiter;

// Stream aggregation
pub mod aggregator;

// Namespace registry
pub mod namespace;

// Declarative provisioning
pub mod provision;

// Admin CLI
pub mod cli;

// Re-export commonly used types
pub use error::{RateLimitExceeded, Result, SluiceError};
pub use limiter::{AcquireRequest, Lease, LimiterConfig, RateLimiter};
pub use models::{
    BucketState, Clock, ConsumeMap, Entity, FailureMode, Limit, LimitStatus, ManualClock,
    SystemClock, Window,
};
pub use store::{MemoryStore, Repository, WideRowStore};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
