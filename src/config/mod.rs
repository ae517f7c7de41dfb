//! Configuration caching and resolution
//!
//! Every acquire asks two questions: "what limits apply to this
//! (entity, resource)?" and "what is the system-wide unavailability
//! policy?". The resolver answers them through a three-tier lookup
//! (entity config, resource default, system default, caller fallback)
//! backed by a process-local TTL cache with negative caching and per-key
//! singleflight.
//!
//! The cache is an explicit dependency of the limiter, never a hidden
//! singleton, so tests can construct and reset their own.

pub mod cache;
pub mod resolver;

pub use cache::{CacheStats, ConfigCache};
pub use resolver::ConfigResolver;
