//! Engram resilience layer
//!
//! Tracks dependency health and decides how degraded the service is:
//! - FULL: all systems operational
//! - PARTIAL: some non-critical dependency degraded
//! - MINIMAL: core dependency degraded, serving from cache
//! - OFFLINE: cannot serve useful context
//!
//! Also provides per-dependency circuit breakers and the last-known-good
//! master-context cache.

pub mod circuit_breaker;
pub mod degradation;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use degradation::{
    CacheInfo, CacheSource, DegradationLevel, DegradationManager, DegradationStatus,
    DependencyHealth, DEP_CONTEXT_STORE, DEP_MODEL, DEP_VECTOR_STORE,
};
