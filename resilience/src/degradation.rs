//! Graceful degradation manager.
//!
//! Central health ledger for the three external dependencies, the
//! per-dependency circuit breakers, and the in-memory last-known-good
//! master-context cache. The overall service level is derived on every
//! query, never stored.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::circuit_breaker::{BreakerState, CircuitBreaker};

pub const DEP_MODEL: &str = "openrouter";
pub const DEP_VECTOR_STORE: &str = "vector-store";
pub const DEP_CONTEXT_STORE: &str = "context-store";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    Full,
    Partial,
    Minimal,
    Offline,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "full",
            DegradationLevel::Partial => "partial",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Offline => "offline",
        }
    }
}

/// Where the cached master context came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Live,
    Local,
    Cache,
    Bootstrap,
    Startup,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub healthy: bool,
    pub error: Option<String>,
    pub circuit_breaker: &'static str,
    pub failure_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub available: bool,
    pub source: Option<CacheSource>,
    pub age_seconds: Option<f64>,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationStatus {
    pub level: DegradationLevel,
    pub dependencies: HashMap<String, DependencyHealth>,
    pub cache: CacheInfo,
}

#[derive(Debug)]
struct DepState {
    healthy: bool,
    last_check: Option<Instant>,
    error: Option<String>,
    breaker: CircuitBreaker,
}

#[derive(Debug)]
struct Inner {
    deps: HashMap<&'static str, DepState>,
    cache: Option<String>,
    cache_at: Option<Instant>,
    cache_source: Option<CacheSource>,
}

/// Content shorter than this is assumed to be a placeholder, not a real
/// master context, and is never cached.
const MIN_CACHEABLE_CHARS: usize = 50;

#[derive(Debug)]
pub struct DegradationManager {
    inner: Mutex<Inner>,
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DegradationManager {
    pub fn new() -> Self {
        let mut deps = HashMap::new();
        deps.insert(
            DEP_MODEL,
            DepState {
                healthy: true,
                last_check: None,
                error: None,
                breaker: CircuitBreaker::new(DEP_MODEL, 3, Duration::from_secs(120)),
            },
        );
        deps.insert(
            DEP_VECTOR_STORE,
            DepState {
                healthy: true,
                last_check: None,
                error: None,
                breaker: CircuitBreaker::new(DEP_VECTOR_STORE, 5, Duration::from_secs(60)),
            },
        );
        deps.insert(
            DEP_CONTEXT_STORE,
            DepState {
                healthy: true,
                last_check: None,
                error: None,
                breaker: CircuitBreaker::new(DEP_CONTEXT_STORE, 3, Duration::from_secs(30)),
            },
        );
        Self {
            inner: Mutex::new(Inner {
                deps,
                cache: None,
                cache_at: None,
                cache_source: None,
            }),
        }
    }

    /// Test constructor with custom breaker parameters.
    pub fn with_breaker(dep: &'static str, threshold: u32, recovery: Duration) -> Self {
        let manager = Self::new();
        {
            let mut inner = manager.inner.lock().unwrap();
            if let Some(state) = inner.deps.get_mut(dep) {
                state.breaker = CircuitBreaker::new(dep, threshold, recovery);
            }
        }
        manager
    }

    // --- Dependency health ---

    pub fn mark_healthy(&self, dep: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.deps.get_mut(dep) {
            state.healthy = true;
            state.last_check = Some(Instant::now());
            state.error = None;
            state.breaker.record_success();
        }
    }

    pub fn mark_unhealthy(&self, dep: &str, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.deps.get_mut(dep) {
            if state.healthy {
                warn!("degradation: {dep} became unhealthy: {error}");
            }
            state.healthy = false;
            state.last_check = Some(Instant::now());
            state.error = Some(error.to_string());
            state.breaker.record_failure();
        }
    }

    /// Circuit-breaker gate consulted before every outbound call.
    pub fn can_call(&self, dep: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.deps.get_mut(dep) {
            Some(state) => state.breaker.can_proceed(),
            None => true,
        }
    }

    pub fn breaker_state(&self, dep: &str) -> Option<BreakerState> {
        let inner = self.inner.lock().unwrap();
        inner.deps.get(dep).map(|s| s.breaker.state())
    }

    fn is_healthy(inner: &Inner, dep: &str) -> bool {
        inner.deps.get(dep).map(|s| s.healthy).unwrap_or(true)
    }

    // --- Master-context cache ---

    pub fn update_cache(&self, content: &str, source: CacheSource) {
        if content.len() <= MIN_CACHEABLE_CHARS {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.cache = Some(content.to_string());
        inner.cache_at = Some(Instant::now());
        inner.cache_source = Some(source);
    }

    pub fn cached_context(&self) -> Option<String> {
        self.inner.lock().unwrap().cache.clone()
    }

    pub fn cache_age_seconds(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        inner.cache_at.map(|t| t.elapsed().as_secs_f64())
    }

    // --- Overall level ---

    /// Derive the current service level from dependency health and cache
    /// presence.
    pub fn level(&self) -> DegradationLevel {
        let inner = self.inner.lock().unwrap();
        let ctx_ok = Self::is_healthy(&inner, DEP_CONTEXT_STORE);
        let vec_ok = Self::is_healthy(&inner, DEP_VECTOR_STORE);
        let model_ok = Self::is_healthy(&inner, DEP_MODEL);
        let cache_present = inner.cache.is_some();

        if ctx_ok {
            if vec_ok && model_ok {
                DegradationLevel::Full
            } else {
                DegradationLevel::Partial
            }
        } else if cache_present {
            if vec_ok {
                DegradationLevel::Partial
            } else {
                DegradationLevel::Minimal
            }
        } else if vec_ok {
            DegradationLevel::Minimal
        } else {
            DegradationLevel::Offline
        }
    }

    pub fn status(&self) -> DegradationStatus {
        let level = self.level();
        let inner = self.inner.lock().unwrap();
        let dependencies = inner
            .deps
            .iter()
            .map(|(name, state)| {
                (
                    name.to_string(),
                    DependencyHealth {
                        healthy: state.healthy,
                        error: state.error.clone(),
                        circuit_breaker: state.breaker.state().as_str(),
                        failure_count: state.breaker.failure_count(),
                    },
                )
            })
            .collect();
        let cache = CacheInfo {
            available: inner.cache.is_some(),
            source: inner.cache_source,
            age_seconds: inner.cache_at.map(|t| t.elapsed().as_secs_f64()),
            size_bytes: inner.cache.as_ref().map(|c| c.len()).unwrap_or(0),
        };
        DegradationStatus {
            level,
            dependencies,
            cache,
        }
    }
}
