//! Vector-store collection registry.
//!
//! Eight named collections back the archive tier. The triage model
//! occasionally invents collection names; `resolve_collection_name`
//! funnels those back onto the canonical set.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Static description of one archive collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Retention period in days. 0 = never prune.
    pub retention_days: u32,
}

pub const ALL_COLLECTIONS: [CollectionSpec; 8] = [
    CollectionSpec {
        name: "project_archive",
        description: "Completed/paused project context",
        retention_days: 365,
    },
    CollectionSpec {
        name: "decisions",
        description: "Decision rationale with outcomes",
        retention_days: 365,
    },
    CollectionSpec {
        name: "failures",
        description: "What broke, why, what worked instead",
        retention_days: 365,
    },
    CollectionSpec {
        name: "entities",
        description: "People, services, relationships",
        retention_days: 0,
    },
    CollectionSpec {
        name: "sessions",
        description: "Compressed session summaries",
        retention_days: 180,
    },
    CollectionSpec {
        name: "patterns",
        description: "Cross-session behavioral patterns",
        retention_days: 365,
    },
    CollectionSpec {
        name: "snapshots",
        description: "Pre-write copies for rollback",
        retention_days: 30,
    },
    CollectionSpec {
        name: "anomalies",
        description: "Detected context conflicts and regressions",
        retention_days: 180,
    },
];

/// Names the model tends to hallucinate, mapped to canonical collections.
pub static COLLECTION_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("session_history", "sessions"),
        ("session_summaries", "sessions"),
        ("projects", "project_archive"),
        ("project_history", "project_archive"),
        ("decision_log", "decisions"),
        ("failure_log", "failures"),
        ("error_log", "failures"),
        ("people", "entities"),
        ("services", "entities"),
        ("anomaly_log", "anomalies"),
        ("conflicts", "anomalies"),
    ])
});

pub fn is_known_collection(name: &str) -> bool {
    ALL_COLLECTIONS.iter().any(|c| c.name == name)
}

/// Resolve a (possibly hallucinated) collection name onto the canonical
/// set. Unknown names land in `project_archive`.
pub fn resolve_collection_name(name: &str) -> &'static str {
    if let Some(spec) = ALL_COLLECTIONS.iter().find(|c| c.name == name) {
        return spec.name;
    }
    if let Some(resolved) = COLLECTION_ALIASES.get(name) {
        return resolved;
    }
    "project_archive"
}

/// Default retention period for a collection, in days.
pub fn retention_days(name: &str) -> u32 {
    ALL_COLLECTIONS
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.retention_days)
        .unwrap_or(0)
}
