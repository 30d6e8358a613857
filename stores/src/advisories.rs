//! Nudge and anomaly persistence.
//!
//! Both kinds live in a single JSON document each, expire after a TTL,
//! dedupe on near-identical messages, and cap the active set with
//! priority/severity eviction.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use engram_model_client::{AnomalyDraft, NudgeDraft};

pub const MAX_ACTIVE_NUDGES: usize = 20;
pub const MAX_ACTIVE_ANOMALIES: usize = 30;
const NUDGE_TTL_DAYS: i64 = 7;
const ANOMALY_TTL_DAYS: i64 = 14;

/// Token-overlap ratio above which two messages count as duplicates.
const DUPLICATE_OVERLAP: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNudge {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: String,
    pub created_at: String,
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub dismissed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAnomaly {
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    #[serde(default)]
    pub evidence: String,
    pub created_at: String,
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub dismissed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryStats {
    pub total: usize,
    pub active: usize,
    pub dismissed: usize,
    pub by_type: serde_json::Value,
}

fn is_expired(expires_at: &str, now: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(expires_at)
        .map(|t| t.with_timezone(&Utc) < now)
        .unwrap_or(false)
}

/// Duplicate when the messages match case-insensitively or share at
/// least 80% of their tokens.
fn is_duplicate(existing: &[&str], candidate: &str) -> bool {
    let new_lower = candidate.to_lowercase();
    let new_lower = new_lower.trim();
    let new_words: std::collections::HashSet<&str> = new_lower.split_whitespace().collect();
    for message in existing {
        let old_lower = message.to_lowercase();
        let old_lower = old_lower.trim();
        if new_lower == old_lower {
            return true;
        }
        let old_words: std::collections::HashSet<&str> = old_lower.split_whitespace().collect();
        if new_words.is_empty() || old_words.is_empty() {
            continue;
        }
        let overlap = new_words.intersection(&old_words).count() as f64
            / new_words.len().max(old_words.len()) as f64;
        if overlap >= DUPLICATE_OVERLAP {
            return true;
        }
    }
    false
}

fn priority_rank(priority: &str) -> u8 {
    match priority {
        "high" => 0,
        "medium" => 1,
        "low" => 2,
        _ => 1,
    }
}

fn severity_rank(severity: &str) -> u8 {
    match severity {
        "critical" => 0,
        "high" => 1,
        "medium" => 2,
        "low" => 3,
        _ => 2,
    }
}

fn load_list<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Vec<T> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

fn save_list<T: Serialize>(path: &PathBuf, items: &[T]) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_string_pretty(items) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(path, raw) {
                warn!("advisories: write to {} failed: {e}", path.display());
            }
        }
        Err(e) => warn!("advisories: serialize failed: {e}"),
    }
}

#[derive(Debug, Clone)]
pub struct NudgeStore {
    path: PathBuf,
}

impl NudgeStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store freshly generated nudges. Returns how many survived dedup.
    pub fn store(&self, drafts: &[NudgeDraft], session_id: Option<&str>) -> usize {
        let now = Utc::now();
        let mut active: Vec<StoredNudge> = load_list::<StoredNudge>(&self.path)
            .into_iter()
            .filter(|n| !is_expired(&n.expires_at, now))
            .collect();

        let mut added = 0;
        for draft in drafts {
            let existing: Vec<&str> = active.iter().map(|n| n.message.as_str()).collect();
            if draft.message.is_empty() || is_duplicate(&existing, &draft.message) {
                continue;
            }
            let ttl = draft.expires_after_days.unwrap_or(NUDGE_TTL_DAYS);
            active.push(StoredNudge {
                message: draft.message.clone(),
                kind: draft.kind.clone(),
                priority: draft.priority.clone(),
                created_at: now.to_rfc3339(),
                expires_at: (now + Duration::days(ttl)).to_rfc3339(),
                session_id: session_id.map(str::to_string),
                dismissed: false,
            });
            added += 1;
        }

        active.sort_by_key(|n| priority_rank(&n.priority));
        active.truncate(MAX_ACTIVE_NUDGES);
        save_list(&self.path, &active);
        info!("nudges: stored {added} new, {} total active", active.len());
        added
    }

    /// Active = not dismissed, not expired.
    pub fn get_active(&self, limit: usize) -> Vec<StoredNudge> {
        let now = Utc::now();
        load_list::<StoredNudge>(&self.path)
            .into_iter()
            .filter(|n| !n.dismissed && !is_expired(&n.expires_at, now))
            .take(limit)
            .collect()
    }

    pub fn active_messages(&self, limit: usize) -> Vec<String> {
        self.get_active(limit).into_iter().map(|n| n.message).collect()
    }

    /// Dismiss every nudge whose message contains the substring
    /// (case-insensitive). Returns whether anything matched.
    pub fn dismiss(&self, substring: &str) -> bool {
        let needle = substring.to_lowercase();
        let mut nudges = load_list::<StoredNudge>(&self.path);
        let mut found = false;
        for nudge in &mut nudges {
            if nudge.message.to_lowercase().contains(&needle) {
                nudge.dismissed = true;
                found = true;
            }
        }
        if found {
            save_list(&self.path, &nudges);
        }
        found
    }

    pub fn stats(&self) -> AdvisoryStats {
        let all = load_list::<StoredNudge>(&self.path);
        let now = Utc::now();
        let active: Vec<&StoredNudge> = all
            .iter()
            .filter(|n| !n.dismissed && !is_expired(&n.expires_at, now))
            .collect();
        let mut by_type = std::collections::BTreeMap::new();
        for nudge in &active {
            *by_type.entry(nudge.kind.clone()).or_insert(0u32) += 1;
        }
        AdvisoryStats {
            total: all.len(),
            active: active.len(),
            dismissed: all.iter().filter(|n| n.dismissed).count(),
            by_type: json!(by_type),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyStore {
    path: PathBuf,
}

impl AnomalyStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn store(&self, drafts: &[AnomalyDraft], session_id: Option<&str>) -> usize {
        let now = Utc::now();
        let mut active: Vec<StoredAnomaly> = load_list::<StoredAnomaly>(&self.path)
            .into_iter()
            .filter(|a| !a.dismissed && !is_expired(&a.expires_at, now))
            .collect();

        let mut added = 0;
        for draft in drafts {
            let existing: Vec<&str> = active.iter().map(|a| a.description.as_str()).collect();
            if draft.description.is_empty() || is_duplicate(&existing, &draft.description) {
                continue;
            }
            let ttl = draft.expires_after_days.unwrap_or(ANOMALY_TTL_DAYS);
            active.push(StoredAnomaly {
                description: draft.description.clone(),
                kind: draft.kind.clone(),
                severity: draft.severity.clone(),
                evidence: draft.evidence.clone(),
                created_at: now.to_rfc3339(),
                expires_at: (now + Duration::days(ttl)).to_rfc3339(),
                session_id: session_id.map(str::to_string),
                dismissed: false,
            });
            added += 1;
        }

        active.sort_by_key(|a| severity_rank(&a.severity));
        active.truncate(MAX_ACTIVE_ANOMALIES);
        save_list(&self.path, &active);
        info!("anomalies: stored {added} new, {} total active", active.len());
        added
    }

    pub fn get_active(&self) -> Vec<StoredAnomaly> {
        let now = Utc::now();
        load_list::<StoredAnomaly>(&self.path)
            .into_iter()
            .filter(|a| !a.dismissed && !is_expired(&a.expires_at, now))
            .collect()
    }

    pub fn dismiss(&self, substring: &str) -> bool {
        let needle = substring.to_lowercase();
        let mut anomalies = load_list::<StoredAnomaly>(&self.path);
        let mut found = false;
        for anomaly in &mut anomalies {
            if anomaly.description.to_lowercase().contains(&needle) {
                anomaly.dismissed = true;
                found = true;
            }
        }
        if found {
            save_list(&self.path, &anomalies);
        }
        found
    }

    pub fn stats(&self) -> AdvisoryStats {
        let all = load_list::<StoredAnomaly>(&self.path);
        let active = self.get_active();
        let mut by_type = std::collections::BTreeMap::new();
        for anomaly in &active {
            *by_type.entry(anomaly.kind.clone()).or_insert(0u32) += 1;
        }
        AdvisoryStats {
            total: all.len(),
            active: active.len(),
            dismissed: all.iter().filter(|a| a.dismissed).count(),
            by_type: json!(by_type),
        }
    }
}
