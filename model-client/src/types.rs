//! Parsed structured-output payloads.
//!
//! These mirror the tool schemas in `schemas.rs`. Enum-valued fields that
//! the model occasionally fumbles (advisory kinds, priorities) stay as
//! strings here and are normalized by the stores that persist them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageAction {
    Keep,
    Archive,
    Merge,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageItem {
    pub content: String,
    pub action: TriageAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub merge_target: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterUpdate {
    pub section: String,
    pub action: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    #[serde(default)]
    pub items: Vec<TriageItem>,
    #[serde(default)]
    pub master_context_updates: Vec<MasterUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub compressed_summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default = "default_significance")]
    pub significance_confirmed: String,
    #[serde(default)]
    pub projects_mentioned: Vec<String>,
}

fn default_significance() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterCompression {
    pub master_context_markdown: String,
    #[serde(default)]
    pub changes_made: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub significance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub relationships: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub pattern: String,
    #[serde(default)]
    pub frequency: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeDraft {
    pub message: String,
    #[serde(rename = "type", default = "default_nudge_kind")]
    pub kind: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub expires_after_days: Option<i64>,
}

fn default_nudge_kind() -> String {
    "reminder".to_string()
}

fn default_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyDraft {
    pub description: String,
    #[serde(rename = "type", default = "default_anomaly_kind")]
    pub kind: String,
    #[serde(default = "default_priority")]
    pub severity: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub expires_after_days: Option<i64>,
}

fn default_anomaly_kind() -> String {
    "inconsistency".to_string()
}

/// Slug used for entity document ids: lowercase, spaces to dashes.
pub fn entity_slug(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_item_parses_with_optional_fields_absent() {
        let item: TriageItem = serde_json::from_str(
            r#"{"content":"redis moved to 6380","action":"archive","reason":"infra detail"}"#,
        )
        .unwrap();
        assert_eq!(item.action, TriageAction::Archive);
        assert!(item.merge_target.is_none());
        assert!(item.collection.is_none());
    }

    #[test]
    fn nudge_defaults_apply() {
        let nudge: NudgeDraft = serde_json::from_str(r#"{"message":"check backups"}"#).unwrap();
        assert_eq!(nudge.kind, "reminder");
        assert_eq!(nudge.priority, "medium");
        assert!(nudge.expires_after_days.is_none());
    }

    #[test]
    fn entity_slug_normalizes() {
        assert_eq!(entity_slug("Billing Service"), "billing-service");
    }
}
