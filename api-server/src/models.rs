//! Request and response bodies for the HTTP surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionScope {
    Hot,
    Archive,
    Both,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoadRequest {
    pub topic: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ArchiveHit {
    pub collection: String,
    pub content: String,
    pub metadata: Value,
    pub relevance: f64,
}

#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub session_id: String,
    pub master_context: String,
    pub archive_hits: Vec<ArchiveHit>,
    pub failure_warnings: Vec<String>,
    pub nudges: Vec<String>,
    pub conflicts: Vec<String>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    pub session_id: String,
    pub summary: String,
    pub significance: Option<String>,
    pub files_changed: Option<Vec<String>>,
    pub decisions: Option<Vec<String>>,
    pub failures: Option<Vec<String>>,
    pub project_states: Option<BTreeMap<String, String>>,
    pub next_steps: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub transcript_text: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub session_id: String,
    pub saved_at: String,
    pub session_file: String,
    pub worker_queued: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub session_id: String,
    pub note: String,
    pub significance: Option<String>,
    pub transcript_path: Option<String>,
    pub transcript_text: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct CheckpointResponse {
    pub session_id: String,
    pub saved_at: String,
    pub session_file: String,
    pub transcript_stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_size_kb: Option<f64>,
    pub worker_queued: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub collections: Option<Vec<String>>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    pub date_after: Option<String>,
    pub date_before: Option<String>,
    pub tags: Option<Vec<String>>,
}

pub fn default_search_limit() -> usize {
    5
}

#[derive(Debug, Deserialize)]
pub struct SearchQueryParams {
    pub query: String,
    pub collections: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub collection: String,
    pub id: String,
    pub content: String,
    pub metadata: Value,
    pub distance: Option<f64>,
    pub relevance: f64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub total_results: usize,
    pub collections_searched: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CorrectRequest {
    pub item: String,
    pub correction: String,
    #[serde(default = "default_scope")]
    pub scope: CorrectionScope,
}

fn default_scope() -> CorrectionScope {
    CorrectionScope::Both
}

#[derive(Debug, Serialize)]
pub struct CorrectResponse {
    pub item: String,
    pub correction: String,
    pub hot_updated: bool,
    pub archive_updated: bool,
    pub records_affected: usize,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct IngestPayload {
    pub summary: String,
    #[serde(default = "default_ingest_source")]
    pub source: String,
    pub source_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_ingest_significance")]
    pub significance: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RawIngestPayload {
    pub text: String,
    #[serde(default = "default_ingest_source")]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_raw_significance")]
    pub significance: String,
}

fn default_ingest_source() -> String {
    "webhook".to_string()
}

fn default_ingest_significance() -> String {
    "medium".to_string()
}

fn default_raw_significance() -> String {
    "low".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DismissRequest {
    #[serde(alias = "description")]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub backup_name: String,
    pub components: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetentionRunRequest {
    pub overrides: Option<BTreeMap<String, u32>>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub vector_store_connected: bool,
    pub context_accessible: bool,
    pub sessions_count: usize,
    pub uptime_seconds: f64,
    pub learning_mode: bool,
    pub degradation_level: String,
}
