//! Session records on cold storage.
//!
//! One JSON file per session under the sessions directory. Ingest writes
//! them, the worker reads them and appends the `_processed` marker with
//! an atomic rewrite, retention deletes them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    Low,
    Medium,
    High,
}

impl Significance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Significance::Low => "low",
            Significance::Medium => "medium",
            Significance::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Significance::Low),
            "medium" => Some(Significance::Medium),
            "high" => Some(Significance::High),
            _ => None,
        }
    }
}

impl Default for Significance {
    fn default() -> Self {
        Significance::Medium
    }
}

/// Appended by the worker when the pipeline finishes a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMarker {
    pub timestamp: String,
    pub summary: String,
    pub triage_items: usize,
    pub master_updates: usize,
}

fn default_source() -> String {
    "mcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: String,
    pub summary: String,
    #[serde(default)]
    pub significance: Significance,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub project_states: BTreeMap<String, String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_via: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(
        rename = "_processed",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub processed: Option<ProcessedMarker>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now().to_rfc3339(),
            summary: summary.into(),
            significance: Significance::Medium,
            files_changed: Vec::new(),
            decisions: Vec::new(),
            failures: Vec::new(),
            project_states: BTreeMap::new(),
            next_steps: Vec::new(),
            tags: Vec::new(),
            source: default_source(),
            source_id: None,
            ingested_via: None,
            metadata: None,
            processed: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed.is_some()
    }
}

/// Format: `ce-{yyyymmdd}-{8 hex}`.
pub fn generate_session_id() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("ce-{date}-{}", &suffix[..8])
}

pub fn session_filename(session_id: &str) -> String {
    format!("{session_id}.json")
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file undecodable: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(session_filename(session_id))
    }

    pub fn write(&self, record: &SessionRecord) -> Result<PathBuf, SessionStoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.session_id);
        let raw = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, raw)?;
        Ok(path)
    }

    pub fn read(&self, path: &Path) -> Result<SessionRecord, SessionStoreError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path.file_name().unwrap_or_default())
        };
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Rewrite a session file with the processed marker attached. The
    /// rewrite goes through a temp file + rename so readers never observe
    /// a torn record.
    pub fn mark_processed(
        &self,
        path: &Path,
        marker: ProcessedMarker,
    ) -> Result<(), SessionStoreError> {
        let mut record = self.read(path)?;
        record.processed = Some(marker);
        let target = self.path_for(&record.session_id);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&record)?)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// All session files, unsorted.
    pub fn list(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect()
    }

    /// (total, processed, unprocessed) counts across the directory.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut total = 0;
        let mut processed = 0;
        for path in self.list() {
            total += 1;
            if let Ok(record) = self.read(&path) {
                if record.is_processed() {
                    processed += 1;
                }
            }
        }
        (total, processed, total - processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_shape() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "ce");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let mut record = SessionRecord::new("ce-20260101-aaaaaaaa", "rebooted pg");
        record.tags = vec!["db".into()];
        let path = store.write(&record).unwrap();

        let loaded = store.read(&path).unwrap();
        assert_eq!(loaded.session_id, "ce-20260101-aaaaaaaa");
        assert_eq!(loaded.source, "mcp");
        assert!(!loaded.is_processed());
    }

    #[test]
    fn mark_processed_appends_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let record = SessionRecord::new("ce-20260101-bbbbbbbb", "work");
        let path = store.write(&record).unwrap();

        store
            .mark_processed(
                &path,
                ProcessedMarker {
                    timestamp: Utc::now().to_rfc3339(),
                    summary: "compressed".into(),
                    triage_items: 3,
                    master_updates: 1,
                },
            )
            .unwrap();

        let loaded = store.read(&path).unwrap();
        assert!(loaded.is_processed());
        assert_eq!(loaded.processed.unwrap().triage_items, 3);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"_processed\""));
    }

    #[test]
    fn counts_distinguish_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        store.write(&SessionRecord::new("ce-20260101-00000001", "a")).unwrap();
        let mut done = SessionRecord::new("ce-20260101-00000002", "b");
        done.processed = Some(ProcessedMarker {
            timestamp: Utc::now().to_rfc3339(),
            summary: "done".into(),
            triage_items: 0,
            master_updates: 0,
        });
        store.write(&done).unwrap();

        assert_eq!(store.counts(), (2, 1, 1));
    }
}
