//! Transcript storage with length-based deduplication.
//!
//! One gzip file per session id, keyed `{session_id}_{yyyymmdd_hhmmss}.txt.gz`.
//! A new transcript replaces the stored one only when its uncompressed
//! length strictly exceeds it (the conversation continued); anything
//! shorter or equal is a no-op.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{info, warn};

/// Marker inserted when the middle of an oversized transcript is cut.
const TRUNCATION_MARKER: &str = "\n\n[...TRUNCATED FOR SUMMARIZATION...]\n\n";

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptWrite {
    pub stored: bool,
    pub path: PathBuf,
    pub size_kb: f64,
    pub action: &'static str,
    pub chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptInfo {
    pub session_id: String,
    pub filename: String,
    pub size_kb: f64,
    pub modified: String,
}

#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn existing_for(&self, session_id: &str) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let prefix = format!("{session_id}_");
        let mut matches: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".txt.gz"))
                    .unwrap_or(false)
            })
            .collect();
        matches.sort();
        matches.pop()
    }

    fn uncompressed_len(path: &Path) -> usize {
        let Ok(file) = std::fs::File::open(path) else {
            return 0;
        };
        let mut decoder = GzDecoder::new(file);
        let mut content = String::new();
        decoder.read_to_string(&mut content).map(|_| content.len()).unwrap_or(0)
    }

    /// Store a transcript, replacing a shorter predecessor or skipping a
    /// redundant write.
    pub fn store(&self, session_id: &str, transcript: &str) -> std::io::Result<TranscriptWrite> {
        std::fs::create_dir_all(&self.dir)?;
        let new_len = transcript.len();
        let existing = self.existing_for(session_id);

        if let Some(existing_path) = &existing {
            let old_len = Self::uncompressed_len(existing_path);
            if new_len <= old_len {
                let size_kb = existing_path
                    .metadata()
                    .map(|m| (m.len() as f64 / 1024.0 * 10.0).round() / 10.0)
                    .unwrap_or(0.0);
                info!(
                    "transcript dedup: skipping {session_id} (existing={old_len} chars, new={new_len} chars)"
                );
                return Ok(TranscriptWrite {
                    stored: false,
                    path: existing_path.clone(),
                    size_kb,
                    action: "skipped",
                    chars: old_len,
                });
            }
            info!(
                "transcript dedup: updating {session_id} (existing={old_len} chars -> new={new_len} chars)"
            );
            std::fs::remove_file(existing_path)?;
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("{session_id}_{stamp}.txt.gz"));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
        encoder.write_all(transcript.as_bytes())?;
        let compressed = encoder.finish()?;
        std::fs::write(&path, &compressed)?;

        let size_kb = (compressed.len() as f64 / 1024.0 * 10.0).round() / 10.0;
        let action = if existing.is_some() { "updated" } else { "created" };
        info!("transcript {action}: {} ({new_len} chars -> {size_kb} KB compressed)", path.display());

        Ok(TranscriptWrite {
            stored: true,
            path,
            size_kb,
            action,
            chars: new_len,
        })
    }

    pub fn get(&self, session_id: &str) -> Option<String> {
        let path = self.existing_for(session_id)?;
        let file = std::fs::File::open(&path).ok()?;
        let mut decoder = GzDecoder::new(file);
        let mut content = String::new();
        match decoder.read_to_string(&mut content) {
            Ok(_) => Some(content),
            Err(e) => {
                warn!("transcript: failed to read {}: {e}", path.display());
                None
            }
        }
    }

    /// Stored transcripts, most recent first.
    pub fn list(&self, limit: usize) -> Vec<TranscriptInfo> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".txt.gz"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files.reverse();

        files
            .into_iter()
            .take(limit)
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                // {session_id}_{yyyymmdd}_{hhmmss}.txt.gz
                let stem = name.trim_end_matches(".txt.gz");
                let session_id = match stem.rsplitn(3, '_').nth(2) {
                    Some(id) => id.to_string(),
                    None => stem.to_string(),
                };
                let meta = path.metadata().ok()?;
                let modified: chrono::DateTime<Utc> = meta.modified().ok()?.into();
                Some(TranscriptInfo {
                    session_id,
                    filename: name,
                    size_kb: (meta.len() as f64 / 1024.0 * 10.0).round() / 10.0,
                    modified: modified.to_rfc3339(),
                })
            })
            .collect()
    }
}

/// Middle-out truncation for model consumption: keep the head and tail,
/// drop the middle behind a marker. Character-boundary safe.
pub fn truncate_for_model(transcript: &str, max_chars: usize) -> String {
    if transcript.chars().count() <= max_chars {
        return transcript.to_string();
    }
    let half = max_chars / 2;
    let head: String = transcript.chars().take(half).collect();
    let total = transcript.chars().count();
    let tail: String = transcript.chars().skip(total - half).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TranscriptStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[test]
    fn first_store_creates() {
        let (_guard, store) = store();
        let result = store.store("ce-20260101-aaaaaaaa", "hello transcript").unwrap();
        assert!(result.stored);
        assert_eq!(result.action, "created");
        assert_eq!(result.chars, "hello transcript".len());
        assert_eq!(store.get("ce-20260101-aaaaaaaa").unwrap(), "hello transcript");
    }

    #[test]
    fn identical_store_is_skipped() {
        let (_guard, store) = store();
        store.store("s1", "same content").unwrap();
        let second = store.store("s1", "same content").unwrap();
        assert!(!second.stored);
        assert_eq!(second.action, "skipped");
    }

    #[test]
    fn shorter_store_is_skipped() {
        let (_guard, store) = store();
        store.store("s1", "a longer transcript body").unwrap();
        let result = store.store("s1", "short").unwrap();
        assert_eq!(result.action, "skipped");
        assert_eq!(store.get("s1").unwrap(), "a longer transcript body");
    }

    #[test]
    fn longer_store_replaces_and_keeps_one_file() {
        let (_guard, store) = store();
        store.store("s1", "short").unwrap();
        let result = store.store("s1", "a much longer continued conversation").unwrap();
        assert!(result.stored);
        assert_eq!(result.action, "updated");
        assert_eq!(store.get("s1").unwrap(), "a much longer continued conversation");
        assert_eq!(store.list(10).len(), 1);
    }

    #[test]
    fn list_parses_session_ids() {
        let (_guard, store) = store();
        store.store("ce-20260101-aaaaaaaa", "one transcript").unwrap();
        let listed = store.list(10);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "ce-20260101-aaaaaaaa");
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let text = "a".repeat(600) + "b".repeat(600).as_str();
        let truncated = truncate_for_model(&text, 200);
        assert!(truncated.starts_with(&"a".repeat(100)));
        assert!(truncated.ends_with(&"b".repeat(100)));
        assert!(truncated.contains("TRUNCATED"));

        let short = "short text";
        assert_eq!(truncate_for_model(short, 200), short);
    }
}
