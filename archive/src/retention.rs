//! Age-based pruning across collections.
//!
//! Scans each collection in pages of at most 500 documents, collecting
//! ids whose metadata timestamp (`created_at`, `timestamp`, or
//! `updated_at`, first present wins) predates the cutoff, then deletes in
//! batches of at most 100. A retention of 0 days means never prune.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::archive::{Archive, COLLECTION_NAMES};
use crate::error::ArchiveError;
use crate::store::VectorStore;

const READ_BATCH: usize = 500;
const DELETE_BATCH: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub collection: String,
    pub checked: usize,
    pub pruned: usize,
    pub skipped: bool,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn doc_timestamp(metadata: &crate::types::Metadata) -> Option<&str> {
    for key in ["created_at", "timestamp", "updated_at"] {
        if let Some(ts) = metadata.get(key).and_then(Value::as_str) {
            if !ts.is_empty() {
                return Some(ts);
            }
        }
    }
    None
}

pub async fn prune_collection(
    archive: &Archive,
    collection: &str,
    max_age_days: u32,
    dry_run: bool,
) -> PruneReport {
    let mut report = PruneReport {
        collection: collection.to_string(),
        checked: 0,
        pruned: 0,
        skipped: max_age_days == 0,
        dry_run,
        error: None,
    };
    if max_age_days == 0 {
        return report;
    }

    let count = match archive.count(collection).await {
        Ok(count) => count,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };
    report.checked = count;
    if count == 0 {
        return report;
    }

    let cutoff = (Utc::now() - Duration::days(max_age_days as i64)).to_rfc3339();
    let mut to_delete: Vec<String> = Vec::new();
    let mut offset = 0;

    while offset < count {
        let page = match archive.backend().page(collection, READ_BATCH, offset).await {
            Ok(page) => page,
            Err(e) => {
                warn!("retention: error reading {collection} at offset {offset}: {e}");
                break;
            }
        };
        if page.documents.is_empty() {
            break;
        }
        offset += page.documents.len();
        for doc in page.documents {
            if let Some(ts) = doc_timestamp(&doc.metadata) {
                if ts < cutoff.as_str() {
                    to_delete.push(doc.id);
                }
            }
        }
    }

    report.pruned = to_delete.len();
    if dry_run || to_delete.is_empty() {
        return report;
    }

    for batch in to_delete.chunks(DELETE_BATCH) {
        if let Err(e) = delete_batch(archive, collection, batch).await {
            report.error = Some(e.to_string());
            break;
        }
    }
    info!(
        "retention: pruned {}/{} docs from {collection} (>{max_age_days} days)",
        report.pruned, report.checked
    );
    report
}

async fn delete_batch(
    archive: &Archive,
    collection: &str,
    ids: &[String],
) -> Result<(), ArchiveError> {
    archive.backend().delete(collection, &ids.to_vec()).await
}

/// Run retention across every collection. `days_for` resolves the
/// retention period per collection (settings overrides or registry
/// defaults).
pub async fn run_retention<F>(archive: &Archive, days_for: F, dry_run: bool) -> Vec<PruneReport>
where
    F: Fn(&str) -> u32,
{
    let mut reports = Vec::with_capacity(COLLECTION_NAMES.len());
    let mut total = 0;
    for name in COLLECTION_NAMES {
        let report = prune_collection(archive, name, days_for(name), dry_run).await;
        total += report.pruned;
        reports.push(report);
    }
    let action = if dry_run { "would prune" } else { "pruned" };
    info!("retention: {action} {total} total documents across {} collections", reports.len());
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::Metadata;
    use engram_resilience::DegradationManager;
    use serde_json::json;
    use std::sync::Arc;

    fn archive() -> Archive {
        Archive::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DegradationManager::new()),
        )
    }

    async fn seed(archive: &Archive, collection: &str, id: &str, ts: &str) {
        let meta: Metadata = [("created_at".to_string(), json!(ts))].into_iter().collect();
        archive.backend().add(collection, id, "doc", meta).await.unwrap();
    }

    #[tokio::test]
    async fn prunes_only_documents_past_cutoff() {
        let archive = archive();
        seed(&archive, "sessions", "ancient", "2020-01-01T00:00:00+00:00").await;
        let fresh = Utc::now().to_rfc3339();
        seed(&archive, "sessions", "fresh", &fresh).await;

        let report = prune_collection(&archive, "sessions", 180, false).await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.pruned, 1);
        assert_eq!(archive.count("sessions").await.unwrap(), 1);
        assert!(archive.get("sessions", "fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_days_skips_collection() {
        let archive = archive();
        seed(&archive, "entities", "e1", "2020-01-01T00:00:00+00:00").await;
        let report = prune_collection(&archive, "entities", 0, false).await;
        assert!(report.skipped);
        assert_eq!(archive.count("entities").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let archive = archive();
        seed(&archive, "snapshots", "old", "2020-01-01T00:00:00+00:00").await;
        let report = prune_collection(&archive, "snapshots", 30, true).await;
        assert_eq!(report.pruned, 1);
        assert_eq!(archive.count("snapshots").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn documents_without_timestamps_survive() {
        let archive = archive();
        archive
            .backend()
            .add("patterns", "p1", "doc", Metadata::new())
            .await
            .unwrap();
        let report = prune_collection(&archive, "patterns", 30, false).await;
        assert_eq!(report.pruned, 0);
        assert_eq!(archive.count("patterns").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_sweep_covers_all_collections() {
        let archive = archive();
        seed(&archive, "sessions", "old", "2020-01-01T00:00:00+00:00").await;
        seed(&archive, "entities", "keep", "2020-01-01T00:00:00+00:00").await;
        let reports =
            run_retention(&archive, engram_config::collections::retention_days, false).await;
        assert_eq!(reports.len(), 8);
        assert_eq!(archive.count("sessions").await.unwrap(), 0);
        // entities default to never-prune
        assert_eq!(archive.count("entities").await.unwrap(), 1);
    }
}
