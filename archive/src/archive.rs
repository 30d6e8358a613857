//! Domain operations over the raw vector store.

use std::sync::Arc;

use chrono::Utc;
use engram_resilience::{DegradationManager, DEP_VECTOR_STORE};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::ArchiveError;
use crate::store::VectorStore;
use crate::types::{clean_metadata, Metadata, SearchHit, StoredDocument};

/// All collection names, in registry order.
pub const COLLECTION_NAMES: [&str; 8] = [
    "project_archive",
    "decisions",
    "failures",
    "entities",
    "sessions",
    "patterns",
    "snapshots",
    "anomalies",
];

pub struct Archive {
    store: Arc<dyn VectorStore>,
    degradation: Arc<DegradationManager>,
}

impl Archive {
    pub fn new(store: Arc<dyn VectorStore>, degradation: Arc<DegradationManager>) -> Self {
        Self { store, degradation }
    }

    pub fn backend(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    fn observe<T>(&self, result: Result<T, ArchiveError>) -> Result<T, ArchiveError> {
        match &result {
            Ok(_) => self.degradation.mark_healthy(DEP_VECTOR_STORE),
            Err(e) => self.degradation.mark_unhealthy(DEP_VECTOR_STORE, &e.to_string()),
        }
        result
    }

    pub async fn is_connected(&self) -> bool {
        self.store.heartbeat().await.is_ok()
    }

    pub async fn ensure_collections(&self) -> Result<(), ArchiveError> {
        let result = self.store.ensure_collections(&COLLECTION_NAMES).await;
        self.observe(result)
    }

    /// Insert a new document, stamping `created_at`.
    pub async fn add_document(
        &self,
        collection: &str,
        id: &str,
        content: &str,
        mut metadata: Metadata,
    ) -> Result<(), ArchiveError> {
        metadata.insert("created_at".into(), json!(Utc::now().to_rfc3339()));
        let metadata = clean_metadata(metadata);
        let result = self.store.add(collection, id, content, metadata).await;
        if let Err(e) = &result {
            error!("archive: add to '{collection}' failed: {e}");
        }
        self.observe(result)
    }

    /// Insert or replace, stamping `updated_at`.
    pub async fn upsert_document(
        &self,
        collection: &str,
        id: &str,
        content: &str,
        mut metadata: Metadata,
    ) -> Result<(), ArchiveError> {
        metadata.insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
        let metadata = clean_metadata(metadata);
        let result = self.store.upsert(collection, id, content, metadata).await;
        if let Err(e) = &result {
            error!("archive: upsert in '{collection}' failed: {e}");
        }
        self.observe(result)
    }

    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        n_results: usize,
        filter: Option<Value>,
    ) -> Result<Vec<SearchHit>, ArchiveError> {
        let result = self.store.query(collection, query, n_results, filter).await;
        self.observe(result)
    }

    pub async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, ArchiveError> {
        self.store.get(collection, id).await
    }

    /// Copy the current version of a document into `snapshots` before it
    /// is overwritten. Returns false when the source document does not
    /// exist (nothing to preserve).
    pub async fn take_snapshot(&self, collection: &str, doc_id: &str) -> Result<bool, ArchiveError> {
        let Some(existing) = self.store.get(collection, doc_id).await? else {
            return Ok(false);
        };
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let snapshot_id = format!("{collection}:{doc_id}:{stamp}");
        let mut metadata = existing.metadata;
        metadata.insert("source_collection".into(), json!(collection));
        metadata.insert("source_id".into(), json!(doc_id));
        metadata.insert("snapshot_at".into(), json!(Utc::now().to_rfc3339()));
        self.add_document("snapshots", &snapshot_id, &existing.content, metadata)
            .await?;
        info!("archive: snapshot {snapshot_id}");
        Ok(true)
    }

    /// Snapshot arbitrary content (not tied to an existing document),
    /// e.g. the master context before a write or a vetoed draft.
    pub async fn snapshot_content(
        &self,
        trigger: &str,
        content: &str,
        kind: &str,
    ) -> Result<(), ArchiveError> {
        let id = format!("snap-{trigger}-{}", Utc::now().timestamp());
        let metadata: Metadata = [
            ("session_id".to_string(), json!(trigger)),
            ("timestamp".to_string(), json!(Utc::now().to_rfc3339())),
            ("type".to_string(), json!(kind)),
        ]
        .into_iter()
        .collect();
        self.add_document("snapshots", &id, content, metadata).await
    }

    /// Most recent documents from a collection, ordered by metadata
    /// `created_at` descending. Reads up to `2n` and sorts client-side.
    pub async fn get_recent(
        &self,
        collection: &str,
        n: usize,
    ) -> Result<Vec<StoredDocument>, ArchiveError> {
        let page = self.store.page(collection, n * 2, 0).await?;
        let mut documents = page.documents;
        documents.sort_by(|a, b| {
            let ta = a.metadata.get("created_at").and_then(Value::as_str).unwrap_or("");
            let tb = b.metadata.get("created_at").and_then(Value::as_str).unwrap_or("");
            tb.cmp(ta)
        });
        documents.truncate(n);
        Ok(documents)
    }

    pub async fn get_recent_sessions(&self, n: usize) -> Vec<StoredDocument> {
        match self.get_recent("sessions", n).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!("archive: recent sessions unavailable: {e}");
                Vec::new()
            }
        }
    }

    pub async fn count(&self, collection: &str) -> Result<usize, ArchiveError> {
        self.store.count(collection).await
    }

    /// Document counts per collection; unreachable collections are
    /// reported as zero.
    pub async fn collection_stats(&self) -> std::collections::BTreeMap<String, usize> {
        let mut stats = std::collections::BTreeMap::new();
        for name in COLLECTION_NAMES {
            let count = self.count(name).await.unwrap_or(0);
            stats.insert(name.to_string(), count);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn archive() -> Archive {
        Archive::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DegradationManager::new()),
        )
    }

    #[tokio::test]
    async fn add_stamps_created_at() {
        let archive = archive();
        archive
            .add_document("decisions", "d1", "kept the queue", Metadata::new())
            .await
            .unwrap();
        let doc = archive.get("decisions", "d1").await.unwrap().unwrap();
        assert!(doc.metadata.contains_key("created_at"));
    }

    #[tokio::test]
    async fn snapshot_copies_existing_document() {
        let archive = archive();
        let meta: Metadata = [("session_id".to_string(), json!("s1"))].into_iter().collect();
        archive
            .add_document("decisions", "d1", "original text", meta)
            .await
            .unwrap();

        assert!(archive.take_snapshot("decisions", "d1").await.unwrap());

        let page = archive.backend().page("snapshots", 10, 0).await.unwrap();
        assert_eq!(page.documents.len(), 1);
        let snap = &page.documents[0];
        assert!(snap.id.starts_with("decisions:d1:"));
        assert_eq!(snap.content, "original text");
        assert_eq!(snap.metadata["source_collection"], json!("decisions"));
        assert_eq!(snap.metadata["source_id"], json!("d1"));
        assert!(snap.metadata.contains_key("snapshot_at"));
    }

    #[tokio::test]
    async fn snapshot_of_missing_document_is_noop() {
        let archive = archive();
        assert!(!archive.take_snapshot("decisions", "absent").await.unwrap());
        assert_eq!(archive.count("snapshots").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_sessions_sorted_by_created_at() {
        let archive = archive();
        for (id, ts) in [
            ("s-old", "2026-01-01T00:00:00Z"),
            ("s-new", "2026-03-01T00:00:00Z"),
            ("s-mid", "2026-02-01T00:00:00Z"),
        ] {
            let meta: Metadata = [("created_at".to_string(), json!(ts))].into_iter().collect();
            // Bypass add_document so the explicit timestamps survive.
            archive.backend().add("sessions", id, "work", meta).await.unwrap();
        }
        let recent = archive.get_recent_sessions(2).await;
        assert_eq!(recent[0].id, "s-new");
        assert_eq!(recent[1].id, "s-mid");
    }

    #[tokio::test]
    async fn search_failure_marks_vector_store_unhealthy() {
        struct FailingStore;
        #[async_trait::async_trait]
        impl VectorStore for FailingStore {
            async fn heartbeat(&self) -> Result<(), ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn ensure_collections(&self, _: &[&str]) -> Result<(), ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn add(&self, _: &str, _: &str, _: &str, _: Metadata) -> Result<(), ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn upsert(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: Metadata,
            ) -> Result<(), ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn query(
                &self,
                _: &str,
                _: &str,
                _: usize,
                _: Option<Value>,
            ) -> Result<Vec<SearchHit>, ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn get(&self, _: &str, _: &str) -> Result<Option<StoredDocument>, ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn page(
                &self,
                _: &str,
                _: usize,
                _: usize,
            ) -> Result<crate::types::DocumentPage, ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn delete(&self, _: &str, _: &[String]) -> Result<(), ArchiveError> {
                Err(ArchiveError::Status(500))
            }
            async fn count(&self, _: &str) -> Result<usize, ArchiveError> {
                Err(ArchiveError::Status(500))
            }
        }

        let dm = Arc::new(DegradationManager::new());
        let archive = Archive::new(Arc::new(FailingStore), dm.clone());
        assert!(archive.search("sessions", "anything", 5, None).await.is_err());
        let status = dm.status();
        assert!(!status.dependencies["vector-store"].healthy);
    }
}
