//! Backend seam for the vector archive.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ArchiveError;
use crate::types::{DocumentPage, Metadata, SearchHit, StoredDocument};

/// Raw document operations a vector database must provide. Metadata
/// passed in is already cleaned; embedding happens inside the backend.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn heartbeat(&self) -> Result<(), ArchiveError>;

    /// Create any collections that do not exist yet.
    async fn ensure_collections(&self, names: &[&str]) -> Result<(), ArchiveError>;

    async fn add(
        &self,
        collection: &str,
        id: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<(), ArchiveError>;

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<(), ArchiveError>;

    async fn query(
        &self,
        collection: &str,
        text: &str,
        n_results: usize,
        filter: Option<Value>,
    ) -> Result<Vec<SearchHit>, ArchiveError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, ArchiveError>;

    /// Paged scan in insertion order, documents + metadata included.
    async fn page(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<DocumentPage, ArchiveError>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), ArchiveError>;

    async fn count(&self, collection: &str) -> Result<usize, ArchiveError>;
}
