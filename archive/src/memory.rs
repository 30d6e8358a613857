//! In-memory vector-store backend.
//!
//! Used by the test suites and by standalone deployments that run without
//! an external vector database. Search ranks by token overlap rather than
//! embeddings; the distance scale matches the HTTP backend (0 = identical,
//! 2 = unrelated) so relevance thresholds behave the same.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ArchiveError;
use crate::store::VectorStore;
use crate::types::{DocumentPage, Metadata, SearchHit, StoredDocument};

#[derive(Default)]
pub struct MemoryStore {
    // collection -> insertion-ordered documents
    collections: RwLock<BTreeMap<String, Vec<StoredDocument>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn distance(query: &HashSet<String>, doc: &str) -> f64 {
    let doc_tokens = tokens(doc);
    if query.is_empty() || doc_tokens.is_empty() {
        return 2.0;
    }
    let overlap = query.intersection(&doc_tokens).count() as f64;
    let union = query.union(&doc_tokens).count() as f64;
    2.0 * (1.0 - overlap / union)
}

fn matches_filter(metadata: &Metadata, filter: &Option<Value>) -> bool {
    let Some(Value::Object(conditions)) = filter else {
        return true;
    };
    conditions
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn heartbeat(&self) -> Result<(), ArchiveError> {
        Ok(())
    }

    async fn ensure_collections(&self, names: &[&str]) -> Result<(), ArchiveError> {
        let mut collections = self.collections.write().await;
        for name in names {
            collections.entry(name.to_string()).or_default();
        }
        Ok(())
    }

    async fn add(
        &self,
        collection: &str,
        id: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<(), ArchiveError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.iter().any(|d| d.id == id) {
            // Matches the HTTP backend: add on an existing id is rejected.
            return Err(ArchiveError::Status(422));
        }
        docs.push(StoredDocument {
            id: id.to_string(),
            content: content.to_string(),
            metadata,
        });
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<(), ArchiveError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if let Some(existing) = docs.iter_mut().find(|d| d.id == id) {
            existing.content = content.to_string();
            existing.metadata = metadata;
        } else {
            docs.push(StoredDocument {
                id: id.to_string(),
                content: content.to_string(),
                metadata,
            });
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        n_results: usize,
        filter: Option<Value>,
    ) -> Result<Vec<SearchHit>, ArchiveError> {
        let collections = self.collections.read().await;
        let docs = collections.get(collection).cloned().unwrap_or_default();
        let query_tokens = tokens(text);
        let mut hits: Vec<SearchHit> = docs
            .into_iter()
            .filter(|d| matches_filter(&d.metadata, &filter))
            .map(|d| {
                let dist = distance(&query_tokens, &d.content);
                SearchHit {
                    id: d.id,
                    content: d.content,
                    metadata: d.metadata,
                    distance: Some(dist),
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(n_results);
        Ok(hits)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, ArchiveError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned())
    }

    async fn page(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<DocumentPage, ArchiveError> {
        let collections = self.collections.read().await;
        let documents = collections
            .get(collection)
            .map(|docs| docs.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(DocumentPage { documents })
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), ArchiveError> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(collection) {
            docs.retain(|d| !ids.contains(&d.id));
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, ArchiveError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map(Vec::len).unwrap_or(0))
    }
}
