//! Chroma-compatible HTTP backend.
//!
//! Talks to the v1 REST API; collection names resolve to server-side ids
//! once and are cached. Embedding is computed by the server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::ArchiveError;
use crate::store::VectorStore;
use crate::types::{DocumentPage, Metadata, SearchHit, StoredDocument};

pub struct ChromaHttpStore {
    base_url: String,
    http: reqwest::Client,
    collection_ids: RwLock<HashMap<String, String>>,
}

impl ChromaHttpStore {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("http client");
        Self {
            base_url,
            http,
            collection_ids: RwLock::new(HashMap::new()),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<Value, ArchiveError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::Status(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ArchiveError::Decode(e.to_string()))
    }

    async fn collection_id(&self, name: &str) -> Result<String, ArchiveError> {
        if let Some(id) = self.collection_ids.read().await.get(name) {
            return Ok(id.clone());
        }
        let body = json!({"name": name, "get_or_create": true});
        let response = self
            .http
            .post(self.api("/collections"))
            .json(&body)
            .send()
            .await?;
        let value = Self::check(response).await?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ArchiveError::Decode("collection id missing".into()))?
            .to_string();
        self.collection_ids
            .write()
            .await
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn post_doc(
        &self,
        verb: &str,
        collection: &str,
        id: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<(), ArchiveError> {
        let cid = self.collection_id(collection).await?;
        let body = json!({
            "ids": [id],
            "documents": [content],
            "metadatas": [metadata],
        });
        let response = self
            .http
            .post(self.api(&format!("/collections/{cid}/{verb}")))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

fn nth_meta(value: &Value, outer: usize, inner: usize) -> Metadata {
    value
        .get("metadatas")
        .and_then(|m| m.get(outer))
        .and_then(|m| m.get(inner))
        .and_then(Value::as_object)
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default()
}

fn flat_meta(value: &Value, idx: usize) -> Metadata {
    value
        .get("metadatas")
        .and_then(|m| m.get(idx))
        .and_then(Value::as_object)
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default()
}

fn str_at(value: &Value, key: &str, outer: usize, inner: usize) -> String {
    value
        .get(key)
        .and_then(|v| v.get(outer))
        .and_then(|v| v.get(inner))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl VectorStore for ChromaHttpStore {
    async fn heartbeat(&self) -> Result<(), ArchiveError> {
        let response = self.http.get(self.api("/heartbeat")).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn ensure_collections(&self, names: &[&str]) -> Result<(), ArchiveError> {
        for name in names {
            self.collection_id(name).await?;
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
        self.post_doc("add", collection, id, content, metadata).await
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<(), ArchiveError> {
        self.post_doc("upsert", collection, id, content, metadata).await
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        n_results: usize,
        filter: Option<Value>,
    ) -> Result<Vec<SearchHit>, ArchiveError> {
        let cid = self.collection_id(collection).await?;
        let count = self.count(collection).await?.max(1);
        let mut body = json!({
            "query_texts": [text],
            "n_results": n_results.min(count),
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = filter {
            body["where"] = filter;
        }
        let response = self
            .http
            .post(self.api(&format!("/collections/{cid}/query")))
            .json(&body)
            .send()
            .await?;
        let value = Self::check(response).await?;

        let ids = value
            .get("ids")
            .and_then(|v| v.get(0))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut hits = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            hits.push(SearchHit {
                id: id.as_str().unwrap_or_default().to_string(),
                content: str_at(&value, "documents", 0, i),
                metadata: nth_meta(&value, 0, i),
                distance: value
                    .get("distances")
                    .and_then(|v| v.get(0))
                    .and_then(|v| v.get(i))
                    .and_then(Value::as_f64),
            });
        }
        Ok(hits)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, ArchiveError> {
        let cid = self.collection_id(collection).await?;
        let body = json!({
            "ids": [id],
            "include": ["documents", "metadatas"],
        });
        let response = self
            .http
            .post(self.api(&format!("/collections/{cid}/get")))
            .json(&body)
            .send()
            .await?;
        let value = Self::check(response).await?;
        let found = value
            .get("ids")
            .and_then(Value::as_array)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false);
        if !found {
            return Ok(None);
        }
        Ok(Some(StoredDocument {
            id: id.to_string(),
            content: value
                .get("documents")
                .and_then(|v| v.get(0))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            metadata: flat_meta(&value, 0),
        }))
    }

    async fn page(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<DocumentPage, ArchiveError> {
        let cid = self.collection_id(collection).await?;
        let body = json!({
            "limit": limit,
            "offset": offset,
            "include": ["documents", "metadatas"],
        });
        let response = self
            .http
            .post(self.api(&format!("/collections/{cid}/get")))
            .json(&body)
            .send()
            .await?;
        let value = Self::check(response).await?;
        let ids = value
            .get("ids")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let documents = ids
            .iter()
            .enumerate()
            .map(|(i, id)| StoredDocument {
                id: id.as_str().unwrap_or_default().to_string(),
                content: value
                    .get("documents")
                    .and_then(|v| v.get(i))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                metadata: flat_meta(&value, i),
            })
            .collect();
        Ok(DocumentPage { documents })
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), ArchiveError> {
        let cid = self.collection_id(collection).await?;
        let response = self
            .http
            .post(self.api(&format!("/collections/{cid}/delete")))
            .json(&json!({"ids": ids}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, ArchiveError> {
        let cid = self.collection_id(collection).await?;
        let response = self
            .http
            .get(self.api(&format!("/collections/{cid}/count")))
            .send()
            .await?;
        let value = Self::check(response).await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| ArchiveError::Decode("count not a number".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_response_fields_unpack() {
        let response = json!({
            "ids": [["doc-1", "doc-2"]],
            "documents": [["first body", "second body"]],
            "metadatas": [[{"session_id": "s1"}, {"session_id": "s2"}]],
            "distances": [[0.3, 1.1]],
        });
        assert_eq!(str_at(&response, "documents", 0, 1), "second body");
        let meta = nth_meta(&response, 0, 0);
        assert_eq!(meta.get("session_id"), Some(&json!("s1")));
    }

    #[test]
    fn get_response_metadata_is_flat() {
        let response = json!({
            "ids": ["doc-1"],
            "documents": ["body"],
            "metadatas": [{"corrected": "true"}],
        });
        let meta = flat_meta(&response, 0);
        assert_eq!(meta.get("corrected"), Some(&json!("true")));
        assert!(nth_meta(&response, 0, 0).is_empty());
    }

    #[test]
    fn missing_fields_degrade_to_defaults() {
        let response = json!({"ids": [["doc-1"]]});
        assert_eq!(str_at(&response, "documents", 0, 0), "");
        assert!(flat_meta(&response, 0).is_empty());
    }
}
