//! Backup creation, listing, restore, and object-store mirroring.
//!
//! A backup is a timestamped directory holding the master context, the
//! advisory files, and a JSON dump of each non-empty archive collection.
//! The last ten stay on local disk; when an S3-compatible store is
//! configured each backup is mirrored there as well.

use std::path::{Path, PathBuf};

use chrono::Utc;
use engram_archive::{Archive, VectorStore, COLLECTION_NAMES};
use engram_config::BackupStoreConfig;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::ContextStore;

const MAX_LOCAL_BACKUPS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub name: String,
    pub components: Vec<String>,
    pub total_size_bytes: u64,
    pub mirrored: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupListing {
    pub name: String,
    pub timestamp: String,
    pub size_bytes: u64,
    pub components: Vec<String>,
    pub location: String,
}

pub struct BackupManager {
    backups_dir: PathBuf,
    nudges_file: PathBuf,
    anomalies_file: PathBuf,
    sessions_dir: PathBuf,
    store: BackupStoreConfig,
}

impl BackupManager {
    pub fn new(
        backups_dir: PathBuf,
        nudges_file: PathBuf,
        anomalies_file: PathBuf,
        sessions_dir: PathBuf,
        store: BackupStoreConfig,
    ) -> Self {
        Self {
            backups_dir,
            nudges_file,
            anomalies_file,
            sessions_dir,
            store,
        }
    }

    fn bucket(&self) -> Option<Box<Bucket>> {
        if !self.store.enabled() {
            return None;
        }
        let endpoint = self.store.endpoint.clone()?;
        let endpoint = if endpoint.starts_with("http") {
            endpoint
        } else if self.store.secure {
            format!("https://{endpoint}")
        } else {
            format!("http://{endpoint}")
        };
        let region = Region::Custom {
            region: "us-east-1".to_string(),
            endpoint,
        };
        let credentials = Credentials::new(
            self.store.access_key.as_deref(),
            self.store.secret_key.as_deref(),
            None,
            None,
            None,
        )
        .ok()?;
        match Bucket::new(&self.store.bucket, region, credentials) {
            Ok(bucket) => Some(bucket.with_path_style()),
            Err(e) => {
                warn!("backup: object store unavailable: {e}");
                None
            }
        }
    }

    pub async fn create(
        &self,
        archive: &Archive,
        context: &ContextStore,
        include_sessions: bool,
    ) -> std::io::Result<BackupSummary> {
        let name = Utc::now().format("%Y-%m-%d_%H%M%S").to_string();
        let dir = self.backups_dir.join(&name);
        std::fs::create_dir_all(&dir)?;

        let mut components = Vec::new();
        let mut total_size: u64 = 0;

        if let Some(master) = context.read_master() {
            std::fs::write(dir.join("master-context.md"), &master)?;
            components.push("master_context".to_string());
            total_size += master.len() as u64;
        }

        for (source, label) in [
            (&self.nudges_file, "nudges"),
            (&self.anomalies_file, "anomalies"),
        ] {
            if source.exists() {
                let target = dir.join(source.file_name().unwrap_or_default());
                if std::fs::copy(source, &target).is_ok() {
                    components.push(label.to_string());
                    total_size += target.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        }

        let export = self.export_collections(archive).await;
        if let Value::Object(map) = &export {
            if !map.is_empty() {
                let raw = serde_json::to_string_pretty(&export).unwrap_or_default();
                total_size += raw.len() as u64;
                std::fs::write(dir.join("archive-export.json"), raw)?;
                components.push("archive".to_string());
            }
        }

        if include_sessions {
            let sessions_backup = dir.join("sessions");
            std::fs::create_dir_all(&sessions_backup)?;
            let mut copied = 0;
            if let Ok(entries) = std::fs::read_dir(&self.sessions_dir) {
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    if path.extension().map(|e| e == "json").unwrap_or(false) {
                        if let Some(file_name) = path.file_name() {
                            if std::fs::copy(&path, sessions_backup.join(file_name)).is_ok() {
                                copied += 1;
                                total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
                            }
                        }
                    }
                }
            }
            components.push(format!("sessions ({copied} files)"));
        }

        let metadata = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "name": name,
            "components": components,
            "total_size_bytes": total_size,
        });
        std::fs::write(
            dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata).unwrap_or_default(),
        )?;

        self.prune_local();
        let mirrored = self.mirror(&dir, &name).await;

        info!("backup: created {name} ({total_size} bytes, mirrored={mirrored})");
        Ok(BackupSummary {
            name,
            components,
            total_size_bytes: total_size,
            mirrored,
        })
    }

    async fn export_collections(&self, archive: &Archive) -> Value {
        let mut export = serde_json::Map::new();
        for name in COLLECTION_NAMES {
            if name == "snapshots" {
                continue;
            }
            let Ok(count) = archive.count(name).await else {
                continue;
            };
            if count == 0 {
                continue;
            }
            let mut documents = Vec::new();
            let mut offset = 0;
            while offset < count {
                match archive.backend().page(name, 500, offset).await {
                    Ok(page) if !page.documents.is_empty() => {
                        offset += page.documents.len();
                        documents.extend(page.documents);
                    }
                    _ => break,
                }
            }
            export.insert(
                name.to_string(),
                json!({"count": count, "documents": documents}),
            );
        }
        Value::Object(export)
    }

    fn prune_local(&self) {
        let Ok(entries) = std::fs::read_dir(&self.backups_dir) else {
            return;
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs.reverse();
        for old in dirs.into_iter().skip(MAX_LOCAL_BACKUPS) {
            if let Err(e) = std::fs::remove_dir_all(&old) {
                warn!("backup: prune of {} failed: {e}", old.display());
            }
        }
    }

    async fn mirror(&self, dir: &Path, name: &str) -> bool {
        let Some(bucket) = self.bucket() else {
            return false;
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        let mut ok = true;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let key = format!(
                "{name}/{}",
                path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
            );
            if let Err(e) = bucket.put_object(&key, &bytes).await {
                warn!("backup: mirror of {key} failed: {e}");
                ok = false;
            }
        }
        ok
    }

    pub async fn list(&self) -> Vec<BackupListing> {
        let mut listings = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.backups_dir) {
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();
            dirs.reverse();
            for dir in dirs {
                let name = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let meta: Value = std::fs::read_to_string(dir.join("metadata.json"))
                    .ok()
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or(json!({}));
                listings.push(BackupListing {
                    timestamp: meta
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .unwrap_or(&name)
                        .to_string(),
                    size_bytes: meta
                        .get("total_size_bytes")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    components: meta
                        .get("components")
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    location: "local".to_string(),
                    name,
                });
            }
        }

        if let Some(bucket) = self.bucket() {
            if let Ok(pages) = bucket.list(String::new(), Some("/".to_string())).await {
                let local_names: Vec<String> = listings.iter().map(|l| l.name.clone()).collect();
                for page in pages {
                    for prefix in page.common_prefixes.unwrap_or_default() {
                        let name = prefix.prefix.trim_end_matches('/').to_string();
                        if local_names.contains(&name) {
                            if let Some(local) = listings.iter_mut().find(|l| l.name == name) {
                                local.location = "local+remote".to_string();
                            }
                        } else {
                            listings.push(BackupListing {
                                timestamp: name.clone(),
                                size_bytes: 0,
                                components: Vec::new(),
                                location: "remote".to_string(),
                                name,
                            });
                        }
                    }
                }
            }
        }
        listings
    }

    /// Restore selected components from a named backup. Missing local
    /// backups are fetched from the object store first.
    pub async fn restore(
        &self,
        archive: &Archive,
        context: &ContextStore,
        name: &str,
        components: Option<&[String]>,
    ) -> Result<Vec<String>, String> {
        let dir = self.backups_dir.join(name);
        if !dir.exists() && !self.fetch_remote(name, &dir).await {
            return Err(format!("backup '{name}' not found"));
        }

        let wants = |component: &str| {
            components
                .map(|list| list.iter().any(|c| c == component))
                .unwrap_or(true)
        };
        let mut restored = Vec::new();

        if wants("master_context") {
            if let Ok(master) = std::fs::read_to_string(dir.join("master-context.md")) {
                if context
                    .write_master(&master, &format!("restore from backup {name}"))
                    .await
                    .is_ok()
                {
                    restored.push("master_context".to_string());
                }
            }
        }

        for (target, label) in [
            (&self.nudges_file, "nudges"),
            (&self.anomalies_file, "anomalies"),
        ] {
            if !wants(label) {
                continue;
            }
            let source = dir.join(target.file_name().unwrap_or_default());
            if source.exists() && std::fs::copy(&source, target).is_ok() {
                restored.push(label.to_string());
            }
        }

        if wants("archive") {
            if let Ok(raw) = std::fs::read_to_string(dir.join("archive-export.json")) {
                if let Ok(Value::Object(export)) = serde_json::from_str::<Value>(&raw) {
                    let mut imported = 0;
                    for (collection, dump) in export {
                        let docs = dump
                            .get("documents")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        for doc in docs {
                            let id = doc.get("id").and_then(Value::as_str).unwrap_or_default();
                            let content =
                                doc.get("content").and_then(Value::as_str).unwrap_or_default();
                            let metadata = doc
                                .get("metadata")
                                .and_then(Value::as_object)
                                .map(|m| m.clone().into_iter().collect())
                                .unwrap_or_default();
                            if !id.is_empty()
                                && archive
                                    .upsert_document(&collection, id, content, metadata)
                                    .await
                                    .is_ok()
                            {
                                imported += 1;
                            }
                        }
                    }
                    restored.push(format!("archive ({imported} documents)"));
                }
            }
        }

        Ok(restored)
    }

    async fn fetch_remote(&self, name: &str, dir: &Path) -> bool {
        let Some(bucket) = self.bucket() else {
            return false;
        };
        let Ok(pages) = bucket.list(format!("{name}/"), None).await else {
            return false;
        };
        let mut fetched = false;
        for page in pages {
            for object in page.contents {
                let Ok(data) = bucket.get_object(&object.key).await else {
                    continue;
                };
                let file_name = object.key.rsplit('/').next().unwrap_or_default().to_string();
                if file_name.is_empty() {
                    continue;
                }
                let _ = std::fs::create_dir_all(dir);
                if std::fs::write(dir.join(&file_name), data.bytes()).is_ok() {
                    fetched = true;
                }
            }
        }
        fetched
    }
}
