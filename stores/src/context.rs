//! Master-context store.
//!
//! Read priority: external KB mount (unless standalone), then the local
//! file, then the last-known-good cache. Writes go local-first, then
//! mirror to the external KB with a version commit. Every successful read
//! refreshes the degradation cache with its source tag.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use engram_resilience::{CacheSource, DegradationManager, DEP_CONTEXT_STORE};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ContextStoreError {
    #[error("path traversal blocked: {0}")]
    PathTraversal(String),
    #[error("context io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("all write targets failed")]
    AllTargetsFailed,
}

pub struct ContextStore {
    kb_root: PathBuf,
    master_rel: String,
    local_path: PathBuf,
    standalone: bool,
    degradation: Arc<DegradationManager>,
}

impl ContextStore {
    pub fn new(
        kb_root: PathBuf,
        master_rel: String,
        local_path: PathBuf,
        standalone: bool,
        degradation: Arc<DegradationManager>,
    ) -> Self {
        Self {
            kb_root,
            master_rel,
            local_path,
            standalone,
            degradation,
        }
    }

    /// Resolve a relative path inside the KB, rejecting anything that
    /// lexically escapes the root.
    pub fn safe_path(&self, relative: &str) -> Result<PathBuf, ContextStoreError> {
        let mut resolved = self.kb_root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(ContextStoreError::PathTraversal(relative.to_string())),
            }
        }
        if !resolved.starts_with(&self.kb_root) {
            return Err(ContextStoreError::PathTraversal(relative.to_string()));
        }
        Ok(resolved)
    }

    fn external_accessible(&self) -> bool {
        !self.standalone && self.kb_root.is_dir()
    }

    fn read_external(&self) -> Option<String> {
        let path = match self.safe_path(&self.master_rel) {
            Ok(path) => path,
            Err(e) => {
                warn!("context: {e}");
                return None;
            }
        };
        std::fs::read_to_string(path).ok().filter(|c| !c.is_empty())
    }

    fn read_local(&self) -> Option<String> {
        std::fs::read_to_string(&self.local_path)
            .ok()
            .filter(|c| !c.is_empty())
    }

    /// Read the master context through the fallback chain. `None` means
    /// no source (including the cache) could supply it.
    pub fn read_master(&self) -> Option<String> {
        if self.external_accessible() {
            if let Some(content) = self.read_external() {
                self.degradation.mark_healthy(DEP_CONTEXT_STORE);
                self.degradation.update_cache(&content, CacheSource::Live);
                return Some(content);
            }
        }
        if let Some(content) = self.read_local() {
            if self.standalone {
                self.degradation.mark_healthy(DEP_CONTEXT_STORE);
            } else {
                self.degradation
                    .mark_unhealthy(DEP_CONTEXT_STORE, "external KB unavailable, using local");
            }
            self.degradation.update_cache(&content, CacheSource::Local);
            return Some(content);
        }
        self.degradation
            .mark_unhealthy(DEP_CONTEXT_STORE, "no file sources available");
        if let Some(cached) = self.degradation.cached_context() {
            let age = self.degradation.cache_age_seconds().unwrap_or_default();
            warn!("context: serving cached master context ({age:.0}s old)");
            return Some(cached);
        }
        None
    }

    /// Write-through: local file always, external KB plus commit when
    /// reachable. Succeeds when any target succeeds.
    pub async fn write_master(
        &self,
        content: &str,
        commit_message: &str,
    ) -> Result<(), ContextStoreError> {
        self.degradation.update_cache(content, CacheSource::Live);
        let mut success = false;

        if let Some(parent) = self.local_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::write(&self.local_path, content) {
            Ok(()) => success = true,
            Err(e) => error!("context: local master write failed: {e}"),
        }

        if self.external_accessible() {
            match self.safe_path(&self.master_rel) {
                Ok(path) => {
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    match std::fs::write(&path, content) {
                        Ok(()) => {
                            self.commit(commit_message).await;
                            self.degradation.mark_healthy(DEP_CONTEXT_STORE);
                            success = true;
                        }
                        Err(e) => {
                            self.degradation.mark_unhealthy(DEP_CONTEXT_STORE, &e.to_string());
                        }
                    }
                }
                Err(e) => {
                    self.degradation.mark_unhealthy(DEP_CONTEXT_STORE, &e.to_string());
                }
            }
        }

        if success {
            Ok(())
        } else {
            self.degradation
                .mark_unhealthy(DEP_CONTEXT_STORE, "all write targets failed");
            Err(ContextStoreError::AllTargetsFailed)
        }
    }

    async fn commit(&self, message: &str) {
        let add = tokio::process::Command::new("git")
            .args(["add", "-A"])
            .current_dir(&self.kb_root)
            .output()
            .await;
        if let Err(e) = add {
            warn!("context: git add failed: {e}");
            return;
        }
        let commit = tokio::process::Command::new("git")
            .args(["commit", "-m", message, "--allow-empty"])
            .current_dir(&self.kb_root)
            .output()
            .await;
        match commit {
            Ok(output) if output.status.success() => info!("context: committed: {message}"),
            Ok(output) => warn!(
                "context: git commit failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("context: git commit failed: {e}"),
        }
    }

    /// Whether any master-context source is currently reachable.
    pub fn accessible(&self) -> bool {
        if self.external_accessible() {
            self.degradation.mark_healthy(DEP_CONTEXT_STORE);
            return true;
        }
        if self.local_path.exists() {
            if self.standalone {
                self.degradation.mark_healthy(DEP_CONTEXT_STORE);
            }
            return true;
        }
        false
    }
}
