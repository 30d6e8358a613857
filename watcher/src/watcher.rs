//! Debounced filesystem watcher feeding the session pipeline.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use engram_config::WatcherConfig;
use engram_stores::{AlertChannel, SessionRecord, SessionStore, Significance};
use engram_worker::SessionQueue;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::detector::{analyze_changes, write_ledger, BatchAnalysis};
use crate::ignore::should_ignore;

/// Settle delay before a freshly created transcript file is read.
const TRANSCRIPT_SETTLE: Duration = Duration::from_secs(2);

/// A transcript that appeared in the drop zone, ready for checkpointing.
#[derive(Debug, Clone)]
pub struct TranscriptCheckpoint {
    pub session_id: String,
    pub note: String,
    pub transcript_path: PathBuf,
    pub tags: Vec<String>,
}

/// Where drop-zone transcripts are delivered. The ingest surface
/// implements this; the composition root wires it in.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn transcript_checkpoint(&self, checkpoint: TranscriptCheckpoint);
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStats {
    pub enabled: bool,
    pub running: bool,
    pub watch_dirs: Vec<String>,
    pub git_root: String,
    pub commits: u64,
    pub files_tracked: u64,
    pub last_commit: Option<String>,
    pub started_at: Option<String>,
    pub pending_changes: usize,
}

pub struct InfraWatcher {
    config: WatcherConfig,
    sessions: SessionStore,
    queue: Arc<SessionQueue>,
    alerts: AlertChannel,
    sink: Option<Arc<dyn CheckpointSink>>,
    commits: AtomicU64,
    files_tracked: AtomicU64,
    pending: AtomicUsize,
    last_commit: Mutex<Option<String>>,
    started_at: Mutex<Option<String>>,
}

impl InfraWatcher {
    pub fn new(
        config: WatcherConfig,
        sessions: SessionStore,
        queue: Arc<SessionQueue>,
        alerts: AlertChannel,
        sink: Option<Arc<dyn CheckpointSink>>,
    ) -> Self {
        Self {
            config,
            sessions,
            queue,
            alerts,
            sink,
            commits: AtomicU64::new(0),
            files_tracked: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            last_commit: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            enabled: self.config.enabled(),
            running: self.started_at.lock().unwrap().is_some(),
            watch_dirs: self
                .config
                .watch_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect(),
            git_root: self.config.git_root.display().to_string(),
            commits: self.commits.load(Ordering::Relaxed),
            files_tracked: self.files_tracked.load(Ordering::Relaxed),
            last_commit: self.last_commit.lock().unwrap().clone(),
            started_at: self.started_at.lock().unwrap().clone(),
            pending_changes: self.pending.load(Ordering::Relaxed),
        }
    }

    /// Start the watcher tasks. Returns immediately; tasks stop when the
    /// shutdown signal flips.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let valid_dirs: Vec<PathBuf> = self
            .config
            .watch_dirs
            .iter()
            .filter(|d| d.is_dir())
            .cloned()
            .collect();
        if valid_dirs.is_empty() {
            warn!("watcher: no valid watch directories configured");
            return;
        }

        *self.started_at.lock().unwrap() = Some(Utc::now().to_rfc3339());

        let watcher = self.clone();
        let mut change_shutdown = shutdown.clone();
        tokio::spawn(async move {
            watcher.ensure_git_repo().await;

            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            let mut fs_watcher = match notify::recommended_watcher(
                move |result: notify::Result<Event>| {
                    if let Ok(event) = result {
                        let _ = tx.send(event);
                    }
                },
            ) {
                Ok(fs_watcher) => fs_watcher,
                Err(e) => {
                    warn!("watcher: failed to create filesystem watcher: {e}");
                    return;
                }
            };
            for dir in &valid_dirs {
                match fs_watcher.watch(dir, RecursiveMode::Recursive) {
                    Ok(()) => info!("watcher: watching {}", dir.display()),
                    Err(e) => warn!("watcher: failed to watch {}: {e}", dir.display()),
                }
            }
            info!("watcher: started, monitoring {} directories", valid_dirs.len());

            let mut pending: BTreeSet<String> = BTreeSet::new();
            let mut deadline: Option<Instant> = None;
            let debounce = Duration::from_secs(watcher.config.debounce_seconds);

            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        if !is_change_event(&event.kind) {
                            continue;
                        }
                        for path in &event.paths {
                            if path.is_dir() || should_ignore(path) {
                                continue;
                            }
                            let rel = path
                                .strip_prefix(&watcher.config.git_root)
                                .unwrap_or(path)
                                .to_string_lossy()
                                .to_string();
                            pending.insert(rel);
                        }
                        if !pending.is_empty() {
                            deadline = Some(Instant::now() + debounce);
                            watcher.pending.store(pending.len(), Ordering::Relaxed);
                        }
                    }
                    _ = async move { tokio::time::sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {
                        let batch: Vec<String> = std::mem::take(&mut pending).into_iter().collect();
                        deadline = None;
                        watcher.pending.store(0, Ordering::Relaxed);
                        watcher.process_batch(batch).await;
                    }
                    _ = change_shutdown.changed() => break,
                }
            }
            info!("watcher: stopped");
        });

        if let Some(drop_dir) = self.config.transcript_drop_dir.clone() {
            if drop_dir.is_dir() {
                self.clone().start_transcript_watch(drop_dir, shutdown);
            }
        }
    }

    fn start_transcript_watch(self: Arc<Self>, drop_dir: PathBuf, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            let mut fs_watcher = match notify::recommended_watcher(
                move |result: notify::Result<Event>| {
                    if let Ok(event) = result {
                        if matches!(event.kind, EventKind::Create(_)) {
                            let _ = tx.send(event);
                        }
                    }
                },
            ) {
                Ok(fs_watcher) => fs_watcher,
                Err(e) => {
                    warn!("watcher: transcript watcher unavailable: {e}");
                    return;
                }
            };
            if let Err(e) = fs_watcher.watch(&drop_dir, RecursiveMode::NonRecursive) {
                warn!("watcher: failed to watch transcripts at {}: {e}", drop_dir.display());
                return;
            }
            info!("watcher: watching transcripts at {}", drop_dir.display());

            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        for path in event.paths {
                            if !has_transcript_extension(&path) {
                                continue;
                            }
                            let watcher = self.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(TRANSCRIPT_SETTLE).await;
                                watcher.on_transcript_arrived(path).await;
                            });
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn on_transcript_arrived(&self, path: PathBuf) {
        info!("watcher: new transcript detected: {}", path.display());
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let checkpoint = TranscriptCheckpoint {
            session_id: format!("transcript-{stem}"),
            note: format!("Transcript arrived: {name}"),
            transcript_path: path,
            tags: vec!["transcript".to_string(), "auto-captured".to_string()],
        };
        match &self.sink {
            Some(sink) => sink.transcript_checkpoint(checkpoint).await,
            None => {
                // No extraction sink wired: persist a plain session so the
                // pipeline still sees the event.
                let mut record =
                    SessionRecord::new(checkpoint.session_id.clone(), checkpoint.note.clone());
                record.tags = checkpoint.tags;
                record.source = "transcript-watch".to_string();
                match self.sessions.write(&record) {
                    Ok(path) => self.queue.enqueue(record.session_id, path),
                    Err(e) => warn!("watcher: transcript session write failed: {e}"),
                }
            }
        }
    }

    async fn ensure_git_repo(&self) {
        let git_dir = self.config.git_root.join(".git");
        if git_dir.exists() {
            return;
        }
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "engram-watcher@localhost"],
            vec!["config", "user.name", "Engram FileWatcher"],
        ] {
            if let Err(e) = tokio::process::Command::new("git")
                .args(&args)
                .current_dir(&self.config.git_root)
                .output()
                .await
            {
                warn!("watcher: git init step failed: {e}");
                return;
            }
        }
        info!("watcher: initialized git repo at {}", self.config.git_root.display());
    }

    async fn git(&self, args: &[&str]) -> Option<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.config.git_root)
            .output()
            .await
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stage, commit, and return (short hash, message, diff stat, file
    /// count). None when nothing was actually staged.
    async fn commit_batch(&self) -> Option<(String, String, String, usize)> {
        self.git(&["add", "-A"]).await?;
        let staged_raw = self.git(&["diff", "--cached", "--name-only"]).await?;
        let staged: Vec<String> = staged_raw
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if staged.is_empty() {
            return None;
        }

        let message = if staged.len() <= 3 {
            format!("auto: {}", staged.join(", "))
        } else {
            let mut contexts: BTreeSet<String> = BTreeSet::new();
            for file in &staged {
                if let Some((top, _)) = file.split_once('/') {
                    contexts.insert(top.to_string());
                }
            }
            format!(
                "auto: {} file(s) in {}",
                staged.len(),
                contexts.into_iter().collect::<Vec<_>>().join(", ")
            )
        };

        self.git(&["commit", "-m", &message]).await?;
        let hash = self.git(&["rev-parse", "--short", "HEAD"]).await?;
        let stat = self
            .git(&["diff", "HEAD~1", "--stat"])
            .await
            .unwrap_or_default()
            .lines()
            .last()
            .unwrap_or_default()
            .to_string();

        Some((hash, message, stat, staged.len()))
    }

    pub async fn process_batch(&self, changed: Vec<String>) {
        if changed.is_empty() {
            return;
        }
        let Some((hash, message, stat, file_count)) = self.commit_batch().await else {
            return;
        };
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.files_tracked.fetch_add(file_count as u64, Ordering::Relaxed);
        *self.last_commit.lock().unwrap() = Some(Utc::now().to_rfc3339());

        let analysis = analyze_changes(&changed, &self.config.git_root).await;

        if write_ledger(&self.config.git_root, &analysis) {
            let _ = self.git(&["add", "-A"]).await;
            let _ = self.git(&["commit", "-m", "auto: infra detector update"]).await;
        }

        if !analysis.credential_alerts.is_empty() {
            self.alert_credentials(&analysis).await;
        }

        self.emit_change_session(&hash, &message, &stat, file_count, &changed, &analysis);

        info!(
            "watcher: committed {hash} ({file_count} files, compose={}, creds={}, new_dirs={})",
            analysis.compose_changes.len(),
            analysis.credential_alerts.len(),
            analysis.new_directories.len()
        );
    }

    async fn alert_credentials(&self, analysis: &BatchAnalysis) {
        let kinds: BTreeSet<&str> = analysis.credential_alerts.iter().map(|a| a.kind).collect();
        let masked: Vec<String> = analysis
            .credential_alerts
            .iter()
            .map(|a| format!("{} ({})", a.masked_value, a.file))
            .collect();
        let body = format!(
            "{} credential(s) detected ({}) in recent changes: {}. Verify these live in the secret manager, not in plaintext.",
            analysis.credential_alerts.len(),
            kinds.into_iter().collect::<Vec<_>>().join(", "),
            masked.join("; "),
        );
        warn!("watcher: CREDENTIAL DETECTED: {body}");
        self.alerts
            .send_best_effort("Credential Detected", &body, "critical")
            .await;
    }

    fn emit_change_session(
        &self,
        hash: &str,
        message: &str,
        stat: &str,
        file_count: usize,
        changed: &[String],
        analysis: &BatchAnalysis,
    ) {
        let has_compose = !analysis.compose_changes.is_empty();
        let has_creds = !analysis.credential_alerts.is_empty();
        let has_new_dirs = !analysis.new_directories.is_empty();

        let significance = if has_compose || has_creds || has_new_dirs {
            Significance::Medium
        } else {
            Significance::Low
        };

        let mut tags = vec!["infra-watcher".to_string()];
        if has_compose {
            tags.push("compose-change".to_string());
        }
        if has_creds {
            tags.push("credential-detected".to_string());
        }
        if has_new_dirs {
            tags.push("new-service".to_string());
        }
        let mut named: BTreeSet<String> = BTreeSet::new();
        for change in &analysis.compose_changes {
            named.insert(change.stack.clone());
        }
        for new_dir in &analysis.new_directories {
            named.insert(new_dir.name.clone());
        }
        for file in changed {
            if let Some(rest) = file.strip_prefix("stacks/").or_else(|| file.strip_prefix("projects/")) {
                if let Some((name, _)) = rest.split_once('/') {
                    named.insert(name.to_string());
                }
            }
        }
        tags.extend(named);

        let now = Utc::now();
        let session_id = format!("infra-watch-{}", now.format("%Y%m%d-%H%M%S"));
        let mut record = SessionRecord::new(session_id.clone(), format!("[{hash}] {message}. {stat}"));
        record.significance = significance;
        record.files_changed = changed.iter().take(20).cloned().collect();
        record.tags = tags;
        record.source = "infra-watcher".to_string();

        match self.sessions.write(&record) {
            Ok(path) => self.queue.enqueue(session_id, path),
            Err(e) => warn!("watcher: change session write failed: {e}"),
        }
    }
}

fn is_change_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn has_transcript_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("txt") | Some("md")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_config::AlertConfig;

    async fn run_git(root: &Path, args: &[&str]) {
        tokio::process::Command::new("git")
            .args(args)
            .current_dir(root)
            .output()
            .await
            .unwrap();
    }

    fn watcher_for(root: &Path, data: &Path) -> (Arc<InfraWatcher>, Arc<SessionQueue>) {
        let queue = Arc::new(SessionQueue::new());
        let watcher = Arc::new(InfraWatcher::new(
            WatcherConfig {
                watch_dirs: vec![root.to_path_buf()],
                git_root: root.to_path_buf(),
                transcript_drop_dir: None,
                debounce_seconds: 1,
            },
            SessionStore::new(data.join("sessions")),
            queue.clone(),
            AlertChannel::new(AlertConfig {
                bot_token: None,
                chat_id: None,
            }),
            None,
        ));
        (watcher, queue)
    }

    #[tokio::test]
    async fn batch_commits_and_emits_session() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let (watcher, queue) = watcher_for(root.path(), data.path());
        watcher.ensure_git_repo().await;

        let stack = root.path().join("stacks/app");
        std::fs::create_dir_all(&stack).unwrap();
        std::fs::write(
            stack.join("docker-compose.yml"),
            "services:\n  app:\n    container_name: app-main\n    image: app:1\n    ports:\n      - \"8080:8080\"\n",
        )
        .unwrap();

        watcher
            .process_batch(vec!["stacks/app/docker-compose.yml".to_string()])
            .await;

        // Session queued with compose tags and medium significance.
        assert_eq!(queue.len(), 1);
        let entry = queue.pop().unwrap();
        let record = SessionStore::new(data.path().join("sessions"))
            .read(&entry.file)
            .unwrap();
        assert_eq!(record.significance, Significance::Medium);
        assert!(record.tags.contains(&"infra-watcher".to_string()));
        assert!(record.tags.contains(&"compose-change".to_string()));
        assert!(record.tags.contains(&"app".to_string()));
        assert!(record.summary.starts_with("["));

        // Ledger exists and was committed.
        assert!(root
            .path()
            .join("infrastructure/auto-detected-changes.md")
            .exists());
        assert!(watcher.stats().commits >= 1);
    }

    #[tokio::test]
    async fn credential_batch_tags_session() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let (watcher, queue) = watcher_for(root.path(), data.path());
        watcher.ensure_git_repo().await;

        let app = root.path().join("stacks/app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(
            app.join(".env"),
            "OPENAI_API_KEY=sk-abcdef0123456789abcdef0123456789\n",
        )
        .unwrap();

        watcher.process_batch(vec!["stacks/app/.env".to_string()]).await;

        let entry = queue.pop().unwrap();
        let record = SessionStore::new(data.path().join("sessions"))
            .read(&entry.file)
            .unwrap();
        assert_eq!(record.significance, Significance::Medium);
        assert!(record.tags.contains(&"credential-detected".to_string()));
        // The raw secret never lands in the emitted session.
        assert!(!serde_json::to_string(&record)
            .unwrap()
            .contains("abcdef0123456789abcdef"));
    }

    #[tokio::test]
    async fn empty_stage_aborts_quietly() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let (watcher, queue) = watcher_for(root.path(), data.path());
        watcher.ensure_git_repo().await;
        run_git(root.path(), &["commit", "--allow-empty", "-m", "seed"]).await;

        watcher.process_batch(vec!["ghost.txt".to_string()]).await;
        assert!(queue.is_empty());
        assert_eq!(watcher.stats().commits, 0);
    }

    #[tokio::test]
    async fn commit_message_lists_files_when_few() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let (watcher, queue) = watcher_for(root.path(), data.path());
        watcher.ensure_git_repo().await;

        std::fs::write(root.path().join("notes.md"), "one file").unwrap();
        watcher.process_batch(vec!["notes.md".to_string()]).await;

        let entry = queue.pop().unwrap();
        let record = SessionStore::new(data.path().join("sessions"))
            .read(&entry.file)
            .unwrap();
        assert!(record.summary.contains("auto: notes.md"));
        assert_eq!(record.significance, Significance::Low);
    }
}
