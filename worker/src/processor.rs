//! The session-processing pipeline.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use engram_archive::{run_retention, Archive};
use engram_config::{resolve_collection_name, IntegrityConfig, RuntimeSettings, WorkerConfig};
use engram_integrity::{check_integrity, load_known_facts, DropSeverity};
use engram_model_client::{
    LanguageModel, ModelError, SessionSummary, TriageAction, TriageResult,
};
use engram_resilience::{DegradationManager, DEP_MODEL};
use engram_stores::{
    AlertChannel, AnomalyStore, BackupManager, ContextStore, NudgeStore, ProcessedMarker,
    SessionRecord, SessionStore, Significance,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueEntry, SessionQueue};

/// Placeholder served when no master-context source is reachable.
const MASTER_PLACEHOLDER: &str = "# Master Context\n*Not available*";

/// Everything the worker needs, wired by the composition root.
pub struct WorkerDeps {
    pub queue: Arc<SessionQueue>,
    pub sessions: SessionStore,
    pub context: Arc<ContextStore>,
    pub archive: Arc<Archive>,
    pub model: Arc<dyn LanguageModel>,
    pub nudges: NudgeStore,
    pub anomalies: AnomalyStore,
    pub alerts: AlertChannel,
    pub degradation: Arc<DegradationManager>,
    pub backups: Arc<BackupManager>,
    pub config: WorkerConfig,
    pub learning_mode: bool,
    pub integrity: IntegrityConfig,
    pub kb_root: PathBuf,
    pub settings_file: PathBuf,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerStatus {
    pub queue_depth: usize,
    pub processing: bool,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_processed: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Stats {
    processing: bool,
    processed: u64,
    failed: u64,
    skipped: u64,
    last_processed: Option<String>,
    last_error: Option<String>,
}

enum SessionOutcome {
    Processed,
    Skipped,
    Failed(String),
    /// Breaker open: the entry went back to the tail; back off.
    Requeued,
}

pub struct Worker {
    deps: WorkerDeps,
    stats: Mutex<Stats>,
    last_run_started: Mutex<Option<Instant>>,
    last_maintenance: Mutex<Instant>,
}

impl Worker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            stats: Mutex::new(Stats::default()),
            last_run_started: Mutex::new(None),
            last_maintenance: Mutex::new(Instant::now()),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let stats = self.stats.lock().unwrap();
        WorkerStatus {
            queue_depth: self.deps.queue.len(),
            processing: stats.processing,
            processed: stats.processed,
            failed: stats.failed,
            skipped: stats.skipped,
            last_processed: stats.last_processed.clone(),
            last_error: stats.last_error.clone(),
        }
    }

    fn min_interval(&self) -> Duration {
        let rate = self.deps.config.rate_limit_per_min.max(1);
        Duration::from_secs_f64(60.0 / rate as f64)
    }

    /// Main loop. Runs until the shutdown signal flips; an in-flight
    /// session always completes first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("worker: background processor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.tick().await {
                self.maybe_run_maintenance().await;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(self.deps.config.idle_poll_secs)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!("worker: background processor stopped");
    }

    /// Drain one queue entry through the pipeline, honoring the rate
    /// limit. Returns false when the queue was empty.
    pub async fn tick(&self) -> bool {
        let Some(entry) = self.deps.queue.pop() else {
            return false;
        };
        self.pace().await;
        let session_id = entry.session_id.clone();
        let outcome = self.process_entry(entry).await;
        self.record_outcome(&session_id, outcome).await;
        true
    }

    /// Enforce the minimum interval between pipeline starts.
    async fn pace(&self) {
        let min_interval = self.min_interval();
        let wait = {
            let last = self.last_run_started.lock().unwrap();
            match *last {
                Some(started) => min_interval.checked_sub(started.elapsed()),
                None => None,
            }
        };
        if let Some(wait) = wait {
            debug!("worker: rate limit, sleeping {:.1}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
        *self.last_run_started.lock().unwrap() = Some(Instant::now());
    }

    async fn record_outcome(&self, session_id: &str, outcome: SessionOutcome) {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.processing = false;
            match &outcome {
                SessionOutcome::Processed => {
                    stats.processed += 1;
                    stats.last_processed = Some(session_id.to_string());
                }
                SessionOutcome::Skipped => stats.skipped += 1,
                SessionOutcome::Failed(reason) => {
                    stats.failed += 1;
                    stats.last_error = Some(reason.clone());
                }
                SessionOutcome::Requeued => {}
            }
        }
        match outcome {
            SessionOutcome::Processed => {
                info!("worker: {session_id} processed successfully");
                self.periodic_analyses(session_id).await;
            }
            SessionOutcome::Failed(reason) => error!("worker: {session_id} failed: {reason}"),
            SessionOutcome::Requeued => {
                warn!("worker: model breaker open, re-queued {session_id}");
                tokio::time::sleep(Duration::from_secs(self.deps.config.breaker_backoff_secs)).await;
            }
            SessionOutcome::Skipped => {}
        }
    }

    async fn process_entry(&self, entry: QueueEntry) -> SessionOutcome {
        let session_id = entry.session_id.clone();
        info!("worker: processing {session_id}");
        self.stats.lock().unwrap().processing = true;

        // 1. Gate on the model breaker; everything downstream needs it.
        if !self.deps.degradation.can_call(DEP_MODEL) {
            self.deps.queue.requeue(entry);
            return SessionOutcome::Requeued;
        }

        // 2. Load the session record from cold storage.
        let record = match self.deps.sessions.read(&entry.file) {
            Ok(record) => record,
            Err(e) => {
                return SessionOutcome::Failed(format!(
                    "could not load {}: {e}",
                    entry.file.display()
                ))
            }
        };

        // 3. Significance filter.
        if !self.deps.learning_mode && record.significance == Significance::Low {
            info!("worker: skipping low significance session {session_id}");
            return SessionOutcome::Skipped;
        }

        // 4. Current master, degraded placeholder if unavailable.
        let current_master = self.deps.context.read_master().unwrap_or_else(|| {
            warn!("worker: master context unavailable, processing with placeholder");
            MASTER_PLACEHOLDER.to_string()
        });

        // 5. Snapshot before any writes.
        if let Err(e) = self
            .deps
            .archive
            .snapshot_content(&session_id, &current_master, "pre_write_snapshot")
            .await
        {
            warn!("worker: snapshot failed (non-fatal): {e}");
        }

        let session_json = serde_json::to_value(&record).unwrap_or(Value::Null);

        // 6. Summarize; degrade to a fields-only summary on failure.
        let summary = match self.deps.model.summarize_session(&session_json).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("worker: summarization failed ({e}), using raw session data");
                degraded_summary(&record)
            }
        };

        // 7. Triage against the current master. Failure aborts the session.
        let triage = match self.deps.model.triage_session(&session_json, &current_master).await {
            Ok(triage) => triage,
            Err(e) => return SessionOutcome::Failed(format!("triage failed for {session_id}: {e}")),
        };
        info!(
            "worker: triage complete, {} items, {} updates",
            triage.items.len(),
            triage.master_context_updates.len()
        );

        // 8-10. Archive tier writes.
        self.write_session_digest(&record, &summary).await;
        let archived = self.archive_triage_items(&record, &triage).await;
        debug!("worker: archived {archived} triage items");
        self.write_decisions_and_failures(&record).await;

        // 11. Entity extraction is best-effort.
        self.extract_entities(&record, &session_json).await;

        // 12. Compress the master context, guarded by the integrity check.
        self.compress_master(&record, &current_master, &triage, &session_json).await;

        // 13. Mark the session file processed.
        let marker = ProcessedMarker {
            timestamp: Utc::now().to_rfc3339(),
            summary: summary.compressed_summary.clone(),
            triage_items: triage.items.len(),
            master_updates: triage.master_context_updates.len(),
        };
        if let Err(e) = self.deps.sessions.mark_processed(&entry.file, marker) {
            warn!("worker: failed to mark {session_id} processed: {e}");
        }

        SessionOutcome::Processed
    }

    async fn write_session_digest(&self, record: &SessionRecord, summary: &SessionSummary) {
        let document = json!({
            "summary": summary.compressed_summary,
            "key_topics": summary.key_topics,
            "significance": summary.significance_confirmed,
            "raw_summary": record.summary,
            "files_changed": record.files_changed,
            "decisions": record.decisions,
            "failures": record.failures,
            "next_steps": record.next_steps,
        });
        let metadata = [
            ("session_id".to_string(), json!(record.session_id)),
            ("timestamp".to_string(), json!(Utc::now().to_rfc3339())),
            ("significance".to_string(), json!(summary.significance_confirmed)),
            ("topics".to_string(), json!(summary.key_topics.join(","))),
            ("source".to_string(), json!(record.source)),
        ]
        .into_iter()
        .collect();
        let id = format!("session-{}", record.session_id);
        if let Err(e) = self
            .deps
            .archive
            .add_document("sessions", &id, &document.to_string(), metadata)
            .await
        {
            error!("worker: sessions write failed: {e}");
        }
    }

    /// Route triage items with archive/merge actions to their target
    /// collections. Learning mode demotes discard to archive.
    async fn archive_triage_items(&self, record: &SessionRecord, triage: &TriageResult) -> usize {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let mut archived = 0;

        for (idx, item) in triage.items.iter().enumerate() {
            let mut action = item.action;
            let mut reason = item.reason.clone();
            if self.deps.learning_mode && action == TriageAction::Discard {
                action = TriageAction::Archive;
                reason = format!("[learning mode] {reason}");
            }
            if !matches!(action, TriageAction::Archive | TriageAction::Merge) {
                continue;
            }
            if item.content.is_empty() {
                continue;
            }

            let requested = item.collection.as_deref().unwrap_or("project_archive");
            let collection = resolve_collection_name(requested);
            if collection != requested {
                info!("worker: resolved collection name '{requested}' -> '{collection}'");
            }

            let mut metadata: engram_archive::types::Metadata = [
                ("session_id".to_string(), json!(record.session_id)),
                ("action".to_string(), json!(action_str(action))),
                ("reason".to_string(), json!(reason)),
                ("source".to_string(), json!("triage")),
            ]
            .into_iter()
            .collect();

            if action == TriageAction::Merge {
                if let Some(target) = item.merge_target.as_deref().filter(|t| !t.is_empty()) {
                    metadata.insert("merge_target".to_string(), json!(target));
                    match self.deps.archive.search(collection, target, 1, None).await {
                        Ok(hits) if !hits.is_empty() => {
                            let existing = &hits[0];
                            if let Err(e) =
                                self.deps.archive.take_snapshot(collection, &existing.id).await
                            {
                                warn!("worker: merge snapshot failed: {e}");
                            }
                            let merged = format!(
                                "{}\n\n[Updated {stamp}]\n{}",
                                existing.content, item.content
                            );
                            match self
                                .deps
                                .archive
                                .upsert_document(collection, &existing.id, &merged, metadata)
                                .await
                            {
                                Ok(()) => archived += 1,
                                Err(e) => error!("worker: merge upsert failed: {e}"),
                            }
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("worker: merge target search failed: {e}"),
                    }
                }
            }

            let doc_id = format!("{}:{collection}:{stamp}-{idx}", record.session_id);
            match self
                .deps
                .archive
                .add_document(collection, &doc_id, &item.content, metadata)
                .await
            {
                Ok(()) => archived += 1,
                Err(e) => error!("worker: archive write to '{collection}' failed: {e}"),
            }
        }
        archived
    }

    async fn write_decisions_and_failures(&self, record: &SessionRecord) {
        let tags = record.tags.join(",");
        for (collection, prefix, items) in [
            ("decisions", "decision", &record.decisions),
            ("failures", "failure", &record.failures),
        ] {
            for (idx, item) in items.iter().enumerate() {
                let metadata = [
                    ("session_id".to_string(), json!(record.session_id)),
                    ("timestamp".to_string(), json!(Utc::now().to_rfc3339())),
                    ("tags".to_string(), json!(tags)),
                ]
                .into_iter()
                .collect();
                let id = format!("{prefix}-{}-{idx}", record.session_id);
                if let Err(e) = self.deps.archive.add_document(collection, &id, item, metadata).await
                {
                    error!("worker: {collection} write failed: {e}");
                }
            }
        }
    }

    async fn extract_entities(&self, record: &SessionRecord, session_json: &Value) {
        let entities = match self.deps.model.extract_entities(session_json).await {
            Ok(entities) => entities,
            Err(e) => {
                warn!("worker: entity extraction failed (non-fatal): {e}");
                return;
            }
        };
        let count = entities.len();
        for entity in entities {
            let slug = engram_model_client::entity_slug(&entity.name);
            let id = format!("entity-{slug}-{}", record.session_id);
            let content = if entity.context.is_empty() {
                entity.name.clone()
            } else {
                entity.context.clone()
            };
            let metadata = [
                ("name".to_string(), json!(entity.name)),
                ("type".to_string(), json!(entity.kind)),
                ("session_id".to_string(), json!(record.session_id)),
                ("timestamp".to_string(), json!(record.created_at)),
                ("relationships".to_string(), json!(entity.relationships.join(","))),
            ]
            .into_iter()
            .collect();
            if let Err(e) = self.deps.archive.upsert_document("entities", &id, &content, metadata).await
            {
                warn!("worker: entity upsert failed: {e}");
            }
        }
        if count > 0 {
            info!("worker: extracted {count} entities");
        }
    }

    async fn compress_master(
        &self,
        record: &SessionRecord,
        current_master: &str,
        triage: &TriageResult,
        session_json: &Value,
    ) {
        let compression = match self
            .deps
            .model
            .compress_master(current_master, triage, session_json)
            .await
        {
            Ok(compression) if !compression.master_context_markdown.is_empty() => compression,
            Ok(_) | Err(_) => {
                warn!("worker: master context compression failed, keeping existing");
                self.deps
                    .alerts
                    .send_best_effort(
                        "Master Compression Failed",
                        &format!("Session: {} | model returned no result.", record.session_id),
                        "warning",
                    )
                    .await;
                return;
            }
        };

        let draft = compression.master_context_markdown;
        let known = load_known_facts(&self.deps.kb_root);
        debug!(
            "worker: known-fact ledger holds {} containers, {} ports (reference only)",
            known.containers.len(),
            known.ports.len()
        );

        let report = check_integrity(current_master, &draft, &self.deps.integrity);
        if report.passed {
            if self.write_master(&draft, record).await {
                info!(
                    "worker: master context updated, {} changes, integrity OK",
                    compression.changes_made.len()
                );
            }
            return;
        }

        warn!(
            "worker: integrity check FAILED (severity={}, dropped={}): {}",
            report.severity.as_str(),
            report.drop_count,
            report.details
        );
        if report.severity == DropSeverity::High {
            // Veto: keep the current master, preserve the draft for
            // inspection, and raise an alert.
            error!("worker: BLOCKING master context update, high-severity integrity failure");
            let trigger = format!("{}-blocked", record.session_id);
            if let Err(e) = self
                .deps
                .archive
                .snapshot_content(&trigger, &draft, "blocked_draft")
                .await
            {
                warn!("worker: blocked-draft snapshot failed: {e}");
            }
            let details: String = report.details.chars().take(300).collect();
            self.deps
                .alerts
                .send_best_effort(
                    "Master Context Update BLOCKED",
                    &format!(
                        "Session: {} | Dropped: {} facts | {details}",
                        record.session_id, report.drop_count
                    ),
                    "error",
                )
                .await;
        } else if self.write_master(&draft, record).await {
            info!(
                "worker: master context updated with warnings, {} facts flagged",
                report.drop_count
            );
        }
    }

    async fn write_master(&self, draft: &str, record: &SessionRecord) -> bool {
        let message = format!("engram: master context update from {}", record.session_id);
        match self.deps.context.write_master(draft, &message).await {
            Ok(()) => true,
            Err(e) => {
                error!("worker: master context write failed: {e}");
                false
            }
        }
    }

    /// Cadenced analyses after a processed session: patterns every 5th,
    /// nudges every 3rd, anomalies every 4th (the latter two only outside
    /// learning mode).
    async fn periodic_analyses(&self, session_id: &str) {
        let processed = self.stats.lock().unwrap().processed;

        if processed % 5 == 0 {
            if let Err(e) = self.detect_patterns(session_id).await {
                warn!("worker: pattern detection failed (non-fatal): {e}");
            }
        }
        if processed % 3 == 0 && !self.deps.learning_mode {
            if let Err(e) = self.generate_nudges(session_id).await {
                warn!("worker: nudge generation failed (non-fatal): {e}");
            }
        }
        if processed % 4 == 0 && !self.deps.learning_mode {
            if let Err(e) = self.detect_anomalies(session_id).await {
                warn!("worker: anomaly detection failed (non-fatal): {e}");
            }
        }
    }

    async fn recent_session_values(&self, n: usize) -> Vec<Value> {
        self.deps
            .archive
            .get_recent_sessions(n)
            .await
            .into_iter()
            .map(|doc| {
                json!({
                    "id": doc.id,
                    "content": doc.content,
                    "metadata": doc.metadata,
                })
            })
            .collect()
    }

    async fn relevant_contents(&self, collection: &str, query: &str, n: usize) -> Vec<String> {
        match self.deps.archive.search(collection, query, n, None).await {
            Ok(hits) => hits
                .into_iter()
                .filter(|h| h.distance.unwrap_or(f64::MAX) < 1.5)
                .map(|h| h.content)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn detect_patterns(&self, session_id: &str) -> Result<(), ModelError> {
        let recent = self.recent_session_values(10).await;
        if recent.len() < 5 {
            return Ok(());
        }
        let patterns = self.deps.model.detect_patterns(&recent).await?;
        let count = patterns.len();
        for pattern in patterns {
            let id = format!("pattern-{session_id}-{}", pattern.kind);
            let metadata = [
                ("type".to_string(), json!(pattern.kind)),
                ("frequency".to_string(), json!(pattern.frequency.to_string())),
                ("session_id".to_string(), json!(session_id)),
                ("timestamp".to_string(), json!(Utc::now().to_rfc3339())),
            ]
            .into_iter()
            .collect();
            if let Err(e) = self
                .deps
                .archive
                .upsert_document("patterns", &id, &pattern.pattern, metadata)
                .await
            {
                warn!("worker: pattern upsert failed: {e}");
            }
        }
        if count > 0 {
            info!("worker: detected {count} patterns");
        }
        Ok(())
    }

    async fn generate_nudges(&self, session_id: &str) -> Result<(), ModelError> {
        let master = self.deps.context.read_master().unwrap_or_default();
        let recent = self.recent_session_values(10).await;
        let patterns = self.relevant_contents("patterns", "recent", 5).await;
        let failures = self.relevant_contents("failures", "recent", 5).await;

        let drafts = self
            .deps
            .model
            .generate_nudges(&master, &recent, &patterns, &failures)
            .await?;
        if !drafts.is_empty() {
            let stored = self.deps.nudges.store(&drafts, Some(session_id));
            info!("worker: generated {} nudges, stored {stored}", drafts.len());
        }
        Ok(())
    }

    async fn detect_anomalies(&self, session_id: &str) -> Result<(), ModelError> {
        let master = self.deps.context.read_master().unwrap_or_default();
        let record = self.deps.sessions.read(&self.deps.sessions.path_for(session_id));
        let session_json = record
            .ok()
            .and_then(|r| serde_json::to_value(&r).ok())
            .unwrap_or(Value::Null);
        let decisions = self.relevant_contents("decisions", "recent", 10).await;
        let failures = self.relevant_contents("failures", "resolved", 10).await;

        let drafts = self
            .deps
            .model
            .detect_anomalies(&session_json, &master, &decisions, &failures)
            .await?;
        if drafts.is_empty() {
            info!("worker: no anomalies detected");
        } else {
            let stored = self.deps.anomalies.store(&drafts, Some(session_id));
            info!("worker: detected {} anomalies, stored {stored}", drafts.len());
        }
        Ok(())
    }

    async fn maybe_run_maintenance(&self) {
        let due = {
            let last = self.last_maintenance.lock().unwrap();
            last.elapsed().as_secs() >= self.deps.config.maintenance_interval_secs
        };
        if !due {
            return;
        }
        *self.last_maintenance.lock().unwrap() = Instant::now();

        match self
            .deps
            .backups
            .create(&self.deps.archive, &self.deps.context, false)
            .await
        {
            Ok(summary) => info!(
                "auto-backup: created {} ({} bytes)",
                summary.name, summary.total_size_bytes
            ),
            Err(e) => warn!("auto-backup: {e}"),
        }

        // Retention overrides come from the settings file; absent file
        // means registry defaults.
        let settings = RuntimeSettings::load(&self.deps.settings_file);
        let reports = run_retention(
            &self.deps.archive,
            |collection| settings.retention.days_for(collection),
            false,
        )
        .await;
        let pruned: usize = reports.iter().map(|r| r.pruned).sum();
        if pruned > 0 {
            info!("retention: pruned {pruned} expired documents");
        }
    }
}

fn action_str(action: TriageAction) -> &'static str {
    match action {
        TriageAction::Keep => "keep",
        TriageAction::Archive => "archive",
        TriageAction::Merge => "merge",
        TriageAction::Discard => "discard",
    }
}

/// Fields-only summary used when the summarization stage fails.
fn degraded_summary(record: &SessionRecord) -> SessionSummary {
    SessionSummary {
        compressed_summary: if record.summary.is_empty() {
            "No summary".to_string()
        } else {
            record.summary.clone()
        },
        key_topics: record.tags.clone(),
        significance_confirmed: record.significance.as_str().to_string(),
        projects_mentioned: Vec::new(),
    }
}
