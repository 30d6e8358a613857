//! End-to-end pipeline tests against the in-memory vector store and a
//! scripted language model.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use engram_archive::{Archive, MemoryStore, VectorStore};
use engram_config::{AlertConfig, BackupStoreConfig, IntegrityConfig, WorkerConfig};
use engram_model_client::{
    AnomalyDraft, EntityRecord, ExtractedFields, LanguageModel, MasterCompression, ModelError,
    NudgeDraft, PatternRecord, SessionSummary, TriageAction, TriageItem, TriageResult,
};
use engram_resilience::{DegradationManager, DEP_MODEL};
use engram_stores::{
    AlertChannel, AnomalyStore, BackupManager, ContextStore, NudgeStore, SessionRecord,
    SessionStore, Significance,
};
use engram_worker::{SessionQueue, Worker, WorkerDeps};
use serde_json::Value;

#[derive(Default)]
struct ScriptedModel {
    summary: Option<SessionSummary>,
    triage: Option<TriageResult>,
    compression: Option<MasterCompression>,
    entities: Vec<EntityRecord>,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn summarize_session(&self, _: &Value) -> Result<SessionSummary, ModelError> {
        self.summary.clone().ok_or(ModelError::Unusable {
            task: "session_summary",
        })
    }

    async fn triage_session(&self, _: &Value, _: &str) -> Result<TriageResult, ModelError> {
        self.triage.clone().ok_or(ModelError::Unusable { task: "triage" })
    }

    async fn extract_entities(&self, _: &Value) -> Result<Vec<EntityRecord>, ModelError> {
        Ok(self.entities.clone())
    }

    async fn compress_master(
        &self,
        _: &str,
        _: &TriageResult,
        _: &Value,
    ) -> Result<MasterCompression, ModelError> {
        self.compression.clone().ok_or(ModelError::Unusable {
            task: "master_compression",
        })
    }

    async fn extract_session_fields(&self, _: &str) -> Result<ExtractedFields, ModelError> {
        Ok(ExtractedFields::default())
    }

    async fn extract_from_transcript(
        &self,
        _: &str,
        _: &str,
    ) -> Result<ExtractedFields, ModelError> {
        Ok(ExtractedFields::default())
    }

    async fn detect_patterns(&self, _: &[Value]) -> Result<Vec<PatternRecord>, ModelError> {
        Ok(Vec::new())
    }

    async fn generate_nudges(
        &self,
        _: &str,
        _: &[Value],
        _: &[String],
        _: &[String],
    ) -> Result<Vec<NudgeDraft>, ModelError> {
        Ok(Vec::new())
    }

    async fn detect_anomalies(
        &self,
        _: &Value,
        _: &str,
        _: &[String],
        _: &[String],
    ) -> Result<Vec<AnomalyDraft>, ModelError> {
        Ok(Vec::new())
    }

    async fn ping(&self) -> Result<f64, ModelError> {
        Ok(1.0)
    }

    fn call_count(&self) -> u64 {
        0
    }
}

struct Fixture {
    _data: tempfile::TempDir,
    _kb: tempfile::TempDir,
    queue: Arc<SessionQueue>,
    sessions: SessionStore,
    archive: Arc<Archive>,
    context: Arc<ContextStore>,
    degradation: Arc<DegradationManager>,
    worker: Worker,
}

fn summary() -> SessionSummary {
    SessionSummary {
        compressed_summary: "rebooted postgres to clear a hung query".into(),
        key_topics: vec!["postgres".into(), "incident".into()],
        significance_confirmed: "medium".into(),
        projects_mentioned: vec!["billing".into()],
    }
}

fn triage_with(items: Vec<TriageItem>) -> TriageResult {
    TriageResult {
        items,
        master_context_updates: Vec::new(),
    }
}

fn master_body() -> String {
    "# Master Context\n\ncontainer: redis-01 on port 6379 serving api.example.com\n\nActive work on the billing migration continues.\n".to_string()
}

fn fixture(model: ScriptedModel, learning_mode: bool) -> Fixture {
    let data = tempfile::tempdir().unwrap();
    let kb = tempfile::tempdir().unwrap();
    let degradation = Arc::new(DegradationManager::new());
    let queue = Arc::new(SessionQueue::new());
    let sessions = SessionStore::new(data.path().join("sessions"));
    let archive = Arc::new(Archive::new(Arc::new(MemoryStore::new()), degradation.clone()));
    let context = Arc::new(ContextStore::new(
        kb.path().to_path_buf(),
        "projects/engram/master-context.md".into(),
        data.path().join("master-context.md"),
        true,
        degradation.clone(),
    ));
    let backups = Arc::new(BackupManager::new(
        data.path().join("backups"),
        data.path().join("nudges.json"),
        data.path().join("anomalies.json"),
        data.path().join("sessions"),
        BackupStoreConfig {
            endpoint: None,
            access_key: None,
            secret_key: None,
            bucket: "backups".into(),
            secure: false,
        },
    ));

    let worker = Worker::new(WorkerDeps {
        queue: queue.clone(),
        sessions: sessions.clone(),
        context: context.clone(),
        archive: archive.clone(),
        model: Arc::new(model),
        nudges: NudgeStore::new(data.path().join("nudges.json")),
        anomalies: AnomalyStore::new(data.path().join("anomalies.json")),
        alerts: AlertChannel::new(AlertConfig {
            bot_token: None,
            chat_id: None,
        }),
        degradation: degradation.clone(),
        backups,
        config: WorkerConfig {
            rate_limit_per_min: 60_000,
            idle_poll_secs: 1,
            maintenance_interval_secs: 86_400,
            breaker_backoff_secs: 0,
        },
        learning_mode,
        integrity: IntegrityConfig {
            domain_roots: vec!["example.com".into()],
            known_projects: vec![],
        },
        kb_root: kb.path().to_path_buf(),
        settings_file: data.path().join("settings.json"),
    });

    Fixture {
        _data: data,
        _kb: kb,
        queue,
        sessions,
        archive,
        context,
        degradation,
        worker,
    }
}

fn save_session(f: &Fixture, record: &SessionRecord) {
    let path = f.sessions.write(record).unwrap();
    f.queue.enqueue(record.session_id.clone(), path);
}

#[tokio::test]
async fn happy_path_archives_and_updates_master() {
    let model = ScriptedModel {
        summary: Some(summary()),
        triage: Some(triage_with(vec![
            TriageItem {
                content: "billing queue moved to rabbitmq".into(),
                action: TriageAction::Archive,
                reason: "infra detail".into(),
                merge_target: None,
                collection: Some("decision_log".into()),
            },
            TriageItem {
                content: "small talk".into(),
                action: TriageAction::Discard,
                reason: "noise".into(),
                merge_target: None,
                collection: None,
            },
        ])),
        compression: Some(MasterCompression {
            master_context_markdown: format!("{}\nUpdated after the incident.\n", master_body()),
            changes_made: vec!["added incident note".into()],
        }),
        entities: vec![EntityRecord {
            name: "Billing Service".into(),
            kind: "service".into(),
            context: "billing service owns invoicing".into(),
            relationships: vec!["rabbitmq".into()],
        }],
    };

    let f = fixture(model, false);
    f.context.write_master(&master_body(), "seed").await.unwrap();

    let mut record = SessionRecord::new("ce-20260101-aaaaaaaa", "rebooted pg");
    record.decisions = vec!["moved billing queue".into()];
    record.failures = vec!["old queue kept dropping jobs".into()];
    save_session(&f, &record);

    assert!(f.worker.tick().await);
    let status = f.worker.status();
    assert_eq!(status.processed, 1);
    assert_eq!(status.failed, 0);

    // Session digest, alias-resolved triage item, decisions, failures,
    // entities all landed.
    assert!(f
        .archive
        .get("sessions", "session-ce-20260101-aaaaaaaa")
        .await
        .unwrap()
        .is_some());
    assert_eq!(f.archive.count("decisions").await.unwrap(), 2); // triage item + decision
    assert_eq!(f.archive.count("failures").await.unwrap(), 1);
    assert_eq!(f.archive.count("entities").await.unwrap(), 1);

    // Discarded item not archived outside learning mode.
    assert_eq!(f.archive.count("project_archive").await.unwrap(), 0);

    // Master was rewritten and the pre-write snapshot exists.
    assert!(f.context.read_master().unwrap().contains("Updated after the incident"));
    assert!(f.archive.count("snapshots").await.unwrap() >= 1);

    // The session file carries the processed marker.
    let path = f.sessions.path_for("ce-20260101-aaaaaaaa");
    let loaded = f.sessions.read(&path).unwrap();
    assert!(loaded.is_processed());
    assert_eq!(loaded.processed.unwrap().triage_items, 2);
}

#[tokio::test]
async fn integrity_veto_keeps_master_and_snapshots_draft() {
    let model = ScriptedModel {
        summary: Some(summary()),
        triage: Some(triage_with(vec![])),
        // Draft drops the container, the port, and the domain -> but the
        // severity driver here is the dropped IP-free trio; add an IP to
        // the seed master to force a high-severity veto.
        compression: Some(MasterCompression {
            master_context_markdown: "# Master Context\n\nAll systems nominal.\n".into(),
            changes_made: vec!["rewrote everything".into()],
        }),
        entities: vec![],
    };

    let f = fixture(model, true);
    let seeded = format!("{}\ngateway at 10.0.0.12\n", master_body());
    f.context.write_master(&seeded, "seed").await.unwrap();

    let record = SessionRecord::new("ce-20260101-bbbbbbbb", "routine work");
    save_session(&f, &record);

    assert!(f.worker.tick().await);
    assert_eq!(f.worker.status().processed, 1);

    // Master unchanged.
    assert_eq!(f.context.read_master().unwrap(), seeded);

    // A blocked-draft snapshot exists alongside the pre-write snapshot.
    let page = f.archive.backend().page("snapshots", 50, 0).await.unwrap();
    assert!(page
        .documents
        .iter()
        .any(|d| d.id.contains("ce-20260101-bbbbbbbb-blocked")));
}

#[tokio::test]
async fn triage_failure_aborts_session() {
    let model = ScriptedModel {
        summary: Some(summary()),
        triage: None,
        compression: None,
        entities: vec![],
    };
    let f = fixture(model, true);
    f.context.write_master(&master_body(), "seed").await.unwrap();
    save_session(&f, &SessionRecord::new("ce-20260101-cccccccc", "work"));

    assert!(f.worker.tick().await);
    let status = f.worker.status();
    assert_eq!(status.failed, 1);
    assert_eq!(status.processed, 0);
    assert!(status.last_error.unwrap().contains("triage failed"));

    // No processed marker on the file.
    let loaded = f.sessions.read(&f.sessions.path_for("ce-20260101-cccccccc")).unwrap();
    assert!(!loaded.is_processed());
}

#[tokio::test]
async fn low_significance_skipped_outside_learning_mode() {
    let model = ScriptedModel {
        summary: Some(summary()),
        triage: Some(triage_with(vec![])),
        compression: None,
        entities: vec![],
    };
    let f = fixture(model, false);
    f.context.write_master(&master_body(), "seed").await.unwrap();

    let mut record = SessionRecord::new("ce-20260101-dddddddd", "tiny change");
    record.significance = Significance::Low;
    save_session(&f, &record);

    assert!(f.worker.tick().await);
    let status = f.worker.status();
    assert_eq!(status.skipped, 1);
    assert_eq!(status.processed, 0);
    assert_eq!(f.archive.count("sessions").await.unwrap(), 0);
}

#[tokio::test]
async fn learning_mode_demotes_discard_to_archive() {
    let model = ScriptedModel {
        summary: Some(summary()),
        triage: Some(triage_with(vec![TriageItem {
            content: "probably noise but keep while learning".into(),
            action: TriageAction::Discard,
            reason: "low value".into(),
            merge_target: None,
            collection: None,
        }])),
        compression: None,
        entities: vec![],
    };
    let f = fixture(model, true);
    f.context.write_master(&master_body(), "seed").await.unwrap();
    save_session(&f, &SessionRecord::new("ce-20260101-eeeeeeee", "work"));

    assert!(f.worker.tick().await);
    assert_eq!(f.archive.count("project_archive").await.unwrap(), 1);
    let page = f.archive.backend().page("project_archive", 10, 0).await.unwrap();
    let meta = &page.documents[0].metadata;
    assert_eq!(meta["action"], serde_json::json!("archive"));
    assert!(meta["reason"].as_str().unwrap().starts_with("[learning mode]"));
}

#[tokio::test]
async fn merge_snapshots_then_appends_to_existing() {
    let model = ScriptedModel {
        summary: Some(summary()),
        triage: Some(triage_with(vec![TriageItem {
            content: "redis now has persistence enabled".into(),
            action: TriageAction::Merge,
            reason: "update".into(),
            merge_target: Some("redis deployment notes".into()),
            collection: Some("project_archive".into()),
        }])),
        compression: None,
        entities: vec![],
    };
    let f = fixture(model, true);
    f.context.write_master(&master_body(), "seed").await.unwrap();

    f.archive
        .add_document(
            "project_archive",
            "existing-redis",
            "redis deployment notes from january",
            Default::default(),
        )
        .await
        .unwrap();

    save_session(&f, &SessionRecord::new("ce-20260101-ffffffff", "work"));
    assert!(f.worker.tick().await);

    let merged = f.archive.get("project_archive", "existing-redis").await.unwrap().unwrap();
    assert!(merged.content.contains("redis deployment notes from january"));
    assert!(merged.content.contains("[Updated "));
    assert!(merged.content.contains("persistence enabled"));

    // Snapshot of the pre-merge document exists (I1).
    let page = f.archive.backend().page("snapshots", 50, 0).await.unwrap();
    assert!(page
        .documents
        .iter()
        .any(|d| d.metadata.get("source_id") == Some(&serde_json::json!("existing-redis"))));
}

#[tokio::test]
async fn open_breaker_requeues_at_tail() {
    let model = ScriptedModel {
        summary: Some(summary()),
        triage: Some(triage_with(vec![])),
        compression: None,
        entities: vec![],
    };
    let f = fixture(model, true);
    f.context.write_master(&master_body(), "seed").await.unwrap();

    // Trip the model breaker.
    for _ in 0..3 {
        f.degradation.mark_unhealthy(DEP_MODEL, "transport error");
    }
    assert!(!f.degradation.can_call(DEP_MODEL));

    save_session(&f, &SessionRecord::new("ce-20260101-99999999", "work"));
    assert_eq!(f.queue.len(), 1);

    assert!(f.worker.tick().await);
    // Not processed, not failed, back on the queue.
    let status = f.worker.status();
    assert_eq!(status.processed, 0);
    assert_eq!(status.failed, 0);
    assert_eq!(f.queue.len(), 1);
}

#[tokio::test]
async fn corrupt_session_file_counts_as_failed() {
    let model = ScriptedModel::default();
    let f = fixture(model, true);

    let path = f.sessions.dir().join("broken.json");
    std::fs::create_dir_all(f.sessions.dir()).unwrap();
    std::fs::write(&path, "{not json").unwrap();
    f.queue.enqueue("broken", path);

    assert!(f.worker.tick().await);
    assert_eq!(f.worker.status().failed, 1);
}

#[tokio::test]
async fn summary_failure_degrades_but_session_completes() {
    let model = ScriptedModel {
        summary: None,
        triage: Some(triage_with(vec![])),
        compression: None,
        entities: vec![],
    };
    let f = fixture(model, true);
    f.context.write_master(&master_body(), "seed").await.unwrap();

    let mut record = SessionRecord::new("ce-20260101-88888888", "manual fallback summary");
    record.tags = vec!["fallback".into()];
    save_session(&f, &record);

    assert!(f.worker.tick().await);
    assert_eq!(f.worker.status().processed, 1);

    let digest = f
        .archive
        .get("sessions", "session-ce-20260101-88888888")
        .await
        .unwrap()
        .unwrap();
    assert!(digest.content.contains("manual fallback summary"));
    assert_eq!(digest.metadata["topics"], serde_json::json!("fallback"));
}
