//! HTTP surface tests over an in-memory wiring.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use engram_api_server::{router, AppState};
use engram_archive::{Archive, MemoryStore};
use engram_config::AppConfig;
use engram_model_client::{
    AnomalyDraft, EntityRecord, ExtractedFields, LanguageModel, MasterCompression, ModelError,
    NudgeDraft, PatternRecord, SessionSummary, TriageResult,
};
use engram_resilience::DegradationManager;
use engram_stores::{
    AlertChannel, AnomalyStore, BackupManager, ContextStore, NudgeStore, SessionStore,
    TranscriptStore,
};
use engram_worker::{SessionQueue, Worker, WorkerDeps};
use serde_json::{json, Value};
use tower::ServiceExt;

#[derive(Default)]
struct RecordingModel {
    extract_notes: Mutex<Vec<String>>,
}

#[async_trait]
impl LanguageModel for RecordingModel {
    async fn summarize_session(&self, _: &Value) -> Result<SessionSummary, ModelError> {
        Err(ModelError::Unusable {
            task: "session_summary",
        })
    }

    async fn triage_session(&self, _: &Value, _: &str) -> Result<TriageResult, ModelError> {
        Err(ModelError::Unusable { task: "triage" })
    }

    async fn extract_entities(&self, _: &Value) -> Result<Vec<EntityRecord>, ModelError> {
        Ok(Vec::new())
    }

    async fn compress_master(
        &self,
        _: &str,
        _: &TriageResult,
        _: &Value,
    ) -> Result<MasterCompression, ModelError> {
        Err(ModelError::Unusable {
            task: "master_compression",
        })
    }

    async fn extract_session_fields(&self, note: &str) -> Result<ExtractedFields, ModelError> {
        self.extract_notes.lock().unwrap().push(note.to_string());
        Ok(ExtractedFields {
            summary: format!("{note} (postgres restart cleared a hung query)"),
            decisions: vec!["restart postgres rather than kill the query".into()],
            failures: vec![],
            files_changed: vec![],
            next_steps: vec!["add a statement timeout".into()],
            tags: vec!["postgres".into(), "incident".into()],
            significance: Some("medium".into()),
        })
    }

    async fn extract_from_transcript(
        &self,
        _: &str,
        note: &str,
    ) -> Result<ExtractedFields, ModelError> {
        self.extract_session_fields(note).await
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
        Ok(5.0)
    }

    fn call_count(&self) -> u64 {
        self.extract_notes.lock().unwrap().len() as u64
    }
}

struct Fixture {
    _data: tempfile::TempDir,
    _kb: tempfile::TempDir,
    state: AppState,
    model: Arc<RecordingModel>,
}

fn fixture() -> Fixture {
    let data = tempfile::tempdir().unwrap();
    let kb = tempfile::tempdir().unwrap();

    let mut config = AppConfig::from_env().unwrap();
    config.paths.data_dir = data.path().to_path_buf();
    config.paths.sessions_dir = data.path().join("sessions");
    config.paths.transcripts_dir = data.path().join("transcripts");
    config.paths.backups_dir = data.path().join("backups");
    config.kb.kb_root = kb.path().to_path_buf();
    config.kb.standalone_mode = true;
    config.server.learning_mode = false;
    let config = Arc::new(config);

    let degradation = Arc::new(DegradationManager::new());
    let archive = Arc::new(Archive::new(Arc::new(MemoryStore::new()), degradation.clone()));
    let context = Arc::new(ContextStore::new(
        config.kb.kb_root.clone(),
        config.kb.master_context_rel.clone(),
        config.paths.local_master_context(),
        true,
        degradation.clone(),
    ));
    let model = Arc::new(RecordingModel::default());
    let queue = Arc::new(SessionQueue::new());
    let sessions = SessionStore::new(config.paths.sessions_dir.clone());
    let backups = Arc::new(BackupManager::new(
        config.paths.backups_dir.clone(),
        config.paths.nudges_file(),
        config.paths.anomalies_file(),
        config.paths.sessions_dir.clone(),
        config.backup_store.clone(),
    ));
    let alerts = AlertChannel::new(config.alerts.clone());

    let worker = Arc::new(Worker::new(WorkerDeps {
        queue: queue.clone(),
        sessions: sessions.clone(),
        context: context.clone(),
        archive: archive.clone(),
        model: model.clone(),
        nudges: NudgeStore::new(config.paths.nudges_file()),
        anomalies: AnomalyStore::new(config.paths.anomalies_file()),
        alerts: alerts.clone(),
        degradation: degradation.clone(),
        backups: backups.clone(),
        config: config.worker.clone(),
        learning_mode: false,
        integrity: config.integrity.clone(),
        kb_root: config.kb.kb_root.clone(),
        settings_file: config.paths.settings_file(),
    }));

    let state = AppState {
        config: config.clone(),
        degradation,
        archive,
        context,
        model: model.clone(),
        sessions,
        transcripts: TranscriptStore::new(config.paths.transcripts_dir.clone()),
        nudges: NudgeStore::new(config.paths.nudges_file()),
        anomalies: AnomalyStore::new(config.paths.anomalies_file()),
        queue,
        worker,
        watcher: None,
        backups,
        alerts,
        started_at: Instant::now(),
    };

    Fixture {
        _data: data,
        _kb: kb,
        state,
        model,
    }
}

async fn call(state: &AppState, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let app = router(state.clone());
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, value)
}

#[tokio::test]
async fn fresh_start_load_is_degraded_and_empty() {
    let f = fixture();
    let (status, body) = call(&f.state, "POST", "/api/load", Some(json!({}))).await;

    assert_eq!(status, StatusCode::OK);
    let session_id = body["session_id"].as_str().unwrap();
    let re = regex_lite(session_id);
    assert!(re, "session id {session_id} does not match ce-YYYYMMDD-8hex");
    assert_eq!(body["degraded"], json!(true));
    assert_eq!(body["archive_hits"], json!([]));
    assert_eq!(body["nudges"], json!([]));
}

// Minimal shape check for `ce-{yyyymmdd}-{8 hex}` without pulling a
// regex crate into the test.
fn regex_lite(id: &str) -> bool {
    let parts: Vec<&str> = id.split('-').collect();
    parts.len() == 3
        && parts[0] == "ce"
        && parts[1].len() == 8
        && parts[1].chars().all(|c| c.is_ascii_digit())
        && parts[2].len() == 8
        && parts[2].chars().all(|c| c.is_ascii_hexdigit())
}

#[tokio::test]
async fn lite_save_triggers_field_extraction_and_enqueues() {
    let f = fixture();
    let (status, body) = call(
        &f.state,
        "POST",
        "/api/save",
        Some(json!({
            "session_id": "ce-20260101-aaaaaaaa",
            "summary": "rebooted pg to fix hung query",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["worker_queued"], json!(true));

    // The extraction model saw the user's note.
    let notes = f.model.extract_notes.lock().unwrap().clone();
    assert_eq!(notes, vec!["rebooted pg to fix hung query".to_string()]);

    // The persisted record carries extracted fields and is queued.
    let record = f
        .state
        .sessions
        .read(&f.state.sessions.path_for("ce-20260101-aaaaaaaa"))
        .unwrap();
    assert!(!record.tags.is_empty());
    assert!(record.summary.len() >= "rebooted pg to fix hung query".len());
    assert!(!record.decisions.is_empty());
    assert_eq!(f.state.queue.len(), 1);
}

#[tokio::test]
async fn explicit_fields_skip_extraction() {
    let f = fixture();
    let (status, _) = call(
        &f.state,
        "POST",
        "/api/save",
        Some(json!({
            "session_id": "ce-20260101-bbbbbbbb",
            "summary": "full save",
            "tags": ["explicit"],
            "decisions": ["kept everything"],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(f.model.extract_notes.lock().unwrap().is_empty());
    let record = f
        .state
        .sessions
        .read(&f.state.sessions.path_for("ce-20260101-bbbbbbbb"))
        .unwrap();
    assert_eq!(record.tags, vec!["explicit".to_string()]);
}

#[tokio::test]
async fn nudges_deduplicate_across_stores() {
    let f = fixture();
    f.state.nudges.store(
        &[NudgeDraft {
            message: "Follow up on loki migration".into(),
            kind: "followup".into(),
            priority: "medium".into(),
            expires_after_days: None,
        }],
        None,
    );
    f.state.nudges.store(
        &[NudgeDraft {
            message: "follow up on Loki migration".into(),
            kind: "followup".into(),
            priority: "medium".into(),
            expires_after_days: None,
        }],
        None,
    );

    let (status, body) = call(&f.state, "GET", "/api/nudges", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nudges"].as_array().unwrap().len(), 1);

    let (_, dismissed) = call(
        &f.state,
        "POST",
        "/api/nudges/dismiss",
        Some(json!({"message": "loki"})),
    )
    .await;
    assert_eq!(dismissed["dismissed"], json!(true));
    let (_, after) = call(&f.state, "GET", "/api/nudges", None).await;
    assert_eq!(after["nudges"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn correct_hot_replaces_in_master() {
    let f = fixture();
    let master = format!(
        "# Master Context\n\nThe ingest API listens on port 9050.\n{}",
        "padding line to pass the cache threshold. ".repeat(3)
    );
    f.state.context.write_master(&master, "seed").await.unwrap();

    let (status, body) = call(
        &f.state,
        "POST",
        "/api/correct",
        Some(json!({
            "item": "port 9050",
            "correction": "port 9040",
            "scope": "hot",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hot_updated"], json!(true));
    let updated = f.state.context.read_master().unwrap();
    assert!(updated.contains("port 9040"));
    assert!(!updated.contains("port 9050"));
}

#[tokio::test]
async fn correct_hot_falls_back_to_case_insensitive_match() {
    let f = fixture();
    // "İ" lowercases to a longer UTF-8 sequence, so byte offsets into a
    // lowercased copy would not line up with the original text.
    let master = format!(
        "# Master Context\n\nİstanbul edge node exposes Port 9050 for ingest.\n{}",
        "padding line to pass the cache threshold. ".repeat(3)
    );
    f.state.context.write_master(&master, "seed").await.unwrap();

    let (status, body) = call(
        &f.state,
        "POST",
        "/api/correct",
        Some(json!({
            "item": "port 9050",
            "correction": "port 9040",
            "scope": "hot",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hot_updated"], json!(true));
    let updated = f.state.context.read_master().unwrap();
    assert!(updated.contains("İstanbul edge node exposes port 9040 for ingest."));
    assert!(!updated.contains("Port 9050"));
}

#[tokio::test]
async fn search_round_trip_finds_session_digest() {
    let f = fixture();
    f.state
        .archive
        .add_document(
            "sessions",
            "session-ce-1",
            "migrated the billing queue to rabbitmq",
            [("session_id".to_string(), json!("ce-1"))].into_iter().collect(),
        )
        .await
        .unwrap();

    let (status, body) = call(
        &f.state,
        "POST",
        "/api/search",
        Some(json!({"query": "billing queue rabbitmq migration", "limit": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["id"], json!("session-ce-1"));
    assert!(results[0]["relevance"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn ingest_requires_key_when_configured() {
    let mut f = fixture();
    {
        let config = Arc::make_mut(&mut f.state.config);
        config.server.ingest_api_key = Some("sekrit".to_string());
    }

    let (status, _) = call(
        &f.state,
        "POST",
        "/api/ingest",
        Some(json!({"summary": "from ci", "source": "github-actions"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(
        &f.state,
        "POST",
        "/api/ingest?api_key=sekrit",
        Some(json!({"summary": "from ci", "source": "github-actions"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("accepted"));
    assert!(body["session_id"].as_str().unwrap().starts_with("github-actions-"));
}

#[tokio::test]
async fn health_and_degradation_report_level() {
    let f = fixture();
    let (status, body) = call(&f.state, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["degradation_level"], json!("full"));

    let (status, body) = call(&f.state, "GET", "/api/degradation", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["level"], json!("full"));
    assert_eq!(
        body["dependencies"]["openrouter"]["circuit_breaker"],
        json!("closed")
    );
}

#[tokio::test]
async fn metrics_exposition_contains_core_series() {
    let f = fixture();
    let (status, body) = call(&f.state, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap().to_string();
    assert!(text.contains("engram_uptime_seconds"));
    assert!(text.contains("engram_worker_queue_depth"));
    assert!(text.contains("engram_degradation_level"));
}

#[tokio::test]
async fn load_response_honors_character_budget() {
    let mut f = fixture();
    {
        let config = Arc::make_mut(&mut f.state.config);
        config.budgets.max_load_response_chars = 1_500;
    }
    let master = format!("# Master Context\n\n{}", "m".repeat(600));
    f.state.context.write_master(&master, "seed").await.unwrap();

    for i in 0..5 {
        f.state
            .archive
            .add_document(
                "sessions",
                &format!("session-{i}"),
                &format!("observability stack notes {} {}", i, "x".repeat(700)),
                Default::default(),
            )
            .await
            .unwrap();
    }

    let (status, body) = call(
        &f.state,
        "POST",
        "/api/load",
        Some(json!({"topic": "observability stack notes"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let master_len = body["master_context"].as_str().unwrap().len();
    let hits_len: usize = body["archive_hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["content"].as_str().unwrap().len())
        .sum();
    assert!(master_len + hits_len <= 1_500);
}
