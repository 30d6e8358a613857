//! HTTP handlers.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::Utc;
use engram_archive::run_retention;
use engram_config::{RuntimeSettings, ALL_COLLECTIONS};
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::models::*;
use crate::ops;
use crate::state::{AppState, SERVICE_VERSION};

// --- core operations ---

pub async fn load(
    State(state): State<AppState>,
    request: Option<Json<LoadRequest>>,
) -> Json<LoadResponse> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    Json(ops::perform_load(&state, request).await)
}

pub async fn save(
    State(state): State<AppState>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, ApiError> {
    if request.summary.is_empty() {
        return Err(ApiError::BadRequest("summary is required".to_string()));
    }
    Ok(Json(ops::perform_save(&state, request).await))
}

pub async fn checkpoint(
    State(state): State<AppState>,
    Json(request): Json<CheckpointRequest>,
) -> Result<Json<CheckpointResponse>, ApiError> {
    if request.note.is_empty() {
        return Err(ApiError::BadRequest("note is required".to_string()));
    }
    Ok(Json(ops::perform_checkpoint(&state, request).await))
}

pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    if request.query.is_empty() {
        return Err(ApiError::BadRequest("query is required".to_string()));
    }
    Ok(Json(ops::perform_search(&state, request).await))
}

pub async fn search_get(
    State(state): State<AppState>,
    Query(params): Query<SearchQueryParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let request = SearchRequest {
        query: params.query,
        collections: params
            .collections
            .map(|raw| raw.split(',').map(|c| c.trim().to_string()).collect()),
        limit: params.limit.unwrap_or(10),
        date_after: None,
        date_before: None,
        tags: None,
    };
    if request.query.is_empty() {
        return Err(ApiError::BadRequest("query is required".to_string()));
    }
    Ok(Json(ops::perform_search(&state, request).await))
}

pub async fn correct(
    State(state): State<AppState>,
    Json(request): Json<CorrectRequest>,
) -> Json<CorrectResponse> {
    Json(ops::perform_correct(&state, request).await)
}

// --- webhook ingest ---

fn check_ingest_auth(
    state: &AppState,
    headers: &HeaderMap,
    query_key: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected) = state.config.server.ingest_api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or(query_key);
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct ApiKeyQuery {
    pub api_key: Option<String>,
}

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    Json(payload): Json<IngestPayload>,
) -> Result<Json<Value>, ApiError> {
    check_ingest_auth(&state, &headers, query.api_key.as_deref())?;
    let source = payload.source.clone();
    let (session_id, queued) = ops::perform_ingest(&state, payload);
    Ok(Json(json!({
        "status": "accepted",
        "session_id": session_id,
        "worker_queued": queued,
        "message": format!("Context from {source} queued for processing"),
    })))
}

pub async fn ingest_raw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    Json(payload): Json<RawIngestPayload>,
) -> Result<Json<Value>, ApiError> {
    check_ingest_auth(&state, &headers, query.api_key.as_deref())?;
    let source = payload.source.clone();
    let (session_id, text_length, queued) = ops::perform_ingest_raw(&state, payload);
    Ok(Json(json!({
        "status": "accepted",
        "session_id": session_id,
        "worker_queued": queued,
        "message": format!("Raw text from {source} queued for processing"),
        "text_length": text_length,
    })))
}

pub async fn ingest_sources(State(state): State<AppState>) -> Json<Value> {
    let mut sources: std::collections::BTreeMap<String, (usize, String)> = Default::default();
    for path in state.sessions.list() {
        let Ok(record) = state.sessions.read(&path) else {
            continue;
        };
        let via = record.ingested_via.as_deref().unwrap_or("mcp");
        let key = format!("{} ({via})", record.source);
        let entry = sources.entry(key).or_insert((0, String::new()));
        entry.0 += 1;
        if record.created_at > entry.1 {
            entry.1 = record.created_at.clone();
        }
    }
    let sources: serde_json::Map<String, Value> = sources
        .into_iter()
        .map(|(key, (count, latest))| (key, json!({"count": count, "latest": latest})))
        .collect();
    Json(json!({ "sources": sources }))
}

// --- health / status ---

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let level = state.degradation.level();
    let (sessions_count, _, _) = state.sessions.counts();
    Json(HealthResponse {
        status: if matches!(
            level,
            engram_resilience::DegradationLevel::Full | engram_resilience::DegradationLevel::Partial
        ) {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        version: SERVICE_VERSION.to_string(),
        vector_store_connected: state.archive.is_connected().await,
        context_accessible: state.context.accessible(),
        sessions_count,
        uptime_seconds: (state.uptime_seconds() * 10.0).round() / 10.0,
        learning_mode: state.learning_mode(),
        degradation_level: level.as_str().to_string(),
    })
}

pub async fn summary(State(state): State<AppState>) -> Json<Value> {
    let level = state.degradation.level();
    let content = state
        .context
        .read_master()
        .or_else(|| state.degradation.cached_context());
    let Some(content) = content else {
        return Json(json!({
            "summary": "Engram is active but the master context has not been created yet.",
            "tokens_estimate": 10,
            "degraded": true,
            "degradation_level": level.as_str(),
        }));
    };
    let summary = if content.chars().count() > 2000 {
        let clipped: String = content.chars().take(2000).collect();
        format!("{clipped}\n\n[... truncated ...]")
    } else {
        content
    };
    Json(json!({
        "tokens_estimate": summary.split_whitespace().count(),
        "degraded": level != engram_resilience::DegradationLevel::Full,
        "degradation_level": level.as_str(),
        "summary": summary,
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let (total, processed, unprocessed) = state.sessions.counts();

    let mut recent: Vec<(std::time::SystemTime, Value)> = Vec::new();
    for path in state.sessions.list() {
        let Ok(record) = state.sessions.read(&path) else {
            continue;
        };
        let modified = path
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        recent.push((
            modified,
            json!({
                "session_id": record.session_id,
                "significance": record.significance.as_str(),
                "processed": record.is_processed(),
                "summary_preview": record.summary.chars().take(120).collect::<String>(),
            }),
        ));
    }
    recent.sort_by(|a, b| b.0.cmp(&a.0));
    let recent_sessions: Vec<Value> = recent.into_iter().take(20).map(|(_, v)| v).collect();

    let collections = if state.archive.is_connected().await {
        json!(state.archive.collection_stats().await)
    } else {
        json!({})
    };

    Json(json!({
        "sessions": {"total": total, "processed": processed, "unprocessed": unprocessed},
        "recent_sessions": recent_sessions,
        "archive_collections": collections,
        "context_accessible": state.context.accessible(),
        "learning_mode": state.learning_mode(),
        "worker": state.worker.status(),
        "watcher": state.watcher.as_ref().map(|w| json!(w.stats())).unwrap_or(json!({"enabled": false})),
        "llm": {"calls": state.model.call_count()},
    }))
}

pub async fn worker_status(State(state): State<AppState>) -> Json<Value> {
    let mut status = serde_json::to_value(state.worker.status()).unwrap_or(json!({}));
    if let Some(object) = status.as_object_mut() {
        object.insert("llm".to_string(), json!({"calls": state.model.call_count()}));
    }
    Json(status)
}

pub async fn degradation(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.degradation.status()).unwrap_or(json!({})))
}

// --- advisories ---

pub async fn list_nudges(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "nudges": state.nudges.get_active(10),
        "stats": state.nudges.stats(),
    }))
}

pub async fn dismiss_nudge(
    State(state): State<AppState>,
    Json(request): Json<DismissRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.message.is_empty() {
        return Err(ApiError::BadRequest("message field required".to_string()));
    }
    Ok(Json(json!({
        "dismissed": state.nudges.dismiss(&request.message),
        "query": request.message,
    })))
}

pub async fn list_anomalies(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "anomalies": state.anomalies.get_active(),
        "stats": state.anomalies.stats(),
    }))
}

pub async fn dismiss_anomaly(
    State(state): State<AppState>,
    Json(request): Json<DismissRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.message.is_empty() {
        return Err(ApiError::BadRequest("description field required".to_string()));
    }
    Ok(Json(json!({
        "dismissed": state.anomalies.dismiss(&request.message),
        "query": request.message,
    })))
}

// --- transcripts ---

pub async fn list_transcripts(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "transcripts": state.transcripts.list(50) }))
}

// --- backup ---

pub async fn backup_create(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summary = state
        .backups
        .create(&state.archive, &state.context, false)
        .await
        .map_err(|e| ApiError::Internal(format!("backup failed: {e}")))?;
    Ok(Json(json!({
        "success": true,
        "backup_name": summary.name,
        "components": summary.components,
        "total_size_bytes": summary.total_size_bytes,
        "mirrored": summary.mirrored,
    })))
}

pub async fn backup_list(State(state): State<AppState>) -> Json<Value> {
    let backups = state.backups.list().await;
    Json(json!({
        "count": backups.len(),
        "backups": backups,
    }))
}

pub async fn backup_restore(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<Value>, ApiError> {
    let restored = state
        .backups
        .restore(
            &state.archive,
            &state.context,
            &request.backup_name,
            request.components.as_deref(),
        )
        .await
        .map_err(ApiError::NotFound)?;
    Ok(Json(json!({
        "success": true,
        "backup_name": request.backup_name,
        "restored": restored,
    })))
}

// --- retention ---

pub async fn retention_info(State(state): State<AppState>) -> Json<Value> {
    let settings = RuntimeSettings::load(&state.config.paths.settings_file());
    let policies: serde_json::Map<String, Value> = ALL_COLLECTIONS
        .iter()
        .map(|spec| {
            (
                spec.name.to_string(),
                json!({
                    "days": settings.retention.days_for(spec.name),
                    "default_days": spec.retention_days,
                    "description": spec.description,
                }),
            )
        })
        .collect();
    Json(json!({ "policies": policies }))
}

pub async fn retention_run(
    State(state): State<AppState>,
    request: Option<Json<RetentionRunRequest>>,
) -> Json<Value> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let settings = RuntimeSettings::load(&state.config.paths.settings_file());
    let overrides = request.overrides.unwrap_or_default();
    let reports = run_retention(
        &state.archive,
        |collection| {
            overrides
                .get(collection)
                .copied()
                .unwrap_or_else(|| settings.retention.days_for(collection))
        },
        request.dry_run,
    )
    .await;
    let total_pruned: usize = reports.iter().map(|r| r.pruned).sum();
    Json(json!({
        "dry_run": request.dry_run,
        "total_pruned": total_pruned,
        "collections": reports,
    }))
}

// --- settings ---

pub async fn settings_get(State(state): State<AppState>) -> Json<Value> {
    let settings = RuntimeSettings::load(&state.config.paths.settings_file());
    Json(json!({
        "settings": settings,
        "learning_mode_effective": state.learning_mode(),
    }))
}

pub async fn settings_put(
    State(state): State<AppState>,
    Json(settings): Json<RuntimeSettings>,
) -> Result<Json<Value>, ApiError> {
    settings
        .save(&state.config.paths.settings_file())
        .map_err(|e| ApiError::Internal(format!("settings save failed: {e}")))?;
    info!("settings: updated");
    Ok(Json(json!({"saved": true, "settings": settings})))
}

pub async fn settings_test_llm(State(state): State<AppState>) -> Json<Value> {
    match state.model.ping().await {
        Ok(latency_ms) => Json(json!({
            "ok": true,
            "latency_ms": (latency_ms * 10.0).round() / 10.0,
        })),
        Err(e) => Json(json!({
            "ok": false,
            "error": e.to_string(),
        })),
    }
}

// --- bootstrap ---

pub async fn bootstrap_status(State(state): State<AppState>) -> Json<Value> {
    let (total, processed, unprocessed) = state.sessions.counts();
    let master = state.context.read_master();
    let collections = if state.archive.is_connected().await {
        json!(state.archive.collection_stats().await)
    } else {
        json!({"error": "vector store not available"})
    };

    let recommendation = if master.is_none() && total == 0 {
        "fresh install: save a first session to begin building context"
    } else if unprocessed > 0 {
        "unprocessed session files found: POST /api/bootstrap/reprocess to queue them"
    } else {
        "state looks consistent"
    };

    Json(json!({
        "master_context_exists": master.is_some(),
        "master_context_size": master.map(|m| m.len()).unwrap_or(0),
        "cache_available": state.degradation.cached_context().is_some(),
        "session_files": {"total": total, "processed": processed, "unprocessed": unprocessed},
        "archive_collections": collections,
        "degradation_level": state.degradation.level().as_str(),
        "recommendation": recommendation,
    }))
}

pub async fn bootstrap_reprocess(State(state): State<AppState>) -> Json<Value> {
    let mut queued = 0;
    let mut skipped = 0;
    for path in state.sessions.list() {
        let Ok(record) = state.sessions.read(&path) else {
            continue;
        };
        if record.is_processed() {
            skipped += 1;
            continue;
        }
        state.queue.enqueue(record.session_id, path);
        queued += 1;
    }
    info!("bootstrap: re-queued {queued} sessions ({skipped} already processed)");
    Json(json!({
        "queued": queued,
        "skipped_processed": skipped,
        "queue_depth": state.queue.len(),
    }))
}

// --- internal ---

/// Raw master context, for diagnostics and test harnesses.
pub async fn internal_master_context(State(state): State<AppState>) -> Json<Value> {
    match state.context.read_master() {
        Some(content) => Json(json!({
            "exists": true,
            "length": content.len(),
            "master_context": content,
        })),
        None => Json(json!({
            "exists": false,
            "length": 0,
            "master_context": Value::Null,
        })),
    }
}

// --- root ---

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "engram",
        "version": SERVICE_VERSION,
        "started": Utc::now().to_rfc3339(),
    }))
}
