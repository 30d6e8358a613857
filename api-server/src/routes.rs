//! Route table.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::metrics;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/api/load", post(handlers::load))
        .route("/api/save", post(handlers::save))
        .route("/api/checkpoint", post(handlers::checkpoint))
        .route("/api/search", post(handlers::search).get(handlers::search_get))
        .route("/api/correct", post(handlers::correct))
        .route("/api/ingest", post(handlers::ingest))
        .route("/api/ingest/raw", post(handlers::ingest_raw))
        .route("/api/ingest/sources", get(handlers::ingest_sources))
        .route("/api/health", get(handlers::health))
        .route("/api/summary", get(handlers::summary))
        .route("/api/stats", get(handlers::stats))
        .route("/api/worker", get(handlers::worker_status))
        .route("/api/degradation", get(handlers::degradation))
        .route("/api/nudges", get(handlers::list_nudges))
        .route("/api/nudges/dismiss", post(handlers::dismiss_nudge))
        .route("/api/anomalies", get(handlers::list_anomalies))
        .route("/api/anomalies/dismiss", post(handlers::dismiss_anomaly))
        .route("/api/transcripts", get(handlers::list_transcripts))
        .route("/api/backup/create", post(handlers::backup_create))
        .route("/api/backup/list", get(handlers::backup_list))
        .route("/api/backup/restore", post(handlers::backup_restore))
        .route("/api/retention", get(handlers::retention_info))
        .route("/api/retention/run", post(handlers::retention_run))
        .route(
            "/api/settings",
            get(handlers::settings_get).post(handlers::settings_put),
        )
        .route("/api/settings/test-llm", post(handlers::settings_test_llm))
        .route(
            "/api/internal/master-context",
            get(handlers::internal_master_context),
        )
        .route("/api/bootstrap/status", get(handlers::bootstrap_status))
        .route("/api/bootstrap/reprocess", post(handlers::bootstrap_reprocess))
        .route("/metrics", get(metrics::metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
