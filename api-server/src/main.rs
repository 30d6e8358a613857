//! Engram server binary: composition root and HTTP entry point.
//!
//! Construction order is config, degradation manager, vector archive,
//! context store, model client, worker, watcher, HTTP listener; teardown
//! runs in reverse with the in-flight session allowed to finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use engram_api_server::ops::TranscriptSink;
use engram_api_server::{router, AppState};
use engram_archive::{Archive, ChromaHttpStore};
use engram_config::{AppConfig, RuntimeSettings};
use engram_model_client::OpenRouterClient;
use engram_resilience::{CacheSource, DegradationManager, DEP_VECTOR_STORE};
use engram_stores::{
    AlertChannel, AnomalyStore, BackupManager, ContextStore, NudgeStore, SessionStore,
    TranscriptStore,
};
use engram_watcher::InfraWatcher;
use engram_worker::{SessionQueue, Worker, WorkerDeps};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "engram-server", about = "Persistent memory service for conversational agents")]
struct Args {
    /// Override the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,
    /// Override the DATA_DIR environment variable.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_env().context("configuration invalid")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.paths.sessions_dir = data_dir.join("sessions");
        config.paths.transcripts_dir = data_dir.join("transcripts");
        config.paths.backups_dir = data_dir.join("backups");
        config.paths.data_dir = data_dir;
    }
    let config = Arc::new(config);

    info!("engram v{} starting up", env!("CARGO_PKG_VERSION"));
    info!("  port: {}", config.server.port);
    info!("  learning mode: {}", config.server.learning_mode);

    std::fs::create_dir_all(&config.paths.sessions_dir)?;
    std::fs::create_dir_all(&config.paths.transcripts_dir)?;
    std::fs::create_dir_all(&config.paths.backups_dir)?;

    // Degradation manager first: everything else reports into it.
    let degradation = Arc::new(DegradationManager::new());

    // Vector archive.
    let store = Arc::new(ChromaHttpStore::new(
        config.vector_store.base_url(),
        config.vector_store.timeout_secs,
    ));
    let archive = Arc::new(Archive::new(store, degradation.clone()));
    if archive.is_connected().await {
        info!("  vector store: connected");
        if let Err(e) = archive.ensure_collections().await {
            warn!("  vector store: collection init failed: {e}");
        }
    } else {
        degradation.mark_unhealthy(DEP_VECTOR_STORE, "not reachable at startup");
        warn!("  vector store: NOT connected, degraded mode");
    }

    // Context store, seeding the last-known-good cache.
    let context = Arc::new(ContextStore::new(
        config.kb.kb_root.clone(),
        config.kb.master_context_rel.clone(),
        config.paths.local_master_context(),
        config.kb.standalone_mode,
        degradation.clone(),
    ));
    match context.read_master() {
        Some(master) => {
            degradation.update_cache(&master, CacheSource::Startup);
            info!("  context cache: initialized ({} bytes)", master.len());
        }
        None => warn!("  master context: not available yet"),
    }

    // Model client, with persisted settings layered over the environment.
    let settings = RuntimeSettings::load(&config.paths.settings_file());
    let mut model_config = config.model.clone();
    if let Some(base_url) = settings.llm.base_url {
        model_config.base_url = base_url;
    }
    if let Some(fast) = settings.llm.fast_model {
        model_config.fast_model = fast;
    }
    if let Some(smart) = settings.llm.smart_model {
        model_config.smart_model = smart;
    }
    if model_config.api_key.is_empty() {
        warn!("  model: API key not configured, pipeline will stall");
    } else {
        info!("  model: configured ({} / {})", model_config.fast_model, model_config.smart_model);
    }
    let model = Arc::new(OpenRouterClient::new(model_config, degradation.clone()));

    // Queue, durable stores, worker.
    let queue = Arc::new(SessionQueue::new());
    let sessions = SessionStore::new(config.paths.sessions_dir.clone());
    let transcripts = TranscriptStore::new(config.paths.transcripts_dir.clone());
    let nudges = NudgeStore::new(config.paths.nudges_file());
    let anomalies = AnomalyStore::new(config.paths.anomalies_file());
    let alerts = AlertChannel::new(config.alerts.clone());
    let backups = Arc::new(BackupManager::new(
        config.paths.backups_dir.clone(),
        config.paths.nudges_file(),
        config.paths.anomalies_file(),
        config.paths.sessions_dir.clone(),
        config.backup_store.clone(),
    ));

    let worker = Arc::new(Worker::new(WorkerDeps {
        queue: queue.clone(),
        sessions: sessions.clone(),
        context: context.clone(),
        archive: archive.clone(),
        model: model.clone(),
        nudges: nudges.clone(),
        anomalies: anomalies.clone(),
        alerts: alerts.clone(),
        degradation: degradation.clone(),
        backups: backups.clone(),
        config: config.worker.clone(),
        learning_mode: settings.learning_mode.unwrap_or(config.server.learning_mode),
        integrity: config.integrity.clone(),
        kb_root: config.kb.kb_root.clone(),
        settings_file: config.paths.settings_file(),
    }));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker_handle = tokio::spawn(worker.clone().run(shutdown_rx.clone()));

    let mut state = AppState {
        config: config.clone(),
        degradation,
        archive,
        context,
        model,
        sessions: sessions.clone(),
        transcripts,
        nudges,
        anomalies,
        queue: queue.clone(),
        worker,
        watcher: None,
        backups,
        alerts: alerts.clone(),
        started_at: Instant::now(),
    };

    // Watcher last: it feeds the queue and checkpoints through the state
    // assembled above.
    if config.watcher.enabled() {
        let sink = Arc::new(TranscriptSink {
            state: state.clone(),
        });
        let watcher = Arc::new(InfraWatcher::new(
            config.watcher.clone(),
            sessions,
            queue,
            alerts,
            Some(sink),
        ));
        watcher.clone().start(shutdown_rx.clone());
        state.watcher = Some(watcher);
        info!("  watcher: monitoring {} dirs", config.watcher.watch_dirs.len());
    } else {
        info!("  watcher: disabled (WATCH_DIRS not set)");
    }

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("engram ready on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("engram shutting down");
        })
        .await
        .context("server error")?;

    // Reverse teardown: stop producers and let the in-flight session
    // finish before exiting.
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;
    info!("engram shutdown complete");
    Ok(())
}
