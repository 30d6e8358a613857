//! Shared application state handed to every handler.

use std::sync::Arc;
use std::time::Instant;

use engram_archive::Archive;
use engram_config::AppConfig;
use engram_model_client::LanguageModel;
use engram_resilience::DegradationManager;
use engram_stores::{
    AlertChannel, AnomalyStore, BackupManager, ContextStore, NudgeStore, SessionStore,
    TranscriptStore,
};
use engram_watcher::InfraWatcher;
use engram_worker::{SessionQueue, Worker};

pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub degradation: Arc<DegradationManager>,
    pub archive: Arc<Archive>,
    pub context: Arc<ContextStore>,
    pub model: Arc<dyn LanguageModel>,
    pub sessions: SessionStore,
    pub transcripts: TranscriptStore,
    pub nudges: NudgeStore,
    pub anomalies: AnomalyStore,
    pub queue: Arc<SessionQueue>,
    pub worker: Arc<Worker>,
    pub watcher: Option<Arc<InfraWatcher>>,
    pub backups: Arc<BackupManager>,
    pub alerts: AlertChannel,
    pub started_at: Instant,
}

impl AppState {
    /// The effective learning-mode flag: settings override wins over the
    /// environment.
    pub fn learning_mode(&self) -> bool {
        engram_config::RuntimeSettings::load(&self.config.paths.settings_file())
            .learning_mode
            .unwrap_or(self.config.server.learning_mode)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}
