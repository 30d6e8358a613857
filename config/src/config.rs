//! Application configuration loaded from environment variables.
//!
//! Every knob has a default suitable for a single-node deployment; the
//! only fatal conditions are values that fail to parse. Secrets (model
//! API key, object-store credentials, alert token) are read but never
//! logged.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration load failure. Startup aborts with a non-zero exit on any
/// of these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("missing required variable {0}")]
    Missing(&'static str),
}

fn env_string(var: &'static str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_opt(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn env_bool(var: &'static str, default: bool) -> bool {
    match env::var(var) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(v) => v.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            var,
            value: v,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_list(var: &'static str) -> Vec<String> {
    env::var(var)
        .map(|v| {
            v.split([',', ':'])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub debug: bool,
    /// In learning mode the pipeline archives aggressively: low-significance
    /// sessions are processed, triage `discard` is demoted to `archive`, and
    /// model-generated nudges/anomalies are suppressed.
    pub learning_mode: bool,
    /// Optional shared secret gating /api/ingest. Absent = open access.
    pub ingest_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub backups_dir: PathBuf,
}

impl PathsConfig {
    pub fn nudges_file(&self) -> PathBuf {
        self.data_dir.join("nudges.json")
    }

    pub fn anomalies_file(&self) -> PathBuf {
        self.data_dir.join("anomalies.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn local_master_context(&self) -> PathBuf {
        self.data_dir.join("master-context.md")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    /// Root of the external versioned knowledge-base mount.
    pub kb_root: PathBuf,
    /// Path of the master context inside the KB, relative to `kb_root`.
    pub master_context_rel: String,
    /// When set, the external KB is never consulted even if mounted.
    pub standalone_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl VectorStoreConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    /// Cheap tier: extraction, summaries, nudges, anomalies.
    pub fast_model: String,
    /// Strong tier: triage, master compression, pattern analysis.
    pub smart_model: String,
    /// Fast-model identifier -> the model used for the single retry when
    /// the first structured result is missing or hedged.
    pub escalation: HashMap<String, String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pipeline starts per minute. The worker sleeps
    /// `60 / rate_limit_per_min` seconds between consecutive sessions.
    pub rate_limit_per_min: u32,
    pub idle_poll_secs: u64,
    /// Seconds of idle time between automatic backup + retention sweeps.
    pub maintenance_interval_secs: u64,
    /// Back-off after hitting an open model circuit breaker.
    pub breaker_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub watch_dirs: Vec<PathBuf>,
    pub git_root: PathBuf,
    pub transcript_drop_dir: Option<PathBuf>,
    pub debounce_seconds: u64,
}

impl WatcherConfig {
    pub fn enabled(&self) -> bool {
        !self.watch_dirs.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

impl AlertConfig {
    pub fn enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStoreConfig {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: String,
    pub secure: bool,
}

impl BackupStoreConfig {
    pub fn enabled(&self) -> bool {
        self.endpoint.is_some() && self.access_key.is_some() && self.secret_key.is_some()
    }
}

/// Character budgets for the master context and load responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub master_base_chars: usize,
    pub master_per_project_chars: usize,
    pub master_per_source_chars: usize,
    pub master_ceiling_chars: usize,
    /// Legacy flat cap. When set it overrides the dynamic budget entirely.
    pub master_flat_budget: Option<usize>,
    pub max_load_response_chars: usize,
    /// Minimum content kept per archive hit when trimming a load response.
    pub min_chars_per_hit: usize,
    pub max_transcript_chars: usize,
}

impl BudgetConfig {
    /// Dynamic master-context budget: grows with tracked projects and
    /// ingest sources up to the ceiling.
    pub fn master_budget(&self, active_projects: usize, active_sources: usize) -> usize {
        if let Some(flat) = self.master_flat_budget {
            return flat;
        }
        let dynamic = self.master_base_chars
            + self.master_per_project_chars * active_projects
            + self.master_per_source_chars * active_sources;
        dynamic.min(self.master_ceiling_chars)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Domain roots whose subdomains count as infrastructure facts.
    pub domain_roots: Vec<String>,
    /// Known project names matched verbatim in addition to the
    /// `project:`/`system:`/`platform:` patterns.
    pub known_projects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub kb: KnowledgeBaseConfig,
    pub vector_store: VectorStoreConfig,
    pub model: ModelConfig,
    pub worker: WorkerConfig,
    pub watcher: WatcherConfig,
    pub alerts: AlertConfig,
    pub backup_store: BackupStoreConfig,
    pub budgets: BudgetConfig,
    pub integrity: IntegrityConfig,
}

impl AppConfig {
    /// Load the full configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(env_string("DATA_DIR", "/app/data"));
        let sessions_dir = env_opt("SESSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sessions"));
        let transcripts_dir = env_opt("TRANSCRIPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("transcripts"));
        let backups_dir = data_dir.join("backups");

        let fast_model = env_string("MODEL_FAST", "anthropic/claude-haiku-4.5");
        let smart_model = env_string("MODEL_SMART", "anthropic/claude-sonnet-4.5");
        let mut escalation = HashMap::new();
        escalation.insert(fast_model.clone(), smart_model.clone());
        if let Some(extra) = env_opt("MODEL_ESCALATION") {
            // "from=to,from=to" pairs
            for pair in extra.split(',') {
                if let Some((from, to)) = pair.split_once('=') {
                    escalation.insert(from.trim().to_string(), to.trim().to_string());
                }
            }
        }

        let master_flat_budget = match env_opt("MASTER_FLAT_BUDGET") {
            Some(v) => Some(v.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                var: "MASTER_FLAT_BUDGET",
                value: v,
                reason: e.to_string(),
            })?),
            None => None,
        };

        let mut domain_roots = env_list("DOMAIN_ROOTS");
        if domain_roots.is_empty() {
            domain_roots = vec![
                "example.com".to_string(),
                "example.org".to_string(),
                "github.com".to_string(),
                "openrouter.ai".to_string(),
            ];
        }

        Ok(Self {
            server: ServerConfig {
                port: env_parse("PORT", 9040)?,
                debug: env_bool("DEBUG", false),
                learning_mode: env_bool("LEARNING_MODE", true),
                ingest_api_key: env_opt("INGEST_API_KEY"),
            },
            paths: PathsConfig {
                data_dir,
                sessions_dir,
                transcripts_dir,
                backups_dir,
            },
            kb: KnowledgeBaseConfig {
                kb_root: PathBuf::from(env_string("KB_ROOT", "/data/kb")),
                master_context_rel: env_string(
                    "MASTER_CONTEXT_PATH",
                    "projects/engram/master-context.md",
                ),
                standalone_mode: env_bool("STANDALONE_MODE", false),
            },
            vector_store: VectorStoreConfig {
                host: env_string("VECTOR_STORE_HOST", "engram-vectors"),
                port: env_parse("VECTOR_STORE_PORT", 8000)?,
                timeout_secs: env_parse("VECTOR_STORE_TIMEOUT_SECS", 30)?,
            },
            model: ModelConfig {
                base_url: env_string("MODEL_BASE_URL", "https://openrouter.ai/api/v1"),
                api_key: env_string("MODEL_API_KEY", ""),
                fast_model,
                smart_model,
                escalation,
                timeout_secs: env_parse("MODEL_TIMEOUT_SECS", 60)?,
            },
            worker: WorkerConfig {
                rate_limit_per_min: env_parse("WORKER_RATE_LIMIT_PER_MIN", 1)?,
                idle_poll_secs: env_parse("WORKER_IDLE_POLL_SECS", 5)?,
                maintenance_interval_secs: env_parse("WORKER_MAINTENANCE_SECS", 86_400)?,
                breaker_backoff_secs: env_parse("WORKER_BREAKER_BACKOFF_SECS", 30)?,
            },
            watcher: WatcherConfig {
                watch_dirs: env_list("WATCH_DIRS").into_iter().map(PathBuf::from).collect(),
                git_root: PathBuf::from(env_string("WATCH_GIT_ROOT", "/data/infra")),
                transcript_drop_dir: env_opt("WATCH_TRANSCRIPT_DIR").map(PathBuf::from),
                debounce_seconds: env_parse("WATCH_DEBOUNCE_SECONDS", 10)?,
            },
            alerts: AlertConfig {
                bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
                chat_id: env_opt("TELEGRAM_CHAT_ID"),
            },
            backup_store: BackupStoreConfig {
                endpoint: env_opt("BACKUP_S3_ENDPOINT"),
                access_key: env_opt("BACKUP_S3_ACCESS_KEY"),
                secret_key: env_opt("BACKUP_S3_SECRET_KEY"),
                bucket: env_string("BACKUP_S3_BUCKET", "engram-backups"),
                secure: env_bool("BACKUP_S3_SECURE", false),
            },
            budgets: BudgetConfig {
                master_base_chars: env_parse("MASTER_BASE_CHARS", 20_000)?,
                master_per_project_chars: env_parse("MASTER_PER_PROJECT_CHARS", 2_000)?,
                master_per_source_chars: env_parse("MASTER_PER_SOURCE_CHARS", 1_500)?,
                master_ceiling_chars: env_parse("MASTER_CEILING_CHARS", 32_000)?,
                master_flat_budget,
                max_load_response_chars: env_parse("MAX_LOAD_RESPONSE_CHARS", 40_000)?,
                min_chars_per_hit: 200,
                max_transcript_chars: env_parse("MAX_TRANSCRIPT_CHARS", 120_000)?,
            },
            integrity: IntegrityConfig {
                domain_roots,
                known_projects: {
                    let list = env_list("KNOWN_PROJECTS");
                    if list.is_empty() {
                        vec!["Engram".to_string()]
                    } else {
                        list
                    }
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_master_budget_grows_and_caps() {
        let budgets = BudgetConfig {
            master_base_chars: 20_000,
            master_per_project_chars: 2_000,
            master_per_source_chars: 1_500,
            master_ceiling_chars: 32_000,
            master_flat_budget: None,
            max_load_response_chars: 40_000,
            min_chars_per_hit: 200,
            max_transcript_chars: 120_000,
        };
        assert_eq!(budgets.master_budget(0, 0), 20_000);
        assert_eq!(budgets.master_budget(2, 1), 25_500);
        // 20k + 10*2k + 4*1.5k = 46k, capped at the ceiling
        assert_eq!(budgets.master_budget(10, 4), 32_000);
    }

    #[test]
    fn flat_budget_overrides_dynamic() {
        let budgets = BudgetConfig {
            master_base_chars: 20_000,
            master_per_project_chars: 2_000,
            master_per_source_chars: 1_500,
            master_ceiling_chars: 32_000,
            master_flat_budget: Some(8_000),
            max_load_response_chars: 40_000,
            min_chars_per_hit: 200,
            max_transcript_chars: 120_000,
        };
        assert_eq!(budgets.master_budget(5, 5), 8_000);
    }
}
