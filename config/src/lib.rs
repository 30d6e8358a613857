//! Engram configuration
//!
//! Centralized, environment-driven configuration for the memory service:
//! - Server, data-path, and knowledge-base settings
//! - Model routing (fast/smart tiers + escalation map)
//! - Vector-store collection registry with alias resolution
//! - Retention defaults and response budgets

pub mod collections;
pub mod config;
pub mod settings;

pub use collections::{
    resolve_collection_name, CollectionSpec, ALL_COLLECTIONS, COLLECTION_ALIASES,
};
pub use config::{
    AlertConfig, AppConfig, BackupStoreConfig, BudgetConfig, ConfigError, IntegrityConfig,
    KnowledgeBaseConfig, ModelConfig, PathsConfig, ServerConfig, VectorStoreConfig,
    WatcherConfig, WorkerConfig,
};
pub use settings::{LlmSettings, RetentionSettings, RuntimeSettings};
