//! Runtime-adjustable settings persisted to `settings.json`.
//!
//! These overlay the environment configuration and survive restarts. A
//! missing or unreadable file means "use defaults" — callers never treat
//! that as an error.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collections::ALL_COLLECTIONS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSettings {
    pub base_url: Option<String>,
    pub fast_model: Option<String>,
    pub smart_model: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            fast_model: None,
            smart_model: None,
        }
    }
}

/// Per-collection retention overrides in days. 0 = never prune.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetentionSettings {
    #[serde(default)]
    pub overrides: HashMap<String, u32>,
}

impl RetentionSettings {
    /// Effective retention for a collection: override if present, else the
    /// registry default.
    pub fn days_for(&self, collection: &str) -> u32 {
        if let Some(days) = self.overrides.get(collection) {
            return *days;
        }
        ALL_COLLECTIONS
            .iter()
            .find(|c| c.name == collection)
            .map(|c| c.retention_days)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    /// Optional override of the environment LEARNING_MODE flag.
    pub learning_mode: Option<bool>,
}

impl RuntimeSettings {
    /// Load settings from disk. Absent or corrupt files yield defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("settings: {} unreadable ({}), using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self).expect("settings serialize");
        std::fs::write(path, raw)
    }
}
