//! Model tasks and tier routing.

use engram_config::ModelConfig;
use serde::{Deserialize, Serialize};

/// Which model tier backs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Cheap, high-volume: extraction, summaries, advisories.
    Fast,
    /// Stronger reasoning: triage, compression, pattern analysis.
    Smart,
}

/// The finite set of model-mediated pipeline tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTask {
    SessionSummary,
    EntityExtraction,
    Triage,
    DecisionExtraction,
    MasterCompression,
    PatternAnalysis,
    AnomalyDetection,
    NudgeGeneration,
}

impl ModelTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTask::SessionSummary => "session_summary",
            ModelTask::EntityExtraction => "entity_extraction",
            ModelTask::Triage => "triage",
            ModelTask::DecisionExtraction => "decision_extraction",
            ModelTask::MasterCompression => "master_compression",
            ModelTask::PatternAnalysis => "pattern_analysis",
            ModelTask::AnomalyDetection => "anomaly_detection",
            ModelTask::NudgeGeneration => "nudge_generation",
        }
    }

    pub fn tier(&self) -> ModelTier {
        match self {
            ModelTask::SessionSummary
            | ModelTask::EntityExtraction
            | ModelTask::NudgeGeneration
            | ModelTask::AnomalyDetection => ModelTier::Fast,
            ModelTask::Triage
            | ModelTask::DecisionExtraction
            | ModelTask::MasterCompression
            | ModelTask::PatternAnalysis => ModelTier::Smart,
        }
    }

    /// Resolve the model identifier for this task.
    pub fn model_for(&self, config: &ModelConfig) -> String {
        match self.tier() {
            ModelTier::Fast => config.fast_model.clone(),
            ModelTier::Smart => config.smart_model.clone(),
        }
    }
}
