//! Engram model client
//!
//! Task-routed access to an external language model. Each pipeline task
//! maps to a model tier (fast or smart), carries a named tool schema for
//! structured output, and gets exactly one escalation retry on a weak
//! first answer. All calls are gated by the model circuit breaker.

pub mod client;
pub mod error;
pub mod schemas;
pub mod tasks;
pub mod types;

pub use client::{LanguageModel, OpenRouterClient};
pub use error::ModelError;
pub use tasks::{ModelTask, ModelTier};
pub use types::{
    entity_slug, AnomalyDraft, EntityRecord, ExtractedFields, MasterCompression, MasterUpdate,
    NudgeDraft, PatternRecord, SessionSummary, TriageAction, TriageItem, TriageResult,
};
