//! OpenRouter-compatible chat client with escalation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use engram_config::ModelConfig;
use engram_resilience::{DegradationManager, DEP_MODEL};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ModelError;
use crate::schemas::{extraction_tool, schema_for, ToolSchema};
use crate::tasks::ModelTask;
use crate::types::{
    AnomalyDraft, EntityRecord, ExtractedFields, MasterCompression, NudgeDraft, PatternRecord,
    SessionSummary, TriageResult,
};

/// Hedging phrases that mark a first-attempt result as too weak to use.
const HEDGING_PHRASES: [&str; 4] = ["i'm not sure", "unclear", "cannot determine", "n/a"];

/// Array fields that must be non-empty in a usable result.
const REQUIRED_ARRAYS: [&str; 2] = ["items", "master_context_updates"];

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

fn user(content: String) -> Message {
    Message {
        role: "user",
        content,
    }
}

/// Seam between the pipeline and the external language model. The worker
/// and ingest handlers depend on this trait; production wiring injects
/// [`OpenRouterClient`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn summarize_session(&self, session: &Value) -> Result<SessionSummary, ModelError>;

    async fn triage_session(
        &self,
        session: &Value,
        current_master: &str,
    ) -> Result<TriageResult, ModelError>;

    async fn extract_entities(&self, session: &Value) -> Result<Vec<EntityRecord>, ModelError>;

    async fn compress_master(
        &self,
        current_master: &str,
        triage: &TriageResult,
        session: &Value,
    ) -> Result<MasterCompression, ModelError>;

    async fn extract_session_fields(&self, note: &str) -> Result<ExtractedFields, ModelError>;

    async fn extract_from_transcript(
        &self,
        transcript: &str,
        note: &str,
    ) -> Result<ExtractedFields, ModelError>;

    async fn detect_patterns(&self, recent: &[Value]) -> Result<Vec<PatternRecord>, ModelError>;

    async fn generate_nudges(
        &self,
        master: &str,
        recent: &[Value],
        patterns: &[String],
        failures: &[String],
    ) -> Result<Vec<NudgeDraft>, ModelError>;

    async fn detect_anomalies(
        &self,
        session: &Value,
        master: &str,
        recent_decisions: &[String],
        recent_failures: &[String],
    ) -> Result<Vec<AnomalyDraft>, ModelError>;

    /// One-shot reachability probe; returns latency in milliseconds.
    async fn ping(&self) -> Result<f64, ModelError>;

    fn call_count(&self) -> u64;
}

pub struct OpenRouterClient {
    config: ModelConfig,
    http: reqwest::Client,
    degradation: Arc<DegradationManager>,
    calls: AtomicU64,
}

impl OpenRouterClient {
    pub fn new(config: ModelConfig, degradation: Arc<DegradationManager>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("http client");
        Self {
            config,
            http,
            degradation,
            calls: AtomicU64::new(0),
        }
    }

    async fn call_raw(
        &self,
        model: &str,
        messages: &[Message],
        tool: &ToolSchema,
    ) -> Result<Value, ModelError> {
        if !self.degradation.can_call(DEP_MODEL) {
            // Breaker already open; do not record another failure.
            return Err(ModelError::CircuitOpen);
        }
        if self.config.api_key.is_empty() {
            return Err(ModelError::NotConfigured);
        }

        let payload = json!({
            "model": model,
            "messages": messages,
            "max_tokens": 4096,
            "tools": [tool.definition],
            "tool_choice": {"type": "function", "function": {"name": tool.name}},
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                self.degradation.mark_unhealthy(DEP_MODEL, &e.to_string());
                ModelError::Transport(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            self.degradation
                .mark_unhealthy(DEP_MODEL, &format!("HTTP {}", status.as_u16()));
            return Err(ModelError::Status(status.as_u16()));
        }

        let body: Value = response.json().await.map_err(|e| {
            self.degradation.mark_unhealthy(DEP_MODEL, &e.to_string());
            ModelError::Decode(e.to_string())
        })?;

        self.degradation.mark_healthy(DEP_MODEL);
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(usage) = body.get("usage") {
            info!(
                "model [{model}]: {}in/{}out",
                usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            );
        }
        Ok(body)
    }

    async fn call_task(
        &self,
        task: ModelTask,
        tool: ToolSchema,
        mut messages: Vec<Message>,
    ) -> Result<Value, ModelError> {
        let model = task.model_for(&self.config);
        info!("model call: task={}, model={}", task.as_str(), model);

        let response = self.call_raw(&model, &messages, &tool).await?;
        let mut result = extract_tool_result(&response);

        if needs_escalation(result.as_ref()) {
            if let Some(escalated) = self.config.escalation.get(&model) {
                info!("escalating {}: {} -> {}", task.as_str(), model, escalated);
                if let Some(prev) = &result {
                    messages.push(Message {
                        role: "assistant",
                        content: format!("Previous attempt: {prev}"),
                    });
                    messages.push(user(
                        "Previous attempt was incomplete. Please provide a thorough response."
                            .to_string(),
                    ));
                }
                let response = self.call_raw(escalated, &messages, &tool).await?;
                result = extract_tool_result(&response);
            }
        }

        result.ok_or(ModelError::Unusable {
            task: task.as_str(),
        })
    }

    fn parse<T: serde::de::DeserializeOwned>(
        task: ModelTask,
        value: Value,
    ) -> Result<T, ModelError> {
        serde_json::from_value(value).map_err(|e| {
            warn!("model result for {} undecodable: {e}", task.as_str());
            ModelError::Unusable {
                task: task.as_str(),
            }
        })
    }
}

/// Pull the structured result out of a chat completion: the single tool
/// invocation's arguments, or the message content parsed as JSON.
fn extract_tool_result(response: &Value) -> Option<Value> {
    let message = response.get("choices")?.get(0)?.get("message")?;
    if let Some(call) = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .and_then(|calls| calls.first())
    {
        let args = call.get("function")?.get("arguments")?.as_str()?;
        return serde_json::from_str(args).ok();
    }
    let content = message.get("content")?.as_str()?;
    serde_json::from_str(content).ok()
}

/// A result warrants the escalation retry when it is absent, hedged, or
/// missing its required array content.
fn needs_escalation(result: Option<&Value>) -> bool {
    let Some(value) = result else {
        return true;
    };
    let Some(object) = value.as_object() else {
        return true;
    };
    for (key, field) in object {
        match field {
            Value::String(s) => {
                let lowered = s.to_lowercase();
                if HEDGING_PHRASES.iter().any(|h| lowered.contains(h)) {
                    return true;
                }
            }
            Value::Array(items) => {
                if items.is_empty() && REQUIRED_ARRAYS.contains(&key.as_str()) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn brief_sessions(recent: &[Value], max: usize) -> Vec<Value> {
    recent
        .iter()
        .take(max)
        .map(|s| {
            let content = s
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let content: String = content.chars().take(300).collect();
            json!({
                "id": s.get("id").cloned().unwrap_or(Value::Null),
                "content": content,
                "metadata": s.get("metadata").cloned().unwrap_or(json!({})),
            })
        })
        .collect()
}

fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    async fn summarize_session(&self, session: &Value) -> Result<SessionSummary, ModelError> {
        let prompt = format!(
            "Compress this session for archival:\n\n{}\n\nUse the session_summary tool.",
            serde_json::to_string_pretty(session).unwrap_or_default(),
        );
        let task = ModelTask::SessionSummary;
        let value = self.call_task(task, schema_for(task), vec![user(prompt)]).await?;
        Self::parse(task, value)
    }

    async fn triage_session(
        &self,
        session: &Value,
        current_master: &str,
    ) -> Result<TriageResult, ModelError> {
        let prompt = format!(
            "Triage session content (keep/archive/merge/discard).\n\nCurrent master:\n{current_master}\n\nNew session:\n{}\n\nUse the triage_result tool.",
            serde_json::to_string_pretty(session).unwrap_or_default(),
        );
        let task = ModelTask::Triage;
        let value = self.call_task(task, schema_for(task), vec![user(prompt)]).await?;
        Self::parse(task, value)
    }

    async fn extract_entities(&self, session: &Value) -> Result<Vec<EntityRecord>, ModelError> {
        let brief = clip(
            &serde_json::to_string_pretty(session).unwrap_or_default(),
            3000,
        )
        .to_string();
        let prompt = format!(
            "Extract named entities from this session.\n\nSession data:\n{brief}\n\nUse the extracted_entities tool.",
        );
        let task = ModelTask::EntityExtraction;
        let value = self.call_task(task, schema_for(task), vec![user(prompt)]).await?;
        let entities = value.get("entities").cloned().unwrap_or(json!([]));
        Self::parse(task, entities)
    }

    async fn compress_master(
        &self,
        current_master: &str,
        triage: &TriageResult,
        session: &Value,
    ) -> Result<MasterCompression, ModelError> {
        let prompt = format!(
            "Update master context based on triage.\n\nCurrent:\n{current_master}\n\nTriage:\n{}\n\nSession:\n{}\n\nUse the compressed_master_context tool.",
            serde_json::to_string_pretty(triage).unwrap_or_default(),
            serde_json::to_string_pretty(session).unwrap_or_default(),
        );
        let task = ModelTask::MasterCompression;
        let value = self.call_task(task, schema_for(task), vec![user(prompt)]).await?;
        Self::parse(task, value)
    }

    async fn extract_session_fields(&self, note: &str) -> Result<ExtractedFields, ModelError> {
        let prompt = format!(
            "Extract structured session info from this note:\n\n{note}\n\nUse the extracted_fields tool.",
        );
        let task = ModelTask::SessionSummary;
        let value = self.call_task(task, extraction_tool(), vec![user(prompt)]).await?;
        Self::parse(task, value)
    }

    async fn extract_from_transcript(
        &self,
        transcript: &str,
        note: &str,
    ) -> Result<ExtractedFields, ModelError> {
        let prompt = format!(
            "Extract structured info from this transcript.\n\nUser note: {note}\n\nTranscript:\n---\n{transcript}\n---\n\nUse the extracted_fields tool.",
        );
        let task = ModelTask::SessionSummary;
        let value = self.call_task(task, extraction_tool(), vec![user(prompt)]).await?;
        Self::parse(task, value)
    }

    async fn detect_patterns(&self, recent: &[Value]) -> Result<Vec<PatternRecord>, ModelError> {
        let briefs = brief_sessions(recent, 10);
        let prompt = format!(
            "Analyze recent sessions for behavioral patterns (3+ occurrences).\n\n{}\n\nUse the detected_patterns tool.",
            serde_json::to_string_pretty(&briefs).unwrap_or_default(),
        );
        let task = ModelTask::PatternAnalysis;
        let value = self.call_task(task, schema_for(task), vec![user(prompt)]).await?;
        let patterns = value.get("patterns").cloned().unwrap_or(json!([]));
        Self::parse(task, patterns)
    }

    async fn generate_nudges(
        &self,
        master: &str,
        recent: &[Value],
        patterns: &[String],
        failures: &[String],
    ) -> Result<Vec<NudgeDraft>, ModelError> {
        let briefs = brief_sessions(recent, 10);
        let mut parts = vec![
            "Generate proactive nudges based on current state and history.".to_string(),
            format!("Master context:\n{}", clip(master, 4000)),
            format!(
                "Recent sessions:\n{}",
                serde_json::to_string_pretty(&briefs).unwrap_or_default()
            ),
        ];
        if !patterns.is_empty() {
            parts.push(format!("Patterns:\n{}", patterns[..patterns.len().min(5)].join("\n")));
        }
        if !failures.is_empty() {
            parts.push(format!("Failures:\n{}", failures[..failures.len().min(5)].join("\n")));
        }
        parts.push("Generate 0-5 useful nudges. Use the generated_nudges tool.".to_string());

        let task = ModelTask::NudgeGeneration;
        let value = self
            .call_task(task, schema_for(task), vec![user(parts.join("\n\n"))])
            .await?;
        let nudges = value.get("nudges").cloned().unwrap_or(json!([]));
        Self::parse(task, nudges)
    }

    async fn detect_anomalies(
        &self,
        session: &Value,
        master: &str,
        recent_decisions: &[String],
        recent_failures: &[String],
    ) -> Result<Vec<AnomalyDraft>, ModelError> {
        let brief = json!({
            "summary": session.get("summary").cloned().unwrap_or(Value::Null),
            "decisions": session.get("decisions").cloned().unwrap_or(json!([])),
            "failures": session.get("failures").cloned().unwrap_or(json!([])),
            "tags": session.get("tags").cloned().unwrap_or(json!([])),
        });
        let mut parts = vec![format!(
            "Compare session against master context for anomalies.\n\nMASTER:\n{}\n\nSESSION:\n{}",
            clip(master, 4000),
            serde_json::to_string_pretty(&brief).unwrap_or_default(),
        )];
        if !recent_decisions.is_empty() {
            parts.push(format!(
                "Recent decisions:\n{}",
                recent_decisions[..recent_decisions.len().min(10)].join("\n")
            ));
        }
        if !recent_failures.is_empty() {
            parts.push(format!(
                "Known failures:\n{}",
                recent_failures[..recent_failures.len().min(10)].join("\n")
            ));
        }
        parts.push("Flag genuine anomalies only. Use the detected_anomalies tool.".to_string());

        let task = ModelTask::AnomalyDetection;
        let value = self
            .call_task(task, schema_for(task), vec![user(parts.join("\n\n"))])
            .await?;
        let anomalies = value.get("anomalies").cloned().unwrap_or(json!([]));
        Self::parse(task, anomalies)
    }

    async fn ping(&self) -> Result<f64, ModelError> {
        let started = Instant::now();
        let messages = vec![user("Reply with the single word: ok".to_string())];
        let tool = extraction_tool();
        // A plain completion would do, but reusing the tool path exercises
        // the same request shape the pipeline uses.
        self.call_raw(&self.config.fast_model, &messages, &tool).await?;
        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tool_call_arguments() {
        let response = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "function": {
                            "name": "session_summary",
                            "arguments": "{\"compressed_summary\":\"did things\"}"
                        }
                    }]
                }
            }]
        });
        let result = extract_tool_result(&response).unwrap();
        assert_eq!(result["compressed_summary"], "did things");
    }

    #[test]
    fn falls_back_to_json_content() {
        let response = json!({
            "choices": [{"message": {"content": "{\"items\": [1, 2]}"}}]
        });
        let result = extract_tool_result(&response).unwrap();
        assert_eq!(result["items"][0], 1);
    }

    #[test]
    fn free_text_content_yields_none() {
        let response = json!({
            "choices": [{"message": {"content": "I archived the items as requested."}}]
        });
        assert!(extract_tool_result(&response).is_none());
    }

    #[test]
    fn escalates_on_missing_result() {
        assert!(needs_escalation(None));
    }

    #[test]
    fn escalates_on_hedging() {
        let hedged = json!({"compressed_summary": "Unclear what happened here"});
        assert!(needs_escalation(Some(&hedged)));
        let confident = json!({"compressed_summary": "Migrated billing to the new queue"});
        assert!(!needs_escalation(Some(&confident)));
    }

    #[test]
    fn escalates_on_empty_required_arrays() {
        let empty = json!({"items": [], "master_context_updates": []});
        assert!(needs_escalation(Some(&empty)));
        let partial = json!({"items": [{"content": "x"}], "master_context_updates": []});
        assert!(needs_escalation(Some(&partial)));
        let full = json!({"items": [{"content": "x"}], "master_context_updates": [{"section": "s"}]});
        assert!(!needs_escalation(Some(&full)));
        // Empty arrays under other names are fine.
        let other = json!({"key_topics": [], "compressed_summary": "fine"});
        assert!(!needs_escalation(Some(&other)));
    }
}
