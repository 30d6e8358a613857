//! Tool schemas for structured model output.
//!
//! Every task forces a single named tool call; the parsed arguments of
//! that call are the task result. Required fields here are the contract
//! the extraction layer relies on.

use serde_json::{json, Value};

use crate::tasks::ModelTask;

/// Tool name + JSON-schema definition for a task.
pub struct ToolSchema {
    pub name: &'static str,
    pub definition: Value,
}

pub fn schema_for(task: ModelTask) -> ToolSchema {
    match task {
        ModelTask::Triage | ModelTask::DecisionExtraction => triage_tool(),
        ModelTask::SessionSummary => summary_tool(),
        ModelTask::MasterCompression => master_compression_tool(),
        ModelTask::EntityExtraction => entity_tool(),
        ModelTask::PatternAnalysis => pattern_tool(),
        ModelTask::NudgeGeneration => nudge_tool(),
        ModelTask::AnomalyDetection => anomaly_tool(),
    }
}

/// Field-extraction tool used by lite saves and transcript ingestion.
/// Routed through the session-summary task tier.
pub fn extraction_tool() -> ToolSchema {
    ToolSchema {
        name: "extracted_fields",
        definition: json!({
            "type": "function",
            "function": {
                "name": "extracted_fields",
                "description": "Extract structured session fields from a brief note",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "summary": {"type": "string"},
                        "decisions": {"type": "array", "items": {"type": "string"}},
                        "failures": {"type": "array", "items": {"type": "string"}},
                        "files_changed": {"type": "array", "items": {"type": "string"}},
                        "next_steps": {"type": "array", "items": {"type": "string"}},
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "significance": {"type": "string", "enum": ["low", "medium", "high"]}
                    },
                    "required": ["summary", "tags", "significance"]
                }
            }
        }),
    }
}

fn triage_tool() -> ToolSchema {
    ToolSchema {
        name: "triage_result",
        definition: json!({
            "type": "function",
            "function": {
                "name": "triage_result",
                "description": "Return triage decisions for session context items",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "items": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "content": {"type": "string"},
                                    "action": {"type": "string", "enum": ["keep", "archive", "merge", "discard"]},
                                    "reason": {"type": "string"},
                                    "merge_target": {"type": "string"},
                                    "collection": {"type": "string"}
                                },
                                "required": ["content", "action", "reason"]
                            }
                        },
                        "master_context_updates": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "section": {"type": "string"},
                                    "action": {"type": "string", "enum": ["update", "add", "remove"]},
                                    "content": {"type": "string"}
                                },
                                "required": ["section", "action", "content"]
                            }
                        }
                    },
                    "required": ["items", "master_context_updates"]
                }
            }
        }),
    }
}

fn summary_tool() -> ToolSchema {
    ToolSchema {
        name: "session_summary",
        definition: json!({
            "type": "function",
            "function": {
                "name": "session_summary",
                "description": "Return a compressed session summary for archival",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "compressed_summary": {"type": "string"},
                        "key_topics": {"type": "array", "items": {"type": "string"}},
                        "significance_confirmed": {"type": "string", "enum": ["low", "medium", "high"]},
                        "projects_mentioned": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["compressed_summary", "key_topics", "significance_confirmed"]
                }
            }
        }),
    }
}

fn master_compression_tool() -> ToolSchema {
    ToolSchema {
        name: "compressed_master_context",
        definition: json!({
            "type": "function",
            "function": {
                "name": "compressed_master_context",
                "description": "Return the updated master context document",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "master_context_markdown": {"type": "string"},
                        "changes_made": {"type": "array", "items": {"type": "string"}},
                        "items_archived": {"type": "integer"},
                        "items_kept": {"type": "integer"}
                    },
                    "required": ["master_context_markdown", "changes_made"]
                }
            }
        }),
    }
}

fn entity_tool() -> ToolSchema {
    ToolSchema {
        name: "extracted_entities",
        definition: json!({
            "type": "function",
            "function": {
                "name": "extracted_entities",
                "description": "Extract named entities from session data",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "entities": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": {"type": "string"},
                                    "type": {"type": "string", "enum": ["person", "project", "service", "tool", "server", "domain", "other"]},
                                    "context": {"type": "string"},
                                    "relationships": {"type": "array", "items": {"type": "string"}}
                                },
                                "required": ["name", "type", "context"]
                            }
                        }
                    },
                    "required": ["entities"]
                }
            }
        }),
    }
}

fn pattern_tool() -> ToolSchema {
    ToolSchema {
        name: "detected_patterns",
        definition: json!({
            "type": "function",
            "function": {
                "name": "detected_patterns",
                "description": "Detect behavioral patterns across recent sessions",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "patterns": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "pattern": {"type": "string"},
                                    "frequency": {"type": "integer"},
                                    "type": {"type": "string", "enum": ["recurring_topic", "work_habit", "tech_preference", "risk_pattern", "other"]},
                                    "suggestion": {"type": "string"}
                                },
                                "required": ["pattern", "frequency", "type"]
                            }
                        }
                    },
                    "required": ["patterns"]
                }
            }
        }),
    }
}

fn nudge_tool() -> ToolSchema {
    ToolSchema {
        name: "generated_nudges",
        definition: json!({
            "type": "function",
            "function": {
                "name": "generated_nudges",
                "description": "Generate proactive nudges based on session history",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "nudges": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "message": {"type": "string"},
                                    "type": {"type": "string", "enum": ["followup", "contradiction", "stale", "risk", "opportunity", "reminder"]},
                                    "priority": {"type": "string", "enum": ["low", "medium", "high"]},
                                    "expires_after_days": {"type": "integer"}
                                },
                                "required": ["message", "type", "priority"]
                            }
                        }
                    },
                    "required": ["nudges"]
                }
            }
        }),
    }
}

fn anomaly_tool() -> ToolSchema {
    ToolSchema {
        name: "detected_anomalies",
        definition: json!({
            "type": "function",
            "function": {
                "name": "detected_anomalies",
                "description": "Flag anomalies between session data and established context",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "anomalies": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "description": {"type": "string"},
                                    "type": {"type": "string", "enum": ["contradiction", "regression", "drift", "inconsistency", "escalation"]},
                                    "severity": {"type": "string", "enum": ["low", "medium", "high", "critical"]},
                                    "evidence": {"type": "string"},
                                    "expires_after_days": {"type": "integer"}
                                },
                                "required": ["description", "type", "severity", "evidence"]
                            }
                        }
                    },
                    "required": ["anomalies"]
                }
            }
        }),
    }
}
