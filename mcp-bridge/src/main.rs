//! Tool-protocol bridge: stdio transport for agent hosts.
//!
//! Speaks JSON-RPC over stdin/stdout and proxies every tool call to the
//! Engram HTTP surface. Stateless apart from the HTTP client; the server
//! does all the work.
//!
//! Host configuration points the agent at this binary with
//! `ENGRAM_URL` set to the server address.

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

fn server_url() -> String {
    std::env::var("ENGRAM_URL").unwrap_or_else(|_| "http://localhost:9040".to_string())
}

/// (tool name, method, path) for every exposed operation.
const TOOL_ENDPOINTS: [(&str, &str, &str); 7] = [
    ("memory_load", "POST", "/api/load"),
    ("memory_save", "POST", "/api/save"),
    ("memory_checkpoint", "POST", "/api/checkpoint"),
    ("memory_search", "POST", "/api/search"),
    ("memory_correct", "POST", "/api/correct"),
    ("memory_context", "GET", "/api/summary"),
    ("memory_stats", "GET", "/api/stats"),
];

fn tool_definitions() -> Value {
    json!([
        {
            "name": "memory_load",
            "description": "Load context for a new session: master context, topic-relevant archive hits, failure warnings, and nudges. Call at the start of every session.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "topic": {"type": "string", "description": "Optional topic to focus retrieval on."}
                }
            }
        },
        {
            "name": "memory_save",
            "description": "Save session context at the end of a conversation. Pass a structured summary with decisions, failures, files changed, and next steps.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": {"type": "string", "description": "Session id from memory_load"},
                    "summary": {"type": "string", "description": "Structured session summary"},
                    "decisions": {"type": "array", "items": {"type": "string"}},
                    "failures": {"type": "array", "items": {"type": "string"}},
                    "files_changed": {"type": "array", "items": {"type": "string"}},
                    "next_steps": {"type": "array", "items": {"type": "string"}},
                    "significance": {"type": "string", "enum": ["low", "medium", "high"]},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "transcript_text": {"type": "string", "description": "Optional raw transcript"}
                },
                "required": ["session_id", "summary"]
            }
        },
        {
            "name": "memory_checkpoint",
            "description": "Lightweight mid-session save. Pass the session id and a brief note.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": {"type": "string"},
                    "note": {"type": "string", "description": "Brief note (1-3 sentences)"},
                    "significance": {"type": "string", "enum": ["low", "medium", "high"]},
                    "transcript_text": {"type": "string"}
                },
                "required": ["session_id", "note"]
            }
        },
        {
            "name": "memory_search",
            "description": "Search the archive for historical context across sessions, decisions, failures, and entities.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "collections": {"type": "array", "items": {"type": "string"}},
                    "limit": {"type": "integer", "default": 5}
                },
                "required": ["query"]
            }
        },
        {
            "name": "memory_correct",
            "description": "Fix incorrect information in the master context and/or the archive.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "item": {"type": "string", "description": "What is incorrect"},
                    "correction": {"type": "string", "description": "What it should be"},
                    "scope": {"type": "string", "enum": ["hot", "archive", "both"], "default": "both"}
                },
                "required": ["item", "correction"]
            }
        },
        {
            "name": "memory_context",
            "description": "Fetch a short summary of the current master context.",
            "inputSchema": {"type": "object", "properties": {}}
        },
        {
            "name": "memory_stats",
            "description": "Service statistics: session counts, archive sizes, worker and watcher state.",
            "inputSchema": {"type": "object", "properties": {}}
        }
    ])
}

struct Bridge {
    http: reqwest::Client,
    base_url: String,
}

impl Bridge {
    fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("http client"),
            base_url: server_url(),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, String> {
        let Some((_, method, path)) = TOOL_ENDPOINTS.iter().find(|(tool, _, _)| *tool == name)
        else {
            return Err(format!("unknown tool: {name}"));
        };
        let url = format!("{}{path}", self.base_url);
        let request = match *method {
            "GET" => self.http.get(&url),
            _ => self.http.post(&url).json(&arguments),
        };
        let response = request.send().await.map_err(|e| format!("engram unreachable: {e}"))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("engram response undecodable: {e}"))?;
        if !status.is_success() {
            return Err(format!("engram returned HTTP {status}: {body}"));
        }
        Ok(body)
    }

    async fn handle(&self, request: Value) -> Option<Value> {
        let id = request.get("id").cloned();
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

        let result = match method {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "engram", "version": env!("CARGO_PKG_VERSION")},
            }),
            "notifications/initialized" => return None,
            "tools/list" => json!({"tools": tool_definitions()}),
            "tools/call" => {
                let params = request.get("params").cloned().unwrap_or(json!({}));
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                match self.call_tool(name, arguments).await {
                    Ok(body) => json!({
                        "content": [{
                            "type": "text",
                            "text": serde_json::to_string_pretty(&body).unwrap_or_default(),
                        }]
                    }),
                    Err(message) => {
                        warn!("bridge: tool {name} failed: {message}");
                        json!({
                            "content": [{"type": "text", "text": message}],
                            "isError": true,
                        })
                    }
                }
            }
            "ping" => json!({}),
            _ => {
                return id.map(|id| {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": format!("method not found: {method}")},
                    })
                });
            }
        };

        id.map(|id| json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout is the protocol channel.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let bridge = Bridge::new();
    info!("bridge: proxying tools to {}", bridge.base_url);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("bridge: undecodable request: {e}");
                continue;
            }
        };
        if let Some(response) = bridge.handle(request).await {
            let mut payload = response.to_string();
            payload.push('\n');
            stdout.write_all(payload.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_has_an_endpoint_and_schema() {
        let definitions = tool_definitions();
        let names: Vec<&str> = definitions
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names.len(), TOOL_ENDPOINTS.len());
        for (tool, _, _) in TOOL_ENDPOINTS {
            assert!(names.contains(&tool), "missing schema for {tool}");
        }
    }

    #[tokio::test]
    async fn unknown_method_yields_error_response() {
        let bridge = Bridge::new();
        let response = bridge
            .handle(json!({"jsonrpc": "2.0", "id": 7, "method": "bogus/thing"}))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], json!(-32601));
        assert_eq!(response["id"], json!(7));
    }

    #[tokio::test]
    async fn initialize_reports_tool_capability() {
        let bridge = Bridge::new();
        let response = bridge
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
            .await
            .unwrap();
        assert_eq!(response["result"]["serverInfo"]["name"], json!("engram"));
        assert!(response["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let bridge = Bridge::new();
        let response = bridge
            .handle(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(response.is_none());
    }
}
