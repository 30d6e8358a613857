//! Credential detection.
//!
//! A closed list of patterns catches secrets in watched files. Matched
//! values are masked immediately; raw values never reach logs, alerts,
//! or the model.

use chrono::Utc;
use engram_stores::mask_value;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static CREDENTIAL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)(?:password|passwd|pwd)\s*[=:]\s*\S+").unwrap(),
            "password",
        ),
        (
            Regex::new(r"(?i)(?:api[_-]?key|apikey)\s*[=:]\s*\S+").unwrap(),
            "api_key",
        ),
        (
            Regex::new(r"(?i)(?:secret[_-]?key|secret)\s*[=:]\s*\S+").unwrap(),
            "secret",
        ),
        (
            Regex::new(r"(?i)(?:access[_-]?key|token)\s*[=:]\s*\S+").unwrap(),
            "token",
        ),
        (
            Regex::new(r"(?i)(?:database[_-]?url|db[_-]?url|postgres://|mysql://|mongodb://)\S+")
                .unwrap(),
            "database_url",
        ),
        (Regex::new(r"sk-[a-zA-Z0-9_-]{20,}").unwrap(), "api_key_pattern"),
        (Regex::new(r"ghp_[a-zA-Z0-9]{36}").unwrap(), "github_token"),
        (Regex::new(r"xoxb-[a-zA-Z0-9-]+").unwrap(), "slack_token"),
    ]
});

/// File names scanned in full rather than diff-only.
pub fn is_credential_file(name: &str) -> bool {
    name.starts_with(".env") || name.starts_with("secrets.") || name.starts_with("credentials.")
}

/// Extensions worth diff-scanning for leaked secrets.
pub fn is_scannable_source(extension: &str) -> bool {
    matches!(extension, "yml" | "yaml" | "json" | "js" | "py" | "sh" | "conf" | "toml" | "rs")
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialAlert {
    pub file: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub masked_value: String,
    pub detected_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
}

/// Scan full file content. Every pattern match produces one masked alert.
pub fn scan_content(file: &str, content: &str) -> Vec<CredentialAlert> {
    let mut alerts = Vec::new();
    for (pattern, kind) in CREDENTIAL_PATTERNS.iter() {
        for found in pattern.find_iter(content) {
            alerts.push(CredentialAlert {
                file: file.to_string(),
                kind,
                masked_value: mask_value(found.as_str()),
                detected_at: Utc::now().to_rfc3339(),
                source: None,
            });
        }
    }
    alerts
}

/// Scan only added diff lines; at most one alert per line.
pub fn scan_diff_lines<'a>(
    file: &str,
    added_lines: impl Iterator<Item = &'a str>,
) -> Vec<CredentialAlert> {
    let mut alerts = Vec::new();
    for line in added_lines {
        for (pattern, kind) in CREDENTIAL_PATTERNS.iter() {
            if pattern.is_match(line) {
                alerts.push(CredentialAlert {
                    file: file.to_string(),
                    kind,
                    masked_value: mask_value(line.trim()),
                    detected_at: Utc::now().to_rfc3339(),
                    source: Some("git_diff"),
                });
                break;
            }
        }
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_and_masks_provider_key() {
        let alerts = scan_content(
            "stacks/app/.env",
            "OPENAI_API_KEY=sk-abcdef0123456789abcdef0123456789\n",
        );
        assert!(!alerts.is_empty());
        // The masked value shows only the edges of the secret.
        assert!(alerts.iter().any(|a| a.masked_value.contains("6789")));
        for alert in &alerts {
            assert!(!alert.masked_value.contains("abcdef0123456789abcdef"));
        }
    }

    #[test]
    fn detects_password_assignment() {
        let alerts = scan_content("conf/app.yml", "password: hunter2hunter2\n");
        assert_eq!(alerts[0].kind, "password");
    }

    #[test]
    fn detects_github_and_slack_tokens() {
        let gh = format!("token is ghp_{}", "a".repeat(36));
        assert!(scan_content("notes.md", &gh).iter().any(|a| a.kind == "github_token"));
        assert!(scan_content("notes.md", "xoxb-1234-abcd")
            .iter()
            .any(|a| a.kind == "slack_token"));
    }

    #[test]
    fn clean_content_produces_nothing() {
        assert!(scan_content("src/main.rs", "fn main() { println!(\"hello\"); }").is_empty());
    }

    #[test]
    fn diff_scan_caps_one_alert_per_line() {
        let lines = ["API_KEY=sk-abcdef0123456789abcdef0123456789 password=oops"];
        let alerts = scan_diff_lines("app.py", lines.into_iter());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source, Some("git_diff"));
    }

    #[test]
    fn credential_file_names() {
        assert!(is_credential_file(".env"));
        assert!(is_credential_file(".env.production"));
        assert!(is_credential_file("secrets.yml"));
        assert!(is_credential_file("credentials.json"));
        assert!(!is_credential_file("docker-compose.yml"));
    }
}
