//! Batch analysis of changed files.
//!
//! Deterministic tier of the watcher: no model calls. Classifies a
//! debounced batch into compose changes, credential alerts, and new
//! stack/project directories, and maintains the auto-detected-changes
//! ledger in the working tree.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::compose::{is_compose_file, parse_compose, stack_name, ComposeService};
use crate::credentials::{
    is_credential_file, is_scannable_source, scan_content, scan_diff_lines, CredentialAlert,
};

/// Ledger capped at this many dated sections.
const MAX_LEDGER_SECTIONS: usize = 100;

const LEDGER_HEADER: &str =
    "# Infrastructure Changes (Auto-Detected)\n\n> Generated by the Engram file watcher. Do not edit manually.\n";

#[derive(Debug, Clone, Serialize)]
pub struct ComposeChange {
    pub stack: String,
    pub file: String,
    pub services: Vec<ComposeService>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewDirectory {
    pub category: String,
    pub name: String,
    pub path: String,
    pub detected_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchAnalysis {
    pub compose_changes: Vec<ComposeChange>,
    pub credential_alerts: Vec<CredentialAlert>,
    pub new_directories: Vec<NewDirectory>,
}

impl BatchAnalysis {
    pub fn has_findings(&self) -> bool {
        !self.compose_changes.is_empty()
            || !self.credential_alerts.is_empty()
            || !self.new_directories.is_empty()
    }
}

/// Analyze a batch of repo-relative changed paths.
pub async fn analyze_changes(changed: &[String], git_root: &Path) -> BatchAnalysis {
    let mut analysis = BatchAnalysis::default();

    for rel in changed {
        let full = git_root.join(rel);
        let file_name = Path::new(rel)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if is_compose_file(file_name) {
            if let Ok(content) = std::fs::read_to_string(&full) {
                let services = parse_compose(&content);
                if !services.is_empty() {
                    analysis.compose_changes.push(ComposeChange {
                        stack: stack_name(rel),
                        file: rel.clone(),
                        services,
                    });
                }
            }
        }

        if is_credential_file(file_name) {
            if let Ok(content) = std::fs::read_to_string(&full) {
                analysis.credential_alerts.extend(scan_content(rel, &content));
            }
        } else if full.exists() {
            let extension = Path::new(rel)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            if is_scannable_source(extension) {
                let added = added_diff_lines(rel, git_root).await;
                analysis
                    .credential_alerts
                    .extend(scan_diff_lines(rel, added.iter().map(String::as_str)));
            }
        }

        if let Some(new_dir) = detect_new_directory(rel, git_root).await {
            if !analysis.new_directories.iter().any(|d| d.path == new_dir.path) {
                analysis.new_directories.push(new_dir);
            }
        }
    }

    analysis
}

/// Lines added to a file in the latest commit.
async fn added_diff_lines(rel: &str, git_root: &Path) -> Vec<String> {
    let output = tokio::process::Command::new("git")
        .args(["diff", "HEAD~1", "--", rel])
        .current_dir(git_root)
        .output()
        .await;
    let Ok(output) = output else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
        .map(|line| line[1..].to_string())
        .collect()
}

/// A `category/name` directory counts as new when at most one commit has
/// ever touched it.
async fn detect_new_directory(rel: &str, git_root: &Path) -> Option<NewDirectory> {
    let parts: Vec<&str> = rel.split('/').collect();
    if parts.len() < 2 {
        return None;
    }
    let dir_rel: PathBuf = [parts[0], parts[1]].iter().collect();
    if !git_root.join(&dir_rel).is_dir() {
        return None;
    }

    let output = tokio::process::Command::new("git")
        .args(["log", "--oneline", "-2", "--", dir_rel.to_str()?])
        .current_dir(git_root)
        .output()
        .await
        .ok()?;
    let commits = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.is_empty())
        .count();
    if commits > 1 {
        return None;
    }

    Some(NewDirectory {
        category: parts[0].to_string(),
        name: parts[1].to_string(),
        path: format!("{}/{}", parts[0], parts[1]),
        detected_at: Utc::now().to_rfc3339(),
    })
}

/// Append analysis findings to the working-tree changelog, trimming the
/// oldest sections past the cap. Returns whether anything was written.
pub fn write_ledger(git_root: &Path, analysis: &BatchAnalysis) -> bool {
    if analysis.compose_changes.is_empty() && analysis.new_directories.is_empty() {
        return false;
    }
    let ledger_path = git_root.join("infrastructure").join("auto-detected-changes.md");
    if let Some(parent) = ledger_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let now = Utc::now().format("%Y-%m-%d %H:%M UTC");
    let mut entry = String::new();

    for change in &analysis.compose_changes {
        entry.push_str(&format!("\n### [{now}] Stack: {}\n\n", change.stack));
        entry.push_str("| Service | Image | Ports | Networks |\n");
        entry.push_str("|---------|-------|-------|----------|\n");
        for service in &change.services {
            let ports = if service.ports.is_empty() {
                "-".to_string()
            } else {
                service.ports.join(", ")
            };
            let networks = if service.networks.is_empty() {
                "-".to_string()
            } else {
                service.networks.join(", ")
            };
            entry.push_str(&format!(
                "| {} | {} | {ports} | {networks} |\n",
                service.name, service.image
            ));
        }
        let env_keys: Vec<&str> = change
            .services
            .iter()
            .flat_map(|s| s.environment_keys.iter().map(String::as_str))
            .take(15)
            .collect();
        if !env_keys.is_empty() {
            entry.push_str(&format!("\nEnv vars: {}\n", env_keys.join(", ")));
        }
    }

    for new_dir in &analysis.new_directories {
        entry.push_str(&format!(
            "\n### [{now}] New {}: {}\n\n- Path: `/{}/`\n- Category: {}\n",
            new_dir.category, new_dir.name, new_dir.path, new_dir.category
        ));
    }

    let existing = std::fs::read_to_string(&ledger_path)
        .unwrap_or_else(|_| LEDGER_HEADER.to_string());
    let existing = trim_ledger(existing);

    match std::fs::write(&ledger_path, existing + entry.as_str()) {
        Ok(()) => {
            info!(
                "detector: ledger updated ({} compose, {} new dirs)",
                analysis.compose_changes.len(),
                analysis.new_directories.len()
            );
            true
        }
        Err(e) => {
            warn!("detector: ledger write failed: {e}");
            false
        }
    }
}

fn trim_ledger(content: String) -> String {
    let sections: Vec<&str> = content.split("\n### [").collect();
    if sections.len() <= MAX_LEDGER_SECTIONS {
        return content;
    }
    let keep = &sections[sections.len() - MAX_LEDGER_SECTIONS..];
    format!("{}\n### [{}", sections[0], keep.join("\n### ["))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compose_batch_produces_change_and_ledger_entry() {
        let root = tempfile::tempdir().unwrap();
        let stack = root.path().join("stacks/loki");
        std::fs::create_dir_all(&stack).unwrap();
        std::fs::write(
            stack.join("docker-compose.yml"),
            "services:\n  loki:\n    container_name: loki-main\n    image: grafana/loki\n    ports:\n      - \"3100:3100\"\n",
        )
        .unwrap();

        let changed = vec!["stacks/loki/docker-compose.yml".to_string()];
        let analysis = analyze_changes(&changed, root.path()).await;
        assert_eq!(analysis.compose_changes.len(), 1);
        assert_eq!(analysis.compose_changes[0].stack, "loki");
        assert_eq!(analysis.compose_changes[0].services[0].name, "loki-main");

        assert!(write_ledger(root.path(), &analysis));
        let ledger = std::fs::read_to_string(
            root.path().join("infrastructure/auto-detected-changes.md"),
        )
        .unwrap();
        assert!(ledger.contains("Stack: loki"));
        assert!(ledger.contains("| loki-main | grafana/loki | 3100:3100 | - |"));
    }

    #[tokio::test]
    async fn env_file_batch_produces_masked_alert() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("stacks/app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(
            app.join(".env"),
            "OPENAI_API_KEY=sk-abcdef0123456789abcdef0123456789\n",
        )
        .unwrap();

        let changed = vec!["stacks/app/.env".to_string()];
        let analysis = analyze_changes(&changed, root.path()).await;
        assert!(!analysis.credential_alerts.is_empty());
        assert!(analysis
            .credential_alerts
            .iter()
            .all(|a| !a.masked_value.contains("0123456789abcdef012345")));
    }

    #[test]
    fn ledger_trims_to_section_cap() {
        let mut content = LEDGER_HEADER.to_string();
        for i in 0..150 {
            content.push_str(&format!("\n### [2026-01-01 00:{i:02} UTC] Stack: s{i}\n"));
        }
        let trimmed = trim_ledger(content);
        let sections = trimmed.matches("\n### [").count();
        assert_eq!(sections, MAX_LEDGER_SECTIONS);
        assert!(trimmed.starts_with(LEDGER_HEADER));
        assert!(trimmed.contains("Stack: s149"));
        assert!(!trimmed.contains("Stack: s10\n"));
    }
}
