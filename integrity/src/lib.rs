//! Post-compression integrity checker.
//!
//! After the model rewrites the master context, this module verifies that
//! known infrastructure facts were not silently dropped. Deterministic
//! pattern matching only — no model calls.
//!
//! Categories checked: ports, container/service names, domains, IP
//! addresses, and project names. The known-fact ledger parsed from the
//! KB is a validation reference only; it is never merged into the
//! pre-compression set, because that would flag "drops" of facts that
//! were never in the live document.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use engram_config::IntegrityConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Words the container patterns must never capture.
static CONTAINER_STOPWORDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    BTreeSet::from([
        "the", "and", "for", "not", "are", "was", "has", "into", "from", "with", "that", "this",
        "will", "can", "but", "all", "its", "port", "ports", "points", "point", "network",
        "networks", "image", "service", "stack", "compose", "docker", "container", "build",
        "custom", "latest", "alpine", "active", "new", "production", "deployed", "enabled",
        "migrated", "complete", "pending", "running", "healthy", "ready", "live", "name",
        "status", "phase", "version", "current", "next", "steps", "used", "base", "lifecycle",
        "management", "system", "bridge", "pipeline", "endpoint", "module", "worker", "router",
    ])
});

static PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4,5})(?::\d{2,5})?\b").unwrap());
static PORT_PAIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4,5}):(\d{2,5})").unwrap());
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").unwrap());
static CONTAINER_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)container[:\s]+[`"]?([a-z][a-z0-9_-]+)[`"]?[\s,.]"#).unwrap(),
        Regex::new(r#"(?i)(?:docker|container)\s+(?:name\s+)?[`"]?([a-z][a-z0-9_-]+)[`"]?"#)
            .unwrap(),
        Regex::new(r#"(?i)(?:service|stack)[:\s]+[`"]?([a-z][a-z0-9_-]+)[`"]?"#).unwrap(),
    ]
});
static PROJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:project|system|platform)[:\s]+[`"]?([A-Z][A-Za-z]+(?:\s[A-Z][A-Za-z]+)?)[`"]?"#)
        .unwrap()
});
static LEDGER_ROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|\s*([a-z][a-z0-9_-]+)\s*\|\s*(\S+)\s*\|\s*(\d+:\d+|\S+)\s*\|").unwrap()
});

/// Ports in this range are internal framing identifiers, not service
/// ports, and are excluded from extraction.
const RESERVED_PORT_RANGE: (u32, u32) = (2020, 2035);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfrastructureFacts {
    pub ports: BTreeSet<String>,
    pub containers: BTreeSet<String>,
    pub domains: BTreeSet<String>,
    pub ips: BTreeSet<String>,
    pub projects: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DropSeverity {
    None,
    Low,
    Medium,
    High,
}

impl DropSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropSeverity::None => "none",
            DropSeverity::Low => "low",
            DropSeverity::Medium => "medium",
            DropSeverity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub passed: bool,
    pub dropped: BTreeMap<String, Vec<String>>,
    pub drop_count: usize,
    pub severity: DropSeverity,
    pub details: String,
}

/// Extract the verifiable infrastructure facts from a context document.
pub fn extract_facts(text: &str, config: &IntegrityConfig) -> InfrastructureFacts {
    let mut facts = InfrastructureFacts::default();

    for captures in PORT_RE.captures_iter(text) {
        let digits = &captures[1];
        if let Ok(port) = digits.parse::<u32>() {
            if (1024..=65535).contains(&port)
                && !(RESERVED_PORT_RANGE.0..=RESERVED_PORT_RANGE.1).contains(&port)
            {
                facts.ports.insert(digits.to_string());
            }
        }
    }
    for captures in PORT_PAIR_RE.captures_iter(text) {
        if let Ok(port) = captures[1].parse::<u32>() {
            if (1024..=65535).contains(&port)
                && !(RESERVED_PORT_RANGE.0..=RESERVED_PORT_RANGE.1).contains(&port)
            {
                facts.ports.insert(captures[1].to_string());
            }
        }
    }

    for pattern in CONTAINER_RES.iter() {
        for captures in pattern.captures_iter(text) {
            let name = captures[1].trim_matches(['`', '"', '\'']).to_lowercase();
            if name.len() > 2
                && !CONTAINER_STOPWORDS.contains(name.as_str())
                && !name.starts_with('-')
                && !name.starts_with('|')
            {
                facts.containers.insert(name);
            }
        }
    }

    let domain_re = domain_pattern(&config.domain_roots);
    for captures in domain_re.captures_iter(text) {
        let mut domain = captures[1].trim_end_matches(['/', '.']).to_lowercase();
        if let Some(slash) = domain.find('/') {
            domain.truncate(slash);
        }
        facts.domains.insert(domain);
    }

    for captures in IP_RE.captures_iter(text) {
        facts.ips.insert(captures[1].to_string());
    }

    for captures in PROJECT_RE.captures_iter(text) {
        facts.projects.insert(captures[1].trim().to_string());
    }
    for known in &config.known_projects {
        if !known.is_empty() && text.contains(known.as_str()) {
            facts.projects.insert(known.clone());
        }
    }

    facts
}

fn domain_pattern(roots: &[String]) -> Regex {
    let escaped: Vec<String> = roots.iter().map(|r| regex::escape(r)).collect();
    let pattern = format!(
        r"(?i)(?:https?://)?([a-z0-9][-a-z0-9]*\.(?:{})[/\w.-]*)",
        escaped.join("|")
    );
    // Falls back to a never-matching pattern when roots are empty.
    Regex::new(&pattern).unwrap_or_else(|_| Regex::new(r"\z[^\s\S]").unwrap())
}

fn diff(pre: &BTreeSet<String>, post: &BTreeSet<String>) -> Vec<String> {
    pre.difference(post).cloned().collect()
}

/// Compare pre- and post-compression documents for dropped facts.
///
/// Only facts present in the pre-compression text can be flagged; the
/// ledger facts are informational context for operators.
pub fn check_integrity(
    pre_compression: &str,
    post_compression: &str,
    config: &IntegrityConfig,
) -> IntegrityReport {
    let pre = extract_facts(pre_compression, config);
    let post = extract_facts(post_compression, config);

    let mut dropped = BTreeMap::new();
    let categories = [
        ("ports", diff(&pre.ports, &post.ports)),
        ("containers", diff(&pre.containers, &post.containers)),
        ("domains", diff(&pre.domains, &post.domains)),
        ("ips", diff(&pre.ips, &post.ips)),
        ("projects", diff(&pre.projects, &post.projects)),
    ];
    let mut drop_count = 0;
    for (name, missing) in categories {
        if !missing.is_empty() {
            drop_count += missing.len();
            dropped.insert(name.to_string(), missing);
        }
    }

    let empty = Vec::new();
    let dropped_in = |key: &str| dropped.get(key).unwrap_or(&empty);
    let severity = if drop_count == 0 {
        DropSeverity::None
    } else if !dropped_in("ips").is_empty()
        || dropped_in("ports").len() >= 3
        || dropped_in("containers").len() >= 3
    {
        DropSeverity::High
    } else if !dropped_in("ports").is_empty()
        || !dropped_in("containers").is_empty()
        || !dropped_in("domains").is_empty()
    {
        DropSeverity::Medium
    } else {
        DropSeverity::Low
    };

    let details = if dropped.is_empty() {
        "All infrastructure facts preserved".to_string()
    } else {
        dropped
            .iter()
            .map(|(category, items)| format!("{category}: {}", items.join(", ")))
            .collect::<Vec<_>>()
            .join("; ")
    };

    IntegrityReport {
        passed: drop_count == 0,
        dropped,
        drop_count,
        severity,
        details,
    }
}

/// Parse the auto-detected-changes ledger for known container names and
/// host ports. Reference data only — see [`check_integrity`].
pub fn load_known_facts(kb_root: &Path) -> InfrastructureFacts {
    let mut facts = InfrastructureFacts::default();
    let ledger = kb_root.join("infrastructure").join("auto-detected-changes.md");
    let Ok(content) = std::fs::read_to_string(ledger) else {
        return facts;
    };

    for captures in LEDGER_ROW_RE.captures_iter(&content) {
        let service = captures[1].trim().to_string();
        let port_cell = captures[3].trim();
        if !matches!(service.as_str(), "service" | "service_name" | "---") {
            facts.containers.insert(service);
        }
        if let Some((host, _)) = port_cell.split_once(':') {
            if host.chars().all(|c| c.is_ascii_digit()) {
                facts.ports.insert(host.to_string());
            }
        }
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IntegrityConfig {
        IntegrityConfig {
            domain_roots: vec![
                "example.com".into(),
                "example.org".into(),
                "github.com".into(),
                "openrouter.ai".into(),
            ],
            known_projects: vec!["Engram".into()],
        }
    }

    #[test]
    fn extracts_ports_in_valid_range_only() {
        let facts = extract_facts(
            "redis on 6379, dashboard 3000:3000, privileged 80, ephemeral 70000, framing 2025",
            &config(),
        );
        assert!(facts.ports.contains("6379"));
        assert!(facts.ports.contains("3000"));
        assert!(!facts.ports.contains("80"));
        assert!(!facts.ports.contains("70000"));
        // Reserved framing range is excluded.
        assert!(!facts.ports.contains("2025"));
    }

    #[test]
    fn extracts_containers_without_stopwords() {
        let facts = extract_facts(
            "container: redis-01, and the service: postgres-main runs. docker loki shipped. service: image",
            &config(),
        );
        assert!(facts.containers.contains("redis-01"));
        assert!(facts.containers.contains("postgres-main"));
        assert!(facts.containers.contains("loki"));
        assert!(!facts.containers.contains("image"));
        assert!(!facts.containers.contains("the"));
    }

    #[test]
    fn extracts_domains_and_strips_paths() {
        let facts = extract_facts(
            "live at https://api.example.com/v2/health and docs.example.org. ignore other.host.net",
            &config(),
        );
        assert!(facts.domains.contains("api.example.com"));
        assert!(facts.domains.contains("docs.example.org"));
        assert_eq!(facts.domains.len(), 2);
    }

    #[test]
    fn extracts_ips_and_projects() {
        let facts = extract_facts(
            "host 10.0.0.12 runs project: Billing and the Engram deployment",
            &config(),
        );
        assert!(facts.ips.contains("10.0.0.12"));
        assert!(facts.projects.contains("Billing"));
        assert!(facts.projects.contains("Engram"));
    }

    #[test]
    fn no_drops_passes() {
        let text = "container: redis-01 on 6379 at api.example.com";
        let report = check_integrity(text, text, &config());
        assert!(report.passed);
        assert_eq!(report.severity, DropSeverity::None);
        assert_eq!(report.drop_count, 0);
    }

    #[test]
    fn single_drops_across_categories_are_medium() {
        let pre = "container: redis-01 on port 6379 serving api.example.com";
        let post = "# Master Context\n\nAll systems nominal.";
        let report = check_integrity(pre, post, &config());
        assert!(!report.passed);
        assert_eq!(report.severity, DropSeverity::Medium);
        assert_eq!(report.drop_count, 3);
    }

    #[test]
    fn dropped_ip_is_high_severity() {
        let pre = "gateway at 192.168.1.10, container: proxy-edge";
        let post = "container: proxy-edge still here";
        let report = check_integrity(pre, post, &config());
        assert_eq!(report.severity, DropSeverity::High);
        assert_eq!(report.dropped["ips"], vec!["192.168.1.10"]);
    }

    #[test]
    fn three_dropped_containers_is_high_severity() {
        let pre = "container: alpha-svc, container: beta-svc, container: gamma-svc,";
        let post = "nothing left";
        let report = check_integrity(pre, post, &config());
        assert_eq!(report.severity, DropSeverity::High);
    }

    #[test]
    fn only_projects_dropped_is_low_severity() {
        let pre = "project: Billing is active";
        let post = "everything else intact";
        let report = check_integrity(pre, post, &config());
        assert_eq!(report.severity, DropSeverity::Low);
    }

    #[test]
    fn new_facts_in_post_are_not_drops() {
        let pre = "container: redis-01 on 6379";
        let post = "container: redis-01 on 6379, plus container: postgres-new on 5432";
        let report = check_integrity(pre, post, &config());
        assert!(report.passed);
    }

    #[test]
    fn ledger_parse_is_reference_only() {
        let dir = tempfile::tempdir().unwrap();
        let infra = dir.path().join("infrastructure");
        std::fs::create_dir_all(&infra).unwrap();
        std::fs::write(
            infra.join("auto-detected-changes.md"),
            "### [2026-01-01] Stack: loki\n\n| Service | Image | Ports | Networks |\n|---------|-------|-------|----------|\n| loki-main | grafana/loki | 3100:3100 | observability |\n",
        )
        .unwrap();

        let facts = load_known_facts(dir.path());
        assert!(facts.containers.contains("loki-main"));
        assert!(facts.ports.contains("3100"));

        // The ledger facts never contaminate a pre/post comparison: a
        // master that never mentioned loki-main is not "dropping" it.
        let report = check_integrity("container: redis-01,", "container: redis-01,", &config());
        assert!(report.passed);
    }

    #[test]
    fn missing_ledger_is_empty_reference() {
        let dir = tempfile::tempdir().unwrap();
        let facts = load_known_facts(dir.path());
        assert!(facts.containers.is_empty());
        assert!(facts.ports.is_empty());
    }
}
