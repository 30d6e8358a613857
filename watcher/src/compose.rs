//! Compose-file parsing.
//!
//! Extracts per-service facts from docker-compose files: name, image,
//! port mappings, networks, volume source paths, and environment
//! variable names (never values — those may be secrets). Malformed YAML
//! falls back to a regex pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_yaml::Value;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ComposeService {
    pub name: String,
    pub image: String,
    pub ports: Vec<String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    pub environment_keys: Vec<String>,
}

pub fn is_compose_file(name: &str) -> bool {
    matches!(
        name,
        "docker-compose.yml" | "docker-compose.yaml" | "compose.yml" | "compose.yaml"
    )
}

/// Stack name from a path like `stacks/loki/docker-compose.yml`.
pub fn stack_name(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2].to_string()
    } else {
        "unknown".to_string()
    }
}

pub fn parse_compose(content: &str) -> Vec<ComposeService> {
    match serde_yaml::from_str::<Value>(content) {
        Ok(root) => parse_yaml(&root),
        Err(e) => {
            warn!("compose: YAML parse failed ({e}), falling back to regex");
            parse_regex(content)
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => serde_yaml::to_string(other).ok().map(|s| s.trim().to_string()),
            })
            .collect(),
        Some(Value::Mapping(map)) => map
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_yaml(root: &Value) -> Vec<ComposeService> {
    let Some(services) = root.get("services").and_then(Value::as_mapping) else {
        return Vec::new();
    };

    let mut parsed = Vec::new();
    for (key, svc) in services {
        let Some(service_key) = key.as_str() else {
            continue;
        };
        if !svc.is_mapping() {
            continue;
        }

        let name = svc
            .get("container_name")
            .and_then(Value::as_str)
            .unwrap_or(service_key)
            .to_string();
        let image = svc
            .get("image")
            .and_then(Value::as_str)
            .unwrap_or("custom (build)")
            .to_string();

        let ports = string_list(svc.get("ports"));
        let networks = string_list(svc.get("networks"));
        let volumes: Vec<String> = string_list(svc.get("volumes"))
            .into_iter()
            .map(|v| match v.split_once(':') {
                Some((source, _)) => source.to_string(),
                None => v,
            })
            .collect();

        let environment_keys = match svc.get("environment") {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|entry| entry.split('=').next())
                .map(|key| key.trim().trim_start_matches("- ").to_string())
                .collect(),
            Some(Value::Mapping(map)) => map
                .keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        parsed.push(ComposeService {
            name,
            image,
            ports,
            networks,
            volumes,
            environment_keys,
        });
    }
    parsed
}

static CONTAINER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"container_name:\s*(\S+)").unwrap());
static IMAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"image:\s*(\S+)").unwrap());
static PORT_MAP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""?(\d+):(\d+)"?"#).unwrap());

/// Last-resort extraction when the YAML does not parse.
fn parse_regex(content: &str) -> Vec<ComposeService> {
    let mut services: Vec<ComposeService> = CONTAINER_NAME_RE
        .captures_iter(content)
        .map(|captures| ComposeService {
            name: captures[1].to_string(),
            image: "unknown".to_string(),
            ..Default::default()
        })
        .collect();

    for captures in IMAGE_RE.captures_iter(content) {
        if let Some(service) = services.iter_mut().find(|s| s.image == "unknown") {
            service.image = captures[1].to_string();
        }
    }

    for captures in PORT_MAP_RE.captures_iter(content) {
        if let Some(service) = services.last_mut() {
            service.ports.push(format!("{}:{}", &captures[1], &captures[2]));
        }
    }
    services
}
