//! Ignore rules for watched trees.

use std::path::Path;

/// Directory names that never produce change events.
const IGNORE_DIRS: [&str; 7] = [
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    "data",
];

/// Extensions of build artifacts, editor droppings, and local state.
const IGNORE_EXTENSIONS: [&str; 8] = ["pyc", "swp", "swo", "tmp", "log", "db", "sqlite", "lock"];

const IGNORE_PREFIXES: [&str; 2] = [".#", "#"];

pub fn should_ignore(path: &Path) -> bool {
    for component in path.components() {
        if let Some(name) = component.as_os_str().to_str() {
            if IGNORE_DIRS.contains(&name) {
                return true;
            }
        }
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    if IGNORE_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if IGNORE_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn ignores_vcs_and_caches() {
        assert!(should_ignore(&PathBuf::from(".git/objects/ab/cdef")));
        assert!(should_ignore(&PathBuf::from("app/node_modules/x/index.js")));
        assert!(should_ignore(&PathBuf::from("stacks/app/data/db.bin")));
    }

    #[test]
    fn ignores_artifacts_and_temp_names() {
        assert!(should_ignore(&PathBuf::from("stacks/app/service.log")));
        assert!(should_ignore(&PathBuf::from("stacks/app/.#config.yml")));
        assert!(should_ignore(&PathBuf::from("stacks/app/#draft")));
        assert!(should_ignore(&PathBuf::from("cache.sqlite")));
    }

    #[test]
    fn keeps_real_files() {
        assert!(!should_ignore(&PathBuf::from("stacks/app/docker-compose.yml")));
        assert!(!should_ignore(&PathBuf::from("projects/api/src/main.rs")));
        assert!(!should_ignore(&PathBuf::from("stacks/app/.env")));
    }
}
