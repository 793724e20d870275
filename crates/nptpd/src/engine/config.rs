//! Configuration loading and validation.
//!
//! A mapping set is a sequence of entries, each with an enable flag, a TCP
//! port, a local endpoint path and a description, expressed as TOML and
//! validated with `serde` + `toml` before the engine ever sees it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::error::{EngineError, Result};
use super::mapping::{MappingConfig, MAX_MAPPING_NUM};

#[derive(Debug, Clone, Deserialize)]
struct RawMapping {
    #[serde(default = "default_enable")]
    enable: bool,
    port: u16,
    dir: PathBuf,
    name: String,
    #[serde(default)]
    description: String,
}

fn default_enable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default)]
    mapping: Vec<RawMapping>,
}

/// Reads and validates the mapping set at `path`, returning a dense,
/// zero-indexed, duplicate-free collection ready for the engine.
///
/// # Errors
/// `EngineError::ConfigInvalid` on unreadable/unparsable TOML, duplicate
/// `port`/`dir+name` pairs among enabled mappings, or an empty/over-capacity
/// enabled-mapping set.
pub fn load_mappings(path: &Path) -> Result<Vec<MappingConfig>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| EngineError::ConfigInvalid(format!("failed to read {}: {e}", path.display())))?;
    parse_mappings(&data)
}

fn parse_mappings(data: &str) -> Result<Vec<MappingConfig>> {
    let raw: RawConfig = toml::from_str(data).map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;

    let enabled: Vec<&RawMapping> = raw.mapping.iter().filter(|m| m.enable).collect();

    if enabled.is_empty() {
        return Err(EngineError::ConfigInvalid("mapping set is empty".to_string()));
    }
    if enabled.len() > MAX_MAPPING_NUM {
        return Err(EngineError::ConfigInvalid(format!(
            "too many enabled mappings: {} (max {MAX_MAPPING_NUM})",
            enabled.len()
        )));
    }

    let mut seen_ports: HashSet<u16> = HashSet::new();
    let mut seen_paths: HashSet<PathBuf> = HashSet::new();
    let mut mappings = Vec::with_capacity(enabled.len());

    for (index, raw) in enabled.into_iter().enumerate() {
        if !seen_ports.insert(raw.port) {
            return Err(EngineError::ConfigInvalid(format!("duplicate tcp port: {}", raw.port)));
        }
        let peer_path = raw.dir.join(&raw.name);
        if !seen_paths.insert(peer_path.clone()) {
            return Err(EngineError::ConfigInvalid(format!("duplicate local endpoint path: {}", peer_path.display())));
        }
        mappings.push(MappingConfig {
            index,
            tcp_port: raw.port,
            pipe_dir: raw.dir.clone(),
            pipe_name: raw.name.clone(),
            description: raw.description.clone(),
        });
    }

    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
[[mapping]]
port = 9000
dir = "/tmp/t"
name = "p0"
description = "test"
"#;
        let mappings = parse_mappings(toml).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].index, 0);
        assert_eq!(mappings[0].tcp_port, 9000);
    }

    #[test]
    fn disabled_mapping_is_excluded_and_does_not_affect_index() {
        let toml = r#"
[[mapping]]
enable = false
port = 9000
dir = "/tmp/a"
name = "p0"

[[mapping]]
port = 9001
dir = "/tmp/b"
name = "p1"
"#;
        let mappings = parse_mappings(toml).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].index, 0);
        assert_eq!(mappings[0].tcp_port, 9001);
    }

    #[test]
    fn empty_mapping_set_is_rejected() {
        let err = parse_mappings("").unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn duplicate_ports_are_rejected() {
        let toml = r#"
[[mapping]]
port = 9000
dir = "/tmp/a"
name = "p0"

[[mapping]]
port = 9000
dir = "/tmp/b"
name = "p1"
"#;
        let err = parse_mappings(toml).unwrap_err();
        let EngineError::ConfigInvalid(msg) = err else { panic!("wrong variant") };
        assert!(msg.contains("duplicate tcp port"));
    }

    #[test]
    fn duplicate_local_paths_are_rejected() {
        let toml = r#"
[[mapping]]
port = 9000
dir = "/tmp/a"
name = "p0"

[[mapping]]
port = 9001
dir = "/tmp/a"
name = "p0"
"#;
        let err = parse_mappings(toml).unwrap_err();
        let EngineError::ConfigInvalid(msg) = err else { panic!("wrong variant") };
        assert!(msg.contains("duplicate local endpoint path"));
    }

    #[test]
    fn over_capacity_mapping_set_is_rejected() {
        let mut toml = String::new();
        for i in 0..=MAX_MAPPING_NUM {
            toml.push_str(&format!("[[mapping]]\nport = {}\ndir = \"/tmp/a\"\nname = \"p{i}\"\n", 10000 + i));
        }
        let err = parse_mappings(&toml).unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }
}
