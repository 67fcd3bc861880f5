//! Engine configuration: concurrency caps and the range-response policy.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// What to do when a server answers a ranged GET with `200 OK` instead of
/// `206 Partial Content`.
///
/// A 200 means the server ignored the `Range` header and is sending the full
/// body; for any worker whose range does not start at byte 0 that body is the
/// wrong bytes. `Strict` fails such responses; `AcceptFullBody` admits them
/// for callers who know their server streams the requested slice anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RangeResponsePolicy {
    #[default]
    Strict,
    AcceptFullBody,
}

/// Tunables loaded from a TOML file or built from defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of tasks downloading at once.
    pub max_parallel_tasks: u8,
    /// Capacity of the admission queue; `add_task` blocks when full.
    pub task_queue_capacity: usize,
    /// See [`RangeResponsePolicy`].
    pub range_response_policy: RangeResponsePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 3,
            task_queue_capacity: 64,
            range_response_policy: RangeResponsePolicy::Strict,
        }
    }
}

/// Load configuration from `path`, creating a default file if none exists.
pub fn load_or_init(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg: EngineConfig = toml::from_str(&data)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_parallel_tasks, 3);
        assert_eq!(cfg.task_queue_capacity, 64);
        assert_eq!(cfg.range_response_policy, RangeResponsePolicy::Strict);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_parallel_tasks, cfg.max_parallel_tasks);
        assert_eq!(parsed.task_queue_capacity, cfg.task_queue_capacity);
        assert_eq!(parsed.range_response_policy, cfg.range_response_policy);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            max_parallel_tasks = 2
            task_queue_capacity = 8
            range_response_policy = "accept_full_body"
        "#;
        let cfg: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_parallel_tasks, 2);
        assert_eq!(cfg.task_queue_capacity, 8);
        assert_eq!(cfg.range_response_policy, RangeResponsePolicy::AcceptFullBody);
    }

    #[test]
    fn load_or_init_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("engine.toml");
        let cfg = load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.max_parallel_tasks, 3);

        let again = load_or_init(&path).unwrap();
        assert_eq!(again.task_queue_capacity, 64);
    }
}
