use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::watch::WatchSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub source: Option<String>,
    pub watch: WatchConfig,
    pub diff: DiffConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    #[serde(alias = "reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(alias = "retries")]
    pub max_retries: u32,
    /// Server-side timeout of one watch request; the stream is reopened after it.
    #[serde(alias = "timeout")]
    pub timeout_secs: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 900,
            max_retries: 5,
            timeout_secs: 290,
        }
    }
}

impl WatchConfig {
    pub fn settings(&self) -> WatchSettings {
        WatchSettings {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms.max(50)),
            max_retries: self.max_retries.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    #[serde(alias = "context")]
    pub context_lines: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self { context_lines: 3 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct KubesyncConfigFile {
    #[serde(default)]
    watch: WatchConfig,
    #[serde(default)]
    diff: DiffConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            source: None,
            watch: WatchConfig::default(),
            diff: DiffConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => discover_config_path(),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config {}", path.display()))?;
        let parsed = parse_config(&raw)
            .with_context(|| format!("failed to parse runtime config {}", path.display()))?;
        Ok(Self {
            source: Some(path.display().to_string()),
            ..parsed
        })
    }
}

fn parse_config(raw: &str) -> Result<RuntimeConfig> {
    if raw.trim().is_empty() {
        return Ok(RuntimeConfig::default());
    }
    let parsed: KubesyncConfigFile = serde_yaml::from_str(raw)?;
    Ok(RuntimeConfig {
        source: None,
        watch: parsed.watch,
        diff: parsed.diff,
    })
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUBESYNC_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("kubesync.yaml"),
        PathBuf::from("kubesync.yml"),
        PathBuf::from(".kubesync.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/kubesync/config.yaml"),
            PathBuf::from(&home).join(".config/kubesync/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{RuntimeConfig, parse_config};
    use std::time::Duration;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = parse_config("diff:\n  context_lines: 5\n").expect("valid yaml");
        assert_eq!(config.diff.context_lines, 5);
        assert_eq!(config.watch.reconnect_delay_ms, 900);
        assert_eq!(config.watch.max_retries, 5);
        assert_eq!(config.watch.timeout_secs, 290);

        assert_eq!(parse_config("  \n").expect("empty file"), RuntimeConfig::default());
    }

    #[test]
    fn watch_aliases_and_settings_clamping() {
        let config = parse_config("watch:\n  reconnect_delay: 10\n  retries: 0\n  timeout: 60\n")
            .expect("valid yaml");
        let settings = config.watch.settings();
        assert_eq!(settings.reconnect_delay, Duration::from_millis(50));
        assert_eq!(settings.max_retries, 1);
        assert_eq!(config.watch.timeout_secs, 60);
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(parse_config("watch: [1, 2").is_err());
    }
}
