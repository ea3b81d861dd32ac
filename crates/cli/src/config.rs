//! Vigil configuration file
//!
//! TOML at `<config_dir>/vigil/config.toml` unless `--config` points
//! elsewhere. Every section and key is optional; missing values take the
//! engine defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vigil_watcher::{TargetOptions, WatcherConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub watcher: WatcherSection,
    pub targets: Vec<TargetSection>,
    pub alerts: AlertSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub debounce_interval_ms: u64,
    pub debounce_hard_cap_ms: u64,
    pub polling_interval_ms: u64,
    pub consumer_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub hash_contents: bool,
    pub max_rescan_attempts: u8,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            debounce_interval_ms: 300,
            debounce_hard_cap_ms: 5_000,
            polling_interval_ms: 2_000,
            consumer_queue_capacity: 1_024,
            event_queue_capacity: 8_192,
            hash_contents: false,
            max_rescan_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSection {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub use_gitignore: bool,
    #[serde(default)]
    pub skip_editor_temp: bool,
}

impl TargetSection {
    pub fn options(&self) -> TargetOptions {
        TargetOptions {
            recursive: self.recursive,
            exclude_patterns: self.exclude.clone(),
            use_gitignore: self.use_gitignore,
            skip_editor_temp: self.skip_editor_temp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSection {
    /// Colored lines on stdout
    pub console: bool,
    /// JSON lines on stdout (replaces console)
    pub json: bool,
    /// Events through the tracing subscriber
    pub log: bool,
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            console: true,
            json: false,
            log: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl VigilConfig {
    /// Check every value against its valid range
    pub fn validate(&self) -> Result<()> {
        let w = &self.watcher;
        if !(10..=10_000).contains(&w.debounce_interval_ms) {
            anyhow::bail!(
                "watcher.debounce_interval_ms must be between 10 and 10000 (got {})",
                w.debounce_interval_ms
            );
        }
        if w.debounce_hard_cap_ms < w.debounce_interval_ms || w.debounce_hard_cap_ms > 60_000 {
            anyhow::bail!(
                "watcher.debounce_hard_cap_ms must be between debounce_interval_ms ({}) and 60000 (got {})",
                w.debounce_interval_ms,
                w.debounce_hard_cap_ms
            );
        }
        if !(100..=3_600_000).contains(&w.polling_interval_ms) {
            anyhow::bail!(
                "watcher.polling_interval_ms must be between 100 and 3600000 (got {})",
                w.polling_interval_ms
            );
        }
        if !(1..=1_000_000).contains(&w.consumer_queue_capacity) {
            anyhow::bail!(
                "watcher.consumer_queue_capacity must be between 1 and 1,000,000 (got {})",
                w.consumer_queue_capacity
            );
        }
        if !(1..=1_000_000).contains(&w.event_queue_capacity) {
            anyhow::bail!(
                "watcher.event_queue_capacity must be between 1 and 1,000,000 (got {})",
                w.event_queue_capacity
            );
        }
        if !(1..=10).contains(&w.max_rescan_attempts) {
            anyhow::bail!(
                "watcher.max_rescan_attempts must be between 1 and 10 (got {})",
                w.max_rescan_attempts
            );
        }
        if let Some(target) = self.targets.iter().find(|t| t.path.as_os_str().is_empty()) {
            anyhow::bail!("targets entry with an empty path: {:?}", target);
        }
        Ok(())
    }

    pub fn to_watcher_config(&self) -> WatcherConfig {
        let w = &self.watcher;
        WatcherConfig {
            debounce_interval: Duration::from_millis(w.debounce_interval_ms),
            debounce_hard_cap: Duration::from_millis(w.debounce_hard_cap_ms),
            polling_interval: Duration::from_millis(w.polling_interval_ms),
            consumer_queue_capacity: w.consumer_queue_capacity,
            event_queue_capacity: w.event_queue_capacity,
            hash_contents: w.hash_contents,
            max_rescan_attempts: w.max_rescan_attempts,
            ..Default::default()
        }
    }
}

/// Default config location
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vigil").join("config.toml"))
}

/// Load from `explicit`, or from the default location
///
/// A missing default file yields the defaults; a missing explicit file is an
/// error.
pub fn load(explicit: Option<&Path>) -> Result<VigilConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_file_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(VigilConfig::default()),
        },
    };
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<VigilConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse config file {}", path.display()))
}

pub fn save(config: &VigilConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, text).with_context(|| format!("Failed to write config file {}", path.display()))
}

/// Annotated example, valid as-is
pub fn example_config() -> &'static str {
    r#"# Vigil configuration

[watcher]
# Quiet period that closes a burst of changes on one path (10-10000)
debounce_interval_ms = 300
# Longest a burst may stay open under sustained churn (debounce..60000)
debounce_hard_cap_ms = 5000
# Walk interval for roots the native backend refuses (100-3600000)
polling_interval_ms = 2000
# Per-consumer queue depth; the oldest event is dropped when full
consumer_queue_capacity = 1024
# Raw hand-off depth; overflowing it triggers a rescan
event_queue_capacity = 8192
# Hash file contents to detect same-size rewrites
hash_contents = false
# Rescan attempts before a root is declared lost (1-10)
max_rescan_attempts = 3

[[targets]]
path = "/srv/data"
recursive = true
exclude = ["*.tmp", "cache/"]
use_gitignore = false

[alerts]
console = true
json = false
log = true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_example_config_parses_and_validates() -> Result<()> {
        let config: VigilConfig = toml::from_str(example_config())?;
        config.validate()?;
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].exclude, vec!["*.tmp", "cache/"]);
        assert_eq!(config.watcher, WatcherSection::default());
        Ok(())
    }

    #[test]
    fn test_missing_sections_take_defaults() -> Result<()> {
        let config: VigilConfig = toml::from_str("[[targets]]\npath = \"/tmp\"\n")?;
        assert_eq!(config.watcher, WatcherSection::default());
        assert_eq!(config.alerts, AlertSection::default());
        assert!(config.targets[0].recursive);
        assert!(!config.targets[0].use_gitignore);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = VigilConfig::default();
        config.watcher.debounce_interval_ms = 5;
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.watcher.debounce_hard_cap_ms = 100;
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.watcher.polling_interval_ms = 50;
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.watcher.consumer_queue_capacity = 0;
        assert!(config.validate().is_err());

        assert!(VigilConfig::default().validate().is_ok());
    }

    #[test]
    fn test_to_watcher_config() {
        let mut config = VigilConfig::default();
        config.watcher.debounce_interval_ms = 120;
        config.watcher.hash_contents = true;
        let watcher = config.to_watcher_config();
        assert_eq!(watcher.debounce_interval, Duration::from_millis(120));
        assert_eq!(watcher.debounce_hard_cap, Duration::from_secs(5));
        assert!(watcher.hash_contents);
    }

    #[test]
    fn test_save_then_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested/config.toml");
        let mut config = VigilConfig::default();
        config.targets.push(TargetSection {
            path: temp_dir.path().to_path_buf(),
            recursive: false,
            exclude: vec!["*.swp".into()],
            use_gitignore: true,
            skip_editor_temp: true,
        });

        save(&config, &path)?;
        assert_eq!(load(Some(&path))?, config);
        assert!(load(Some(&temp_dir.path().join("absent.toml"))).is_err());
        Ok(())
    }
}
