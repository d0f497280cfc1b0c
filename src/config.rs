// Engine settings load/save
//
// Only tuning knobs live here. Throttles are never written to disk.

use crate::backends::filter::FilterSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = ".config/procshaper";
const CONFIG_FILE: &str = "config.json";

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process list refresh and exit sweep period
    pub refresh_interval_ms: u64,

    /// Traffic sampling period
    pub stats_interval_ms: u64,

    /// Longest a packet may wait for tokens before it is dropped
    pub max_pacing_wait_ms: u64,

    /// Kernel-side queue bound per filter
    pub queue_max_len: u32,

    /// First NFQUEUE number handed out to filters
    pub queue_base: u16,

    /// nftables table owned by this tool
    pub nft_table: String,

    /// cgroup v2 directory holding per-process cgroups
    pub cgroup_name: String,

    /// Preferred socket mapper backend
    pub preferred_socket_mapper: Option<String>,

    /// Capture on this interface only (None = every up interface)
    pub capture_interface: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 5000,
            stats_interval_ms: 3000,
            max_pacing_wait_ms: 500,
            queue_max_len: 1024,
            queue_base: 7100,
            nft_table: "procshaper".to_string(),
            cgroup_name: "procshaper".to_string(),
            preferred_socket_mapper: None,
            capture_interface: None,
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context(format!("Failed to create config directory: {:?}", dir))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    /// Bounded pacing wait per packet
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.max_pacing_wait_ms)
    }

    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            nft_table: self.nft_table.clone(),
            cgroup_name: self.cgroup_name.clone(),
            queue_base: self.queue_base,
            queue_max_len: self.queue_max_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization() {
        let config = Config {
            max_pacing_wait_ms: 250,
            preferred_socket_mapper: Some("procfs".to_string()),
            ..Config::default()
        };

        let json = serde_json::to_string_pretty(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(r#"{ "stats_interval_ms": 1000 }"#).unwrap();
        assert_eq!(config.stats_interval_ms, 1000);
        assert_eq!(config.refresh_interval_ms, 5000);
        assert_eq!(config.nft_table, "procshaper");
        assert_eq!(config.pacing(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("procshaper-does-not-exist/config.json");
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_save_and_load_round_trip_on_disk() {
        let dir = std::env::temp_dir().join(format!("procshaper-config-{}", std::process::id()));
        let path = dir.join("config.json");

        let config = Config {
            queue_base: 9000,
            capture_interface: Some("eth0".to_string()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_filter_settings_follow_config() {
        let config = Config {
            nft_table: "shaper_test".to_string(),
            queue_max_len: 64,
            ..Config::default()
        };
        let settings = config.filter_settings();
        assert_eq!(settings.nft_table, "shaper_test");
        assert_eq!(settings.queue_max_len, 64);
        assert_eq!(settings.queue_base, 7100);
    }
}
