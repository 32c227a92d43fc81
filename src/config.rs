//! Configuration for the download queue and image loader.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pipeline configuration.
///
/// Every field has a serde default, so a config file only needs the keys it
/// wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of concurrent download workers
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,

    /// HTTP connect timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// HTTP read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Maximum redirect hops before a download counts as failed
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// How many times a failing decode is retried before being dropped
    #[serde(default = "default_decode_retries")]
    pub decode_retries: u32,

    /// Used/limit memory ratio above which the cache evicts on insert
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,

    /// Largest power-of-two downsample factor applied during decode
    #[serde(default = "default_sample_size_cap")]
    pub sample_size_cap: u32,

    /// Maximum number of decoded entries kept in the cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Byte budget for decoded payloads, consumed by the default probe
    #[serde(default = "default_decode_memory_budget")]
    pub decode_memory_budget: u64,

    /// User-Agent header; some servers reject requests without one
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_download_workers() -> usize {
    2
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_max_redirects() -> usize {
    5
}

fn default_decode_retries() -> u32 {
    10
}

fn default_memory_threshold() -> f64 {
    0.7
}

fn default_sample_size_cap() -> u32 {
    32
}

fn default_cache_capacity() -> usize {
    40
}

fn default_decode_memory_budget() -> u64 {
    256 * 1024 * 1024
}

fn default_user_agent() -> String {
    format!("magpie/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_workers: default_download_workers(),
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            max_redirects: default_max_redirects(),
            decode_retries: default_decode_retries(),
            memory_threshold: default_memory_threshold(),
            sample_size_cap: default_sample_size_cap(),
            cache_capacity: default_cache_capacity(),
            decode_memory_budget: default_decode_memory_budget(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("magpie");
        Ok(config_dir.join("config.toml"))
    }

    /// Load config from the default path or create default
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        Self::load_from(&path)
    }

    /// Load config from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_documented_policy() {
        let config = Config::default();
        assert_eq!(config.decode_retries, 10);
        assert!((config.memory_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.sample_size_cap, 32);
        assert_eq!(config.max_redirects, 5);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.download_workers = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.download_workers, 7);
        assert_eq!(loaded.decode_retries, 10);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cache_capacity = 5\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.cache_capacity, 5);
        assert_eq!(loaded.download_workers, 2);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.cache_capacity, 40);
    }
}
