//! Application configuration management.
//!
//! Configuration is stored at `~/.config/redmansion/config.json`. Every limit
//! has a default, so a missing or partial file is fine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::cache::bounded::{DEFAULT_EMERGENCY_FRACTION, DEFAULT_EVICTION_FRACTION};
use crate::cache::chapter_index::{
    CHAPTER_INDEX_NAMESPACE, DEFAULT_CHAPTER_INDEX_TTL_HOURS, DEFAULT_MAX_CHAPTER_LISTS,
};
use crate::cache::media::{AUTHOR_NAMESPACE, COVER_NAMESPACE, DEFAULT_MAX_AUTHORS, DEFAULT_MAX_COVERS};
use crate::cache::CacheConfig;
use crate::progress::{TrackerConfig, DEFAULT_SCROLL_SAMPLE_MS};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "redmansion";

const CONFIG_FILE: &str = "config.json";

/// Session storage lives under the cache directory
const SESSION_DIR: &str = "session";

pub const DEFAULT_API_BASE_URL: &str = "https://api.redmansion.app/v1";

/// About ten years
const MAX_TTL_HOURS: i64 = 24 * 365 * 10;

pub const ENV_API_URL: &str = "REDMANSION_API_URL";
pub const ENV_API_TOKEN: &str = "REDMANSION_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Only ever read from the environment
    #[serde(skip)]
    pub api_token: Option<String>,
    pub cover_cache_entries: usize,
    pub author_cache_entries: usize,
    pub chapter_index_entries: usize,
    pub chapter_index_ttl_hours: i64,
    pub eviction_fraction: f64,
    pub emergency_fraction: f64,
    pub scroll_sample_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_token: None,
            cover_cache_entries: DEFAULT_MAX_COVERS,
            author_cache_entries: DEFAULT_MAX_AUTHORS,
            chapter_index_entries: DEFAULT_MAX_CHAPTER_LISTS,
            chapter_index_ttl_hours: DEFAULT_CHAPTER_INDEX_TTL_HOURS,
            eviction_fraction: DEFAULT_EVICTION_FRACTION,
            emergency_fraction: DEFAULT_EMERGENCY_FRACTION,
            scroll_sample_ms: DEFAULT_SCROLL_SAMPLE_MS,
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that cannot be turned into durations.
    /// Cache limits are checked again when the caches are built.
    pub fn validate(&self) -> Result<()> {
        if self.chapter_index_ttl() <= Duration::zero() {
            anyhow::bail!(
                "chapter_index_ttl_hours must be between 1 and {}, got {}",
                MAX_TTL_HOURS,
                self.chapter_index_ttl_hours
            );
        }
        if self.scroll_sample_ms < 0 {
            anyhow::bail!("scroll_sample_ms must not be negative, got {}", self.scroll_sample_ms);
        }
        Ok(())
    }

    /// Zero when the configured value is out of range.
    fn chapter_index_ttl(&self) -> Duration {
        if !(1..=MAX_TTL_HOURS).contains(&self.chapter_index_ttl_hours) {
            return Duration::zero();
        }
        Duration::try_hours(self.chapter_index_ttl_hours).unwrap_or_else(Duration::zero)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(SESSION_DIR))
    }

    /// Blank values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(token) = lookup(ENV_API_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.api_token = Some(token.trim().to_string());
        }
    }

    pub fn cover_cache_config(&self) -> CacheConfig {
        self.with_fractions(CacheConfig::new(COVER_NAMESPACE, self.cover_cache_entries))
    }

    pub fn author_cache_config(&self) -> CacheConfig {
        self.with_fractions(CacheConfig::new(AUTHOR_NAMESPACE, self.author_cache_entries))
    }

    pub fn chapter_index_config(&self) -> CacheConfig {
        self.with_fractions(
            CacheConfig::new(CHAPTER_INDEX_NAMESPACE, self.chapter_index_entries)
                .with_ttl(self.chapter_index_ttl()),
        )
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            sample_interval: Duration::milliseconds(self.scroll_sample_ms.max(0)),
        }
    }

    fn with_fractions(&self, config: CacheConfig) -> CacheConfig {
        config
            .with_eviction_fraction(self.eviction_fraction)
            .with_emergency_fraction(self.emergency_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cover_cache_entries, 40);
        assert_eq!(config.author_cache_entries, 20);
        assert_eq!(config.chapter_index_entries, 40);
        assert_eq!(config.chapter_index_ttl_hours, 24);
        assert_eq!(config.eviction_fraction, 0.25);
        assert_eq!(config.emergency_fraction, 0.5);
        assert_eq!(config.tracker_config(), TrackerConfig::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cover_cache_entries": 10, "eviction_fraction": 0.5}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.cover_cache_entries, 10);
        assert_eq!(config.author_cache_entries, 20);
        assert_eq!(config.cover_cache_config().max_entries, 10);
        assert_eq!(config.cover_cache_config().eviction_fraction, 0.5);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_save_roundtrip_never_writes_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            api_token: Some("secret".to_string()),
            chapter_index_ttl_hours: 6,
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("secret"));

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.chapter_index_ttl_hours, 6);
        assert!(loaded.api_token.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_API_URL, " http://localhost:8080 "),
            (ENV_API_TOKEN, "   "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_out_of_range_ttl_is_rejected_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"chapter_index_ttl_hours": 9223372036854775807}"#).unwrap();
        assert!(Config::load_from(&path).is_err());

        // Built in code instead of loaded: the cache config is rejected
        let config = Config {
            chapter_index_ttl_hours: i64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let cache_config = config.chapter_index_config();
        assert_eq!(cache_config.ttl, Some(Duration::zero()));
        assert!(crate::cache::ChapterIndexCache::new(
            cache_config,
            std::sync::Arc::new(crate::cache::MemoryStorage::new()),
            std::sync::Arc::new(crate::utils::ManualClock::default()),
        )
        .is_err());

        let config = Config {
            chapter_index_ttl_hours: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_sample_interval_rejected() {
        let config = Config {
            scroll_sample_ms: -5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_chapter_index_config_has_ttl() {
        let config = Config {
            chapter_index_ttl_hours: 2,
            ..Default::default()
        };
        let cache_config = config.chapter_index_config();
        assert_eq!(cache_config.ttl, Some(Duration::hours(2)));
        assert_eq!(cache_config.namespace, CHAPTER_INDEX_NAMESPACE);
    }
}
