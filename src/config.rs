//! Configuration management for spotlight-narration.
//!
//! Loads config from a YAML file in standard locations. Every section has
//! defaults, so a partial file (or no file at all) is valid.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::period::Granularity;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub summary_path: String,
    pub tts_path: String,
    /// Sent as a bearer token on both endpoints when non-empty.
    pub api_key: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            summary_path: "/api/period-summary".into(),
            tts_path: "/api/tts".into(),
            api_key: String::new(),
        }
    }
}

impl BackendConfig {
    pub fn summary_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.summary_path)
    }

    pub fn tts_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.tts_path)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub timeout_secs: u64,
    pub granularity: Granularity,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            granularity: Granularity::Week,
        }
    }
}

impl SummaryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    pub voice_id: String,
    pub model_id: String,
    pub timeout_secs: u64,
    /// Empty means `~/.spotlight-narration/narration-cache.json`.
    pub cache_path: String,
    /// Oldest entries are evicted past this count. `None` keeps everything.
    pub max_entries: Option<usize>,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            voice_id: "21m00Tcm4TlvDq8ikWAM".into(),
            model_id: "eleven_multilingual_v2".into(),
            timeout_secs: 60,
            cache_path: String::new(),
            max_entries: None,
        }
    }
}

impl NarrationConfig {
    pub fn cache_file(&self) -> PathBuf {
        if self.cache_path.is_empty() {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".spotlight-narration")
                .join("narration-cache.json")
        } else {
            PathBuf::from(&self.cache_path)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub tick_ms: u64,
    pub seek_settle_ms: u64,
    /// Stop every other card when one starts playing.
    pub exclusive: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            seek_settle_ms: 250,
            exclusive: false,
        }
    }
}

impl PlaybackConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }

    pub fn seek_settle(&self) -> Duration {
        Duration::from_millis(self.seek_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub user_id: String,
    pub backend: BackendConfig,
    pub summary: SummaryConfig,
    pub narration: NarrationConfig,
    pub playback: PlaybackConfig,
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: "local".into(),
            backend: BackendConfig::default(),
            summary: SummaryConfig::default(),
            narration: NarrationConfig::default(),
            playback: PlaybackConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./spotlight.yaml
    /// 2. ~/.config/spotlight-narration/config.yaml
    /// 3. /etc/spotlight-narration/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("spotlight.yaml")),
                dirs::home_dir().map(|h| h.join(".config/spotlight-narration/config.yaml")),
                Some(PathBuf::from("/etc/spotlight-narration/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            "user_id: u-42\nnarration:\n  max_entries: 12\nplayback:\n  exclusive: true\n",
        )
        .unwrap();
        assert_eq!(config.user_id, "u-42");
        assert_eq!(config.narration.max_entries, Some(12));
        assert!(config.playback.exclusive);
        assert_eq!(config.playback.seek_settle_ms, 250);
        assert_eq!(config.summary.timeout_secs, 30);
        assert_eq!(config.summary.granularity, Granularity::Week);
    }

    #[test]
    fn granularity_parses_lowercase() {
        let config = Config::from_yaml("summary:\n  granularity: month\n").unwrap();
        assert_eq!(config.summary.granularity, Granularity::Month);
    }

    #[test]
    fn backend_urls_join_without_double_slash() {
        let backend = BackendConfig {
            base_url: "https://api.example.com/".into(),
            ..BackendConfig::default()
        };
        assert_eq!(backend.summary_url(), "https://api.example.com/api/period-summary");
        assert_eq!(backend.tts_url(), "https://api.example.com/api/tts");
    }

    #[test]
    fn missing_explicit_path_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.yaml")));
        assert_eq!(config.api.port, 8768);
    }

    #[test]
    fn explicit_cache_path_is_used() {
        let narration = NarrationConfig {
            cache_path: "/tmp/spotlight/cache.json".into(),
            ..NarrationConfig::default()
        };
        assert_eq!(narration.cache_file(), PathBuf::from("/tmp/spotlight/cache.json"));
    }
}
