use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Limits and housekeeping for the on-disk audio cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached files. 0 = unlimited.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Maximum total size of cached files in bytes. 0 = unlimited.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    /// Directory holding the audio files and `cache_index.json`.
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_max_concurrent_metadata")]
    pub max_concurrent_metadata: usize,
    /// Consecutive failures before a URL is parked for the backoff window.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff_minutes")]
    pub retry_backoff_minutes: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// How long the driver waits for a dequeued entry's file.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Safety ceiling for a single track.
    #[serde(default = "default_max_track_secs")]
    pub max_track_secs: u64,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_size_bytes: default_max_size_bytes(),
            directory: default_cache_directory(),
            auto_cleanup: default_true(),
            cleanup_interval_minutes: default_cleanup_interval_minutes(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_metadata: default_max_concurrent_metadata(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_minutes: default_retry_backoff_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            max_track_secs: default_max_track_secs(),
            default_volume: default_volume(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }
}

impl FetchConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PlaybackConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn max_track_duration(&self) -> Duration {
        Duration::from_secs(self.max_track_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_files() -> usize {
    100
}

fn default_max_size_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_cache_directory() -> PathBuf {
    platform::cache_dir().join("audio")
}

fn default_cleanup_interval_minutes() -> u64 {
    60
}

fn default_max_concurrent_downloads() -> usize {
    3
}

fn default_max_concurrent_metadata() -> usize {
    5
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_minutes() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_ready_timeout_secs() -> u64 {
    120
}

fn default_max_track_secs() -> u64 {
    600
}

fn default_volume() -> f32 {
    0.5
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Rejects values that would stall the background tasks.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_concurrent_downloads == 0 {
            return Err(Error::Config("fetch.max_concurrent_downloads must be > 0".into()));
        }
        if self.fetch.max_concurrent_metadata == 0 {
            return Err(Error::Config("fetch.max_concurrent_metadata must be > 0".into()));
        }
        if self.fetch.poll_interval_ms == 0 {
            return Err(Error::Config("fetch.poll_interval_ms must be > 0".into()));
        }
        if self.cache.auto_cleanup && self.cache.cleanup_interval_minutes == 0 {
            return Err(Error::Config(
                "cache.cleanup_interval_minutes must be > 0 when auto_cleanup is on".into(),
            ));
        }
        if self.playback.ready_timeout_secs == 0 || self.playback.max_track_secs == 0 {
            return Err(Error::Config("playback timeouts must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.max_files, 100);
        assert_eq!(config.cache.max_size_bytes, 1 << 30);
        assert!(config.cache.auto_cleanup);
        assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(3600));
        assert_eq!(config.fetch.max_concurrent_downloads, 3);
        assert_eq!(config.fetch.max_concurrent_metadata, 5);
        assert_eq!(config.fetch.retry_max_attempts, 3);
        assert_eq!(config.fetch.retry_backoff(), Duration::from_secs(300));
        assert_eq!(config.playback.ready_timeout(), Duration::from_secs(120));
        assert_eq!(config.playback.max_track_duration(), Duration::from_secs(600));
        assert!(config.cache.directory.ends_with("jukebox/audio"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            max_files = 0
            directory = "/srv/jukebox"

            [fetch]
            max_concurrent_downloads = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.max_files, 0);
        assert_eq!(config.cache.directory, PathBuf::from("/srv/jukebox"));
        assert_eq!(config.cache.max_size_bytes, 1 << 30);
        assert_eq!(config.fetch.max_concurrent_downloads, 1);
        assert_eq!(config.fetch.max_concurrent_metadata, 5);
        assert_eq!(config.daemon.port, platform::DAEMON_TCP_PORT);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Config::from_toml_str("[fetch]\nmax_concurrent_metadata = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_toml_round_trip_keeps_limits() {
        let mut config = Config::default();
        config.cache.max_size_bytes = 42;
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.cache.max_size_bytes, 42);
    }
}
