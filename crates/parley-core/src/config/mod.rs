//! Configuration management for Parley.
//!
//! This module handles loading, saving, and validating the transfer engine
//! configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/parley/config.toml` |
//! | macOS | `~/Library/Application Support/Parley/config.toml` |
//! | Windows | `%APPDATA%\Parley\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use parley_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Admission cap: {}", config.transfer.max_concurrent_downloads);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for Parley.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer scheduling settings
    pub transfer: TransferConfig,
    /// Receiver-side flow control settings
    pub flow: FlowConfig,
    /// Speed and ETA display settings
    pub telemetry: TelemetryConfig,
    /// History settings
    pub history: HistoryConfig,
    /// Download storage settings
    pub storage: StorageConfig,
}

/// Transfer scheduling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes read from the content source per chunk
    pub chunk_size: usize,
    /// Maximum downloads active at once, across all peers
    pub max_concurrent_downloads: usize,
    /// Maximum downloads waiting for admission (None for unbounded)
    pub max_queued_downloads: Option<usize>,
    /// Maximum upload sessions pumping at once
    pub max_running_sessions: usize,
    /// Read-ahead cache budget per upload session
    pub session_cache_bytes: u64,
    /// Channel buffered amount above which the uploader stops sending
    pub channel_high_water: u64,
    /// Upload session idle timeout
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Accept incoming requests for known attachments without asking
    pub auto_accept: bool,
    /// Maximum bytes handed to the storage sink in one write
    pub drain_batch_bytes: usize,
    /// Writes performed per drain step
    pub drain_batches_per_step: usize,
    /// Scheduler tick interval
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_concurrent_downloads: crate::DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_queued_downloads: None,
            max_running_sessions: crate::DEFAULT_MAX_RUNNING_SESSIONS,
            session_cache_bytes: 8 * 1024 * 1024,
            channel_high_water: 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
            auto_accept: true,
            drain_batch_bytes: 256 * 1024,
            drain_batches_per_step: 4,
            tick_interval: Duration::from_millis(50),
        }
    }
}

/// Receiver-driven flow control options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Pending bytes above which a pause is sent upstream
    pub pause_threshold: u64,
    /// Pending bytes below which a resume is sent upstream
    pub resume_threshold: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pause_threshold: 8 * 1024 * 1024,
            resume_threshold: 2 * 1024 * 1024,
        }
    }
}

/// Speed and ETA estimation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// EMA smoothing factor for downloads (lower reacts slower)
    pub download_smoothing: f64,
    /// EMA smoothing factor for uploads
    pub upload_smoothing: f64,
    /// Minimum interval between displayed updates
    #[serde(with = "humantime_serde")]
    pub min_update_interval: Duration,
    /// Maximum ratio a displayed ETA may grow by in one update
    pub eta_increase_cap: f64,
    /// ETA increases below this fraction of the previous value are ignored
    pub eta_suppress_ratio: f64,
    /// ETA increases below this many seconds are ignored
    pub eta_suppress_secs: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            download_smoothing: 0.15,
            upload_smoothing: 0.35,
            min_update_interval: Duration::from_millis(500),
            eta_increase_cap: 1.25,
            eta_suppress_ratio: 0.10,
            eta_suppress_secs: 2.0,
        }
    }
}

/// History configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Enable transfer history
    pub enabled: bool,
    /// Maximum history entries
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 200,
        }
    }
}

/// Download storage options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory downloads are saved to (None for the platform default)
    pub download_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the directory downloads are saved to.
    #[must_use]
    pub fn resolved_download_dir(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return dir.clone();
        }
        directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("downloads"))
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized or written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check that values are consistent with each other.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: &str| -> Result<()> {
            Err(Error::InvalidConfig {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.transfer.chunk_size == 0 {
            return invalid("transfer.chunk_size", "must be greater than zero");
        }
        if self.transfer.max_concurrent_downloads == 0 {
            return invalid(
                "transfer.max_concurrent_downloads",
                "must be greater than zero",
            );
        }
        if self.transfer.max_running_sessions == 0 {
            return invalid("transfer.max_running_sessions", "must be greater than zero");
        }
        if self.transfer.session_cache_bytes < self.transfer.chunk_size as u64 {
            return invalid(
                "transfer.session_cache_bytes",
                "must hold at least one chunk",
            );
        }
        if self.transfer.drain_batch_bytes == 0 || self.transfer.drain_batches_per_step == 0 {
            return invalid("transfer.drain_batch_bytes", "drain must write something");
        }
        if self.flow.resume_threshold >= self.flow.pause_threshold {
            return invalid(
                "flow.resume_threshold",
                "must be lower than flow.pause_threshold",
            );
        }
        for (key, value) in [
            ("telemetry.download_smoothing", self.telemetry.download_smoothing),
            ("telemetry.upload_smoothing", self.telemetry.upload_smoothing),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(key, "must be in (0, 1]");
            }
        }
        if self.telemetry.eta_increase_cap < 1.0 {
            return invalid("telemetry.eta_increase_cap", "must be at least 1.0");
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "parley", "Parley")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Some(millis) = s.strip_suffix("ms") {
            return millis
                .parse()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom);
        }
        s.strip_suffix('s')
            .map(|secs| {
                secs.parse()
                    .map(Duration::from_secs)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.transfer.chunk_size, crate::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.transfer.max_running_sessions, 2);
        assert!(config.transfer.max_queued_downloads.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config").join("config.toml");

        let mut original = Config::default();
        original.transfer.max_concurrent_downloads = 5;
        original.transfer.idle_timeout = Duration::from_secs(90);
        original.storage.download_dir = Some(PathBuf::from("/tmp/parley"));
        original.save_to(&config_path).unwrap();

        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded.transfer.max_concurrent_downloads, 5);
        assert_eq!(loaded.transfer.idle_timeout, Duration::from_secs(90));
        assert_eq!(loaded.transfer.tick_interval, Duration::from_millis(50));
        assert_eq!(
            loaded.storage.download_dir,
            Some(PathBuf::from("/tmp/parley"))
        );
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[transfer]
max_concurrent_downloads = 1
idle_timeout = "2m"

[telemetry]
min_update_interval = "250ms"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.transfer.max_concurrent_downloads, 1);
        assert_eq!(config.transfer.idle_timeout, Duration::from_secs(120));
        assert_eq!(
            config.telemetry.min_update_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.flow.pause_threshold, FlowConfig::default().pause_threshold);
    }

    #[test]
    fn test_config_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.history.max_entries, 200);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.flow.resume_threshold = config.flow.pause_threshold;

        match config.validate() {
            Err(Error::InvalidConfig { key, .. }) => assert_eq!(key, "flow.resume_threshold"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_tiny_cache() {
        let mut config = Config::default();
        config.transfer.session_cache_bytes = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_humantime_duration_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");

        assert!(toml_str.contains("idle_timeout = \"30s\""));
        assert!(toml_str.contains("min_update_interval = \"500ms\""));
    }
}
