//! Configuration management for eddy.
//!
//! Configuration is read from `~/.config/eddy/config.toml` at startup.
//! If the file doesn't exist, a default configuration with comments is
//! created. Missing fields fall back to their defaults.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::poller::PollPolicy;

/// Main configuration struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the board API.
    pub api_base_url: String,
    /// Base URL of the media origin.
    pub media_base_url: String,
    /// Media cache directory; defaults to the platform cache dir.
    pub cache_dir: Option<PathBuf>,
    /// Starting (and floor) per-thread poll interval, seconds.
    pub min_poll_secs: u64,
    /// Ceiling a quiet thread's poll interval may grow to, seconds.
    pub max_poll_secs: u64,
    /// Largest random increment added after a quiet poll, seconds.
    pub poll_backoff_secs: u64,
    /// Period between automatic catalog refreshes, seconds.
    pub catalog_poll_secs: u64,
    /// Reusable connections in the media fetcher's pool.
    pub media_connections: usize,
    /// Period between cache snapshot flushes, seconds.
    pub flush_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://a.4cdn.org".into(),
            media_base_url: "https://i.4cdn.org".into(),
            cache_dir: None,
            min_poll_secs: 10,
            max_poll_secs: 300,
            poll_backoff_secs: 13,
            catalog_poll_secs: 30,
            media_connections: 3,
            flush_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, creates a default one with comments.
    /// If the config file exists but is invalid, returns an error.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).map_err(|e| ConfigError::Io {
            path: config_path.clone(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: config_path,
            source: e,
        })?;

        Ok(config)
    }

    /// Get the default config file path: `~/.config/eddy/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("eddy").join("config.toml"))
    }

    /// Media cache directory, configured or platform default.
    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let cache_dir = dirs::cache_dir().ok_or(ConfigError::NoConfigDir)?;
                Ok(cache_dir.join("eddy").join("media"))
            }
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            min_interval: Duration::from_secs(self.min_poll_secs),
            max_interval: Duration::from_secs(self.max_poll_secs),
            backoff_step: Duration::from_secs(self.poll_backoff_secs),
            catalog_period: Duration::from_secs(self.catalog_poll_secs),
        }
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_secs)
    }

    /// Create a default config file with comments.
    fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let default_config = Self::default_config_content();

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;

        file.write_all(default_config.as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.clone(),
                source: e,
            })?;

        Ok(())
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# eddy configuration
#
# Endpoints. The API serves thread and catalog JSON; the media origin
# serves thumbnails and full images.
api_base_url = "https://a.4cdn.org"
media_base_url = "https://i.4cdn.org"

# Where fetched media and the cache index live.
# Defaults to the platform cache directory when unset.
#cache_dir = "/path/to/cache"

# Per-thread polling. A thread starts at min_poll_secs; every quiet poll
# grows its interval by a random amount up to poll_backoff_secs, capped at
# max_poll_secs; any new post snaps it back to the minimum.
min_poll_secs = 10
max_poll_secs = 300
poll_backoff_secs = 13

# Period between automatic catalog refreshes.
catalog_poll_secs = 30

# Reusable connections in the media fetcher's pool.
media_connections = 3

# Period between cache index flushes to disk.
flush_secs = 300
"##
        .to_string()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
