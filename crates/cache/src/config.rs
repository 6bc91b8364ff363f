//! Cache configuration: memory limit, eviction cadence and fetcher pool size.
//!
//! Configuration can be loaded from a file, environment variables, or
//! created programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const MB: usize = 1024 * 1024;

/// Configuration for the cache system.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Global cache size limit in bytes, shared by every registered store
    pub max_cache_size: usize,
    /// Period of the background eviction pass
    pub eviction_interval: Duration,
    /// Number of fetcher threads loading cells in the background
    pub num_fetcher_threads: usize,
    /// Number of load queue priority levels
    pub num_priorities: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 1024 * MB, // 1 GB
            eviction_interval: Duration::from_secs(3),
            num_fetcher_threads: default_fetcher_threads(),
            num_priorities: 4,
        }
    }
}

impl CacheConfig {
    /// Sets the cache size limit in megabytes, saturating at `usize::MAX` bytes.
    pub fn with_max_cache_mb(mut self, mb: usize) -> Self {
        self.max_cache_size = mb.saturating_mul(MB);
        self
    }

    /// Sets the period of the background eviction pass.
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Sets the number of fetcher threads.
    pub fn with_fetcher_threads(mut self, threads: usize) -> Self {
        self.num_fetcher_threads = threads;
        self
    }

    /// Sets the number of load queue priority levels.
    pub fn with_priorities(mut self, priorities: usize) -> Self {
        self.num_priorities = priorities;
        self
    }

    /// Returns the cache size limit in megabytes.
    pub fn max_cache_mb(&self) -> usize {
        self.max_cache_size / MB
    }

    /// Returns the default configuration file location for the current
    /// platform.
    ///
    /// - macOS: ~/Library/Application Support/volcache/cache.toml
    /// - Linux: ~/.config/volcache/cache.toml
    /// - Windows: %APPDATA%\volcache\cache.toml
    pub fn default_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("volcache").join("cache.toml")
        } else {
            PathBuf::from("volcache-cache.toml")
        }
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    /// Returns an error naming the first zero-valued setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::InvalidValue("max_cache_mb".to_string()));
        }
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::InvalidValue("eviction_interval_ms".to_string()));
        }
        if self.num_fetcher_threads == 0 {
            return Err(ConfigError::InvalidValue("fetcher_threads".to_string()));
        }
        if self.num_priorities == 0 {
            return Err(ConfigError::InvalidValue("num_priorities".to_string()));
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `VOLCACHE_MAX_CACHE_MB`: cache size limit in MB (default: 1024)
    /// - `VOLCACHE_EVICTION_INTERVAL_MS`: eviction period in ms (default: 3000)
    /// - `VOLCACHE_FETCHER_THREADS`: fetcher threads (default: CPU count - 1)
    /// - `VOLCACHE_NUM_PRIORITIES`: load queue levels (default: 4)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VOLCACHE_MAX_CACHE_MB") {
            config.max_cache_size = parse_mb("VOLCACHE_MAX_CACHE_MB", &val)?;
        }

        if let Ok(val) = std::env::var("VOLCACHE_EVICTION_INTERVAL_MS") {
            let millis = parse_value("VOLCACHE_EVICTION_INTERVAL_MS", &val)?;
            config.eviction_interval = Duration::from_millis(millis);
        }

        if let Ok(val) = std::env::var("VOLCACHE_FETCHER_THREADS") {
            config.num_fetcher_threads = parse_value("VOLCACHE_FETCHER_THREADS", &val)?;
        }

        if let Ok(val) = std::env::var("VOLCACHE_NUM_PRIORITIES") {
            config.num_priorities = parse_value("VOLCACHE_NUM_PRIORITIES", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// max_cache_mb = 1024
    /// eviction_interval_ms = 3000
    /// fetcher_threads = 7
    /// num_priorities = 4
    /// ```
    ///
    /// `max_cache_bytes` and `eviction_interval_ns` give exact values and
    /// take precedence over `max_cache_mb` and `eviction_interval_ms`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(ConfigError::IoError)?;

        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut exact_size = None;
        let mut exact_interval = None;

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');

                match key {
                    "max_cache_mb" => {
                        config.max_cache_size = parse_mb(key, value)?;
                    }
                    "max_cache_bytes" => {
                        exact_size = Some(parse_value(key, value)?);
                    }
                    "eviction_interval_ms" => {
                        config.eviction_interval = Duration::from_millis(parse_value(key, value)?);
                    }
                    "eviction_interval_ns" => {
                        exact_interval = Some(Duration::from_nanos(parse_value(key, value)?));
                    }
                    "fetcher_threads" => {
                        config.num_fetcher_threads = parse_value(key, value)?;
                    }
                    "num_priorities" => {
                        config.num_priorities = parse_value(key, value)?;
                    }
                    _ => {} // Ignore unknown keys
                }
            }
        }

        if let Some(bytes) = exact_size {
            config.max_cache_size = bytes;
        }
        if let Some(interval) = exact_interval {
            config.eviction_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// Sizes and intervals that are not whole megabytes or milliseconds are
    /// written as exact `max_cache_bytes` and `eviction_interval_ns` keys.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the interval does
    /// not fit in 64-bit nanoseconds, or the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.validate()?;
        let toml = self.to_toml()?;
        fs::write(path.as_ref(), toml).map_err(ConfigError::IoError)
    }

    /// Converts configuration to TOML format.
    fn to_toml(&self) -> Result<String, ConfigError> {
        let size = if self.max_cache_size % MB == 0 {
            format!("max_cache_mb = {}", self.max_cache_mb())
        } else {
            format!("max_cache_bytes = {}", self.max_cache_size)
        };

        let millis = self.eviction_interval.as_millis();
        let interval = if self.eviction_interval.subsec_nanos() % 1_000_000 == 0
            && u64::try_from(millis).is_ok()
        {
            format!("eviction_interval_ms = {millis}")
        } else {
            let nanos = u64::try_from(self.eviction_interval.as_nanos())
                .map_err(|_| ConfigError::InvalidValue("eviction_interval_ns".to_string()))?;
            format!("eviction_interval_ns = {nanos}")
        };

        Ok(format!(
            "# Volcache Configuration\n\
             {size}\n\
             {interval}\n\
             fetcher_threads = {}\n\
             num_priorities = {}\n",
            self.num_fetcher_threads, self.num_priorities,
        ))
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

/// Parse a megabyte count into bytes, rejecting sizes that overflow
fn parse_mb(key: &str, value: &str) -> Result<usize, ConfigError> {
    parse_value::<usize>(key, value)?
        .checked_mul(MB)
        .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))
}

/// One thread fewer than the CPU count, keeping a core for rendering.
fn default_fetcher_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    IoError(io::Error),
}
