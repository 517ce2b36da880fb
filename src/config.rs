//! Configuration management for Windmill.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WindmillError};
use crate::ratelimit::SlidingWindow;

/// Prefix for environment variable overrides, e.g.
/// `WINDMILL__LIMITER__MAX_EVENTS=50`.
const ENV_PREFIX: &str = "WINDMILL";

/// Main configuration for Windmill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindmillConfig {
    /// Limiter parameters shared by every key
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Sliding window parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Events allowed per window
    #[serde(default = "default_max_events")]
    pub max_events: u64,

    /// Window length in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Number of segments the window is split into
    #[serde(default = "default_segments")]
    pub segments: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            interval_ms: default_interval_ms(),
            segments: default_segments(),
        }
    }
}

fn default_max_events() -> u64 {
    100
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_segments() -> usize {
    10
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How often recovered limiters are evicted, in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

impl WindmillConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WindmillError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file, then apply `WINDMILL__*`
    /// environment variables on top.
    ///
    /// The file format follows its extension (YAML, JSON or TOML).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: WindmillConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WindmillError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration describes a usable limiter and store.
    pub fn validate(&self) -> Result<()> {
        self.sliding_window()?;
        if self.store.cleanup_interval_ms == 0 {
            return Err(WindmillError::Config(
                "store.cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Window length.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.limiter.interval_ms)
    }

    /// Cleanup period of the store.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.store.cleanup_interval_ms)
    }

    /// Build the sliding window algorithm described by this configuration.
    pub fn sliding_window(&self) -> Result<SlidingWindow> {
        SlidingWindow::new(self.limiter.max_events, self.interval(), self.limiter.segments)
    }
}
