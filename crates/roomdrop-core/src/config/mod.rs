//! Configuration management for Roomdrop.
//!
//! This module handles loading, saving, and validating Roomdrop
//! configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/roomdrop/config.toml` |
//! | macOS | `~/Library/Application Support/com.roomdrop.Roomdrop/config.toml` |
//! | Windows | `%APPDATA%\roomdrop\Roomdrop\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use roomdrop_core::config::Config;
//!
//! let config = Config::load()?;
//! config.validate()?;
//! let transfer = config.transfer_config();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::ChunkFraming;
use crate::transfer::{FlowStrategy, TransferConfig};

/// Main configuration struct for Roomdrop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rendezvous server settings
    pub server: ServerSettings,
    /// Chunking and pipelining settings
    pub transfer: TransferSettings,
    /// Flow control settings
    pub flow: FlowSettings,
}

/// Rendezvous server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address `roomdrop serve` listens on
    pub bind: String,
    /// Address clients connect to
    pub url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", crate::DEFAULT_SERVER_PORT),
            url: format!("127.0.0.1:{}", crate::DEFAULT_SERVER_PORT),
        }
    }
}

/// Chunking and pipelining settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Binary chunk framing
    pub framing: ChunkFraming,
    /// Files a sender may keep open at once on one channel
    pub max_inflight_files: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            framing: ChunkFraming::Untagged,
            max_inflight_files: 1,
        }
    }
}

/// Flow control strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStrategyKind {
    /// Gate on the channel's buffered amount
    #[default]
    Threshold,
    /// Gate on receiver acknowledgments
    Windowed,
}

/// Flow control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Which strategy paces chunk emission
    pub strategy: FlowStrategyKind,
    /// Buffered bytes above which the sender suspends
    pub high_water: u64,
    /// Buffered bytes at which a suspended sender resumes
    pub low_water: u64,
    /// Unacknowledged chunks allowed in flight
    pub window: u64,
    /// Chunks a receiver consumes between acks
    pub ack_batch: u64,
    /// How long a sender waits on flow control before giving up on a
    /// destination. Unset means wait until cancelled.
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            strategy: FlowStrategyKind::Threshold,
            high_water: crate::DEFAULT_HIGH_WATER,
            low_water: crate::DEFAULT_LOW_WATER,
            window: crate::DEFAULT_WINDOW,
            ack_batch: crate::DEFAULT_ACK_BATCH,
            timeout: None,
        }
    }
}

impl FlowSettings {
    /// The strategy these settings select, with its parameters.
    #[must_use]
    pub fn strategy(&self) -> FlowStrategy {
        match self.strategy {
            FlowStrategyKind::Threshold => FlowStrategy::Threshold {
                high_water: self.high_water,
                low_water: self.low_water,
            },
            FlowStrategyKind::Windowed => FlowStrategy::Windowed {
                window: self.window,
                ack_batch: self.ack_batch,
            },
        }
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
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = self.to_toml()?;

        std::fs::write(&path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Render the configuration as pretty-printed TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "roomdrop", "Roomdrop")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Runtime transfer settings derived from this configuration.
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            framing: self.transfer.framing,
            max_inflight_files: self.transfer.max_inflight_files,
            flow: self.flow.strategy(),
            flow_timeout: self.flow.timeout,
        }
    }

    /// Check the configuration for values that cannot work together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            return Err(Error::InvalidConfig {
                key: "server.bind".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.server.url.trim().is_empty() {
            return Err(Error::InvalidConfig {
                key: "server.url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        // Checked for either strategy; `--windowed` switches at runtime.
        if self.flow.window == 0 {
            return Err(Error::InvalidConfig {
                key: "flow.window".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.flow.ack_batch == 0 || self.flow.ack_batch > self.flow.window {
            return Err(Error::InvalidConfig {
                key: "flow.ack_batch".to_string(),
                reason: format!("must be between 1 and the window ({})", self.flow.window),
            });
        }

        self.transfer_config().validate()
    }
}

impl From<&Config> for TransferConfig {
    fn from(config: &Config) -> Self {
        config.transfer_config()
    }
}

/// Parse a duration such as `250ms`, `30s`, `5m` or `1h`.
///
/// Returns `None` for anything else, including values too large to
/// represent.
#[must_use]
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, millis_per_unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        return None;
    };

    let number: u64 = number.parse().ok()?;
    number.checked_mul(millis_per_unit).map(Duration::from_millis)
}

/// Render a duration in the form [`parse_duration`] reads back.
///
/// Whole seconds render as `"<n>s"`; anything finer as milliseconds,
/// rounded up so a non-zero duration never renders as zero.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        return format!("{}s", duration.as_secs());
    }
    let mut millis = duration.as_millis();
    if duration.subsec_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    format!("{millis}ms")
}

mod humantime_serde {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    fn parse(s: &str) -> Result<Duration, String> {
        super::parse_duration(s).ok_or_else(|| {
            format!("invalid duration '{s}', expected e.g. 250ms, 30s, 2m or 1h")
        })
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
