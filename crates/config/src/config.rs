//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Glob patterns matched when no include pattern is configured.
pub const DEFAULT_INCLUDE_PATTERNS: &[&str] = &["*.mp4", "*.mpg", "*.mov", "*.mkv", "*.avi"];

/// Name of the directory created under `queue_dir` that holds the database.
pub const STORE_DIR_NAME: &str = ".autotranscode";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Location of the shared queue database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Directory under which the queue store lives (defaults to `$HOME`)
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
}

fn default_queue_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
        }
    }
}

impl QueueConfig {
    /// Directory holding the database file.
    pub fn store_dir(&self) -> PathBuf {
        self.queue_dir.join(STORE_DIR_NAME)
    }

    /// Full path of the SQLite database shared by every node.
    pub fn database_path(&self) -> PathBuf {
        self.store_dir().join("queue.db")
    }
}

/// Directory watching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Directories watched recursively for new media files
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    /// Glob patterns a file must match to be queued
    #[serde(default = "default_include_patterns")]
    pub include_patterns: Vec<String>,
    /// Glob patterns that exclude an otherwise included file
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Whether pattern matching is case sensitive (default true)
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    /// Queue every existing matching file on startup
    #[serde(default)]
    pub initial_scan: bool,
    /// Requeue files that already have a job
    #[serde(default)]
    pub reprocess: bool,
}

fn default_include_patterns() -> Vec<String> {
    DEFAULT_INCLUDE_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            include_patterns: default_include_patterns(),
            exclude_patterns: Vec::new(),
            case_sensitive: true,
            initial_scan: false,
            reprocess: false,
        }
    }
}

/// Transcoding command configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConfig {
    /// Shell command run for each file; receives `INPUT_FILE` and `OUTPUT_FILE`
    #[serde(default)]
    pub command: String,
    /// Wall-clock limit for one run, in hours (default 15)
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: f64,
    /// Extension of the transcoded file (default mp4)
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    /// Remove the source file after a successful run
    #[serde(default)]
    pub delete_source: bool,
    /// Seconds to sleep when no job is waiting (default 10)
    #[serde(default = "default_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds between node-state checks while a run is active (default 10)
    #[serde(default = "default_interval_secs")]
    pub monitor_interval_secs: u64,
}

fn default_timeout_hours() -> f64 {
    15.0
}

fn default_output_extension() -> String {
    "mp4".to_string()
}

fn default_interval_secs() -> u64 {
    10
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_hours: default_timeout_hours(),
            output_extension: default_output_extension(),
            delete_source: false,
            poll_interval_secs: default_interval_secs(),
            monitor_interval_secs: default_interval_secs(),
        }
    }
}

impl ProcessingConfig {
    /// Timeout as a duration; negative or non-finite values become zero.
    pub fn timeout(&self) -> Duration {
        if self.timeout_hours.is_finite() && self.timeout_hours > 0.0 {
            Duration::from_secs_f64(self.timeout_hours * 3600.0)
        } else {
            Duration::ZERO
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Serve the control API (default true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listen address (default 127.0.0.1:7878)
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset (default "info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - AUTOTRANSCODE_QUEUE_DIR -> queue.queue_dir
    /// - AUTOTRANSCODE_WATCH_DIRS -> watch.directories (PATH-style list)
    /// - AUTOTRANSCODE_COMMAND -> processing.command
    /// - AUTOTRANSCODE_TIMEOUT_HOURS -> processing.timeout_hours
    /// - AUTOTRANSCODE_OUTPUT_EXTENSION -> processing.output_extension
    /// - AUTOTRANSCODE_DELETE_SOURCE -> processing.delete_source
    /// - AUTOTRANSCODE_POLL_INTERVAL_SECS -> processing.poll_interval_secs
    /// - AUTOTRANSCODE_BIND -> server.bind
    /// - AUTOTRANSCODE_LOG_LEVEL -> logging.level
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = env::var_os("AUTOTRANSCODE_QUEUE_DIR") {
            if !val.is_empty() {
                self.queue.queue_dir = PathBuf::from(val);
            }
        }

        if let Some(val) = env::var_os("AUTOTRANSCODE_WATCH_DIRS") {
            let dirs: Vec<PathBuf> = env::split_paths(&val)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !dirs.is_empty() {
                self.watch.directories = dirs;
            }
        }

        if let Ok(val) = env::var("AUTOTRANSCODE_COMMAND") {
            self.processing.command = val;
        }

        if let Ok(val) = env::var("AUTOTRANSCODE_TIMEOUT_HOURS") {
            if let Ok(hours) = val.parse::<f64>() {
                self.processing.timeout_hours = hours;
            }
        }

        if let Ok(val) = env::var("AUTOTRANSCODE_OUTPUT_EXTENSION") {
            if !val.is_empty() {
                self.processing.output_extension = val;
            }
        }

        if let Ok(val) = env::var("AUTOTRANSCODE_DELETE_SOURCE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.processing.delete_source = true,
                "false" | "0" | "no" => self.processing.delete_source = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("AUTOTRANSCODE_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.processing.poll_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("AUTOTRANSCODE_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("AUTOTRANSCODE_LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
