//! Runtime Configuration
//!
//! Settings for vector memory, the offline cache tiers, the callback
//! scheduler and logging. Configuration can be built programmatically, read
//! from JSON, or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `FORA_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FORA_VDMM_MAX_BYTES` | Vector memory budget in bytes (0 = unlimited) | 0 |
//! | `FORA_POOL_ALIGNMENT` | Pool allocation granularity (power of two) | 16 |
//! | `FORA_RAM_CACHE_MAX_BYTES` | In-memory offline cache budget | 268435456 (256MB) |
//! | `FORA_DISK_CACHE_PATH` | Disk cache directory | unset |
//! | `FORA_DISK_CACHE_MAX_BYTES` | Disk cache byte budget | 4294967296 (4GB) |
//! | `FORA_DISK_CACHE_MAX_ITEMS` | Disk cache item budget | 100000 |
//! | `FORA_CALLBACK_THREADS` | Callback scheduler worker threads | 1 |
//! | `FORA_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use fora_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env();
//!
//! let config = RuntimeConfig::builder()
//!     .vdmm_max_bytes(512 * 1024 * 1024)
//!     .ram_cache_max_bytes(64 * 1024 * 1024)
//!     .build()?;
//! ```

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verbosity of the runtime's `tracing` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Silent.
    Off,
    /// `error!` only.
    Error,
    /// `warn!` and above.
    Warn,
    /// `info!` and above.
    #[default]
    Info,
    /// `debug!` and above.
    Debug,
    /// Everything, including per-page tracing.
    Trace,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Case-insensitive lookup by directive name. `warning` is accepted for `warn`.
    pub fn parse(s: &str) -> Option<Self> {
        let name = s.trim();
        if name.eq_ignore_ascii_case("warning") {
            return Some(LogLevel::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(name))
    }

    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Vector memory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Byte budget shared by all pages of one manager.
    /// 0 means unlimited (default).
    pub vdmm_max_bytes: usize,

    /// Allocation granularity in bytes.
    /// Default: 16.
    pub pool_alignment: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            vdmm_max_bytes: 0,
            pool_alignment: 16,
        }
    }
}

/// Offline cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget of the in-memory tier.
    /// Default: 256MB.
    pub ram_max_bytes: u64,

    /// Directory of the disk tier. `None` disables it.
    pub disk_path: Option<PathBuf>,

    /// Byte budget of the disk tier.
    /// Default: 4GB.
    pub disk_max_bytes: u64,

    /// Item budget of the disk tier.
    /// Default: 100000.
    pub disk_max_items: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ram_max_bytes: 256 * 1024 * 1024,       // 256 MB
            disk_path: None,
            disk_max_bytes: 4 * 1024 * 1024 * 1024, // 4 GB
            disk_max_items: 100_000,
        }
    }
}

/// Callback scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads delivering callbacks.
    /// Default: 1, which keeps delivery in submission order.
    pub callback_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { callback_threads: 1 }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is not set.
    pub level: LogLevel,

    /// Include thread names in log lines.
    pub thread_names: bool,
}

/// Everything [`crate::init_with_runtime_config`] needs to assemble a
/// [`crate::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Vector memory configuration.
    pub memory: MemoryConfig,

    /// Offline cache configuration.
    pub cache: CacheConfig,

    /// Callback scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Start from defaults and override selectively.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Read the `FORA_*` variables listed in the module docs.
    ///
    /// Unset, unparsable or out-of-range values leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env::<usize>("FORA_VDMM_MAX_BYTES") {
            config.memory.vdmm_max_bytes = val;
        }

        if let Some(val) = parse_env::<usize>("FORA_POOL_ALIGNMENT") {
            if val.is_power_of_two() {
                config.memory.pool_alignment = val;
            }
        }

        if let Some(val) = parse_env::<u64>("FORA_RAM_CACHE_MAX_BYTES") {
            if val > 0 {
                config.cache.ram_max_bytes = val;
            }
        }

        if let Ok(val) = env::var("FORA_DISK_CACHE_PATH") {
            if !val.is_empty() {
                config.cache.disk_path = Some(PathBuf::from(val));
            }
        }

        if let Some(val) = parse_env::<u64>("FORA_DISK_CACHE_MAX_BYTES") {
            if val > 0 {
                config.cache.disk_max_bytes = val;
            }
        }

        if let Some(val) = parse_env::<u64>("FORA_DISK_CACHE_MAX_ITEMS") {
            if val > 0 {
                config.cache.disk_max_items = val;
            }
        }

        if let Some(val) = parse_env::<usize>("FORA_CALLBACK_THREADS") {
            if val > 0 {
                config.scheduler.callback_threads = val;
            }
        }

        if let Ok(val) = env::var("FORA_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, reporting the first offender.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.memory.pool_alignment.is_power_of_two() {
            return Err(ConfigError::invalid(
                "memory.pool_alignment",
                format!("{} is not a power of two", self.memory.pool_alignment),
            ));
        }

        let budgets = [
            ("cache.ram_max_bytes", self.cache.ram_max_bytes),
            ("cache.disk_max_bytes", self.cache.disk_max_bytes),
            ("cache.disk_max_items", self.cache.disk_max_items),
            ("scheduler.callback_threads", self.scheduler.callback_threads as u64),
        ];
        match budgets.into_iter().find(|&(_, v)| v == 0) {
            Some((field, _)) => Err(ConfigError::invalid(field, "zero is not a usable budget")),
            None => Ok(()),
        }
    }
}

/// Rejected configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value the runtime cannot work with.
    #[error("{field}: {message}")]
    InvalidValue {
        /// Dotted path of the field, e.g. `cache.ram_max_bytes`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The JSON document did not parse.
    #[error("config json: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_owned(),
            message: message.into(),
        }
    }
}

/// Fluent setters over a [`RuntimeConfig`], checked once in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Same as [`RuntimeConfig::builder`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the vector memory budget (0 = unlimited).
    pub fn vdmm_max_bytes(mut self, bytes: usize) -> Self {
        self.config.memory.vdmm_max_bytes = bytes;
        self
    }

    /// Set the pool alignment.
    pub fn pool_alignment(mut self, alignment: usize) -> Self {
        self.config.memory.pool_alignment = alignment;
        self
    }

    /// Set the in-memory cache budget.
    pub fn ram_cache_max_bytes(mut self, bytes: u64) -> Self {
        self.config.cache.ram_max_bytes = bytes;
        self
    }

    /// Enable the disk cache at `path`.
    pub fn disk_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache.disk_path = Some(path.into());
        self
    }

    /// Set the disk cache byte budget.
    pub fn disk_cache_max_bytes(mut self, bytes: u64) -> Self {
        self.config.cache.disk_max_bytes = bytes;
        self
    }

    /// Set the disk cache item budget.
    pub fn disk_cache_max_items(mut self, items: u64) -> Self {
        self.config.cache.disk_max_items = items;
        self
    }

    /// Set the callback worker count.
    pub fn callback_threads(mut self, n: usize) -> Self {
        self.config.scheduler.callback_threads = n;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Finish, running [`RuntimeConfig::validate`].
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Finish without checking. Used by tests that need a bad config.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
