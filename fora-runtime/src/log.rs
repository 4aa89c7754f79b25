//! Logging Infrastructure
//!
//! The runtime logs through `tracing`. This module installs a
//! `tracing_subscriber` formatter for processes that embed the runtime and
//! have not installed a subscriber of their own.
//!
//! `RUST_LOG` takes precedence over the configured level.
//!
//! # Example
//!
//! ```rust,ignore
//! use fora_runtime::{config::RuntimeConfig, log};
//!
//! let config = RuntimeConfig::from_env();
//! log::init(&config.log);
//! tracing::info!("runtime started");
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Build the filter for `config`, honouring `RUST_LOG` when set.
pub fn filter_for(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install a global fmt subscriber.
///
/// Returns `false` if a subscriber was already installed; the existing one
/// stays in place.
pub fn init(config: &LogConfig) -> bool {
    if config.level == LogLevel::Off {
        return false;
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(config))
        .with_thread_names(config.thread_names)
        .try_init()
        .is_ok()
}

/// Install a subscriber that writes through the test harness capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(LogLevel::Debug.as_str()))
        .with_test_writer()
        .try_init();
}
