//! # Enclave Log
//!
//! Logging setup shared by the host runtime and the isolated worker process.
//!
//! ```no_run
//! let _guard = enclave_log::auto_init().expect("logger");
//! tracing::info!(worker_id = "w1", "binding worker");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Format, WriterConfig};
pub use error::{LogError, LogResult};

/// Auto-detect and initialize the best logging configuration
///
/// Uses [`Config::from_env`] when `ENCLAVE_LOG` or `RUST_LOG` is set, the
/// development preset in debug builds and the production preset otherwise.
pub fn auto_init() -> LogResult<LoggerGuard> {
    if std::env::var_os("ENCLAVE_LOG").is_some() || std::env::var_os("RUST_LOG").is_some() {
        init_with(Config::from_env())
    } else if cfg!(debug_assertions) {
        init_with(Config::development())
    } else {
        init_with(Config::production())
    }
}

/// Initialize with default configuration
pub fn init() -> LogResult<LoggerGuard> {
    init_with(Config::default())
}

/// Initialize with custom configuration
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Initialize for tests
///
/// Safe to call from every test: a second call is a no-op.
pub fn init_test() -> LoggerGuard {
    if tracing::dispatcher::has_been_set() {
        return LoggerGuard::noop();
    }
    init_with(Config::test()).unwrap_or_else(|_| LoggerGuard::noop())
}
