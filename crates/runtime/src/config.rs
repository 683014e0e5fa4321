//! Runtime configuration.

use std::path::Path;
use std::time::Duration;

use enclave_plugin::PayloadLimits;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::Endpoint;
use crate::resolver::ResolutionPolicy;

/// Default bind timeout.
pub const DEFAULT_BIND_TIMEOUT_MS: u64 = 5_000;

/// Top-level runtime configuration.
///
/// ```toml
/// [binder]
/// bind_timeout_ms = 2000
/// strict_resolution = true
///
/// [payload]
/// max_bytes = 65536
///
/// [[endpoints]]
/// worker_id = "w1"
/// component = "/usr/libexec/enclave/w1-worker"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Binder settings.
    pub binder: BinderConfig,
    /// Payload size limits.
    pub payload: PayloadLimits,
    /// Endpoints to seed a [`StaticRegistry`](crate::StaticRegistry) with.
    pub endpoints: Vec<Endpoint>,
}

/// Binder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// How long `acquire` waits for the worker to connect.
    pub bind_timeout_ms: u64,
    /// Fail resolution when several endpoints match instead of taking the
    /// first.
    pub strict_resolution: bool,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            bind_timeout_ms: DEFAULT_BIND_TIMEOUT_MS,
            strict_resolution: false,
        }
    }
}

impl BinderConfig {
    /// Bind timeout as a [`Duration`].
    #[inline]
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    /// Resolution policy implied by `strict_resolution`.
    pub fn resolution_policy(&self) -> ResolutionPolicy {
        if self.strict_resolution {
            ResolutionPolicy::Strict
        } else {
            ResolutionPolicy::FirstMatch
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binder.bind_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "binder.bind_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.payload.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "payload.max_bytes must be greater than 0".into(),
            ));
        }
        for endpoint in &self.endpoints {
            if endpoint.worker_id.is_empty() || endpoint.component.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "endpoint ({:?}, {:?}) must name both worker_id and component",
                    endpoint.worker_id, endpoint.component
                )));
            }
        }
        Ok(())
    }
}
