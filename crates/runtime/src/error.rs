//! Runtime error types.

use std::path::PathBuf;

use enclave_plugin::{Failure, FailureType, PayloadTooLarge};
use enclave_plugin_protocol::ProtocolError;

/// No usable endpoint for a worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Nothing is registered for the worker id.
    #[error("no endpoint registered for worker '{worker_id}'")]
    NotFound {
        /// The worker id that was looked up.
        worker_id: String,
    },

    /// More than one endpoint matched under the strict policy.
    #[error("{count} endpoints registered for worker '{worker_id}'")]
    Ambiguous {
        /// The worker id that was looked up.
        worker_id: String,
        /// Number of matches.
        count: usize,
    },
}

/// Errors from [`WorkerBinder::acquire`](crate::WorkerBinder::acquire).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    /// The worker could not be resolved. Not retryable without an external
    /// change such as installing the worker.
    #[error("cannot resolve worker: {0}")]
    Resolution(#[from] ResolveError),

    /// The worker did not connect within the bind timeout.
    #[error("binding to worker '{worker_id}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Worker id.
        worker_id: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The transport refused the bind or the worker died mid-handshake.
    #[error("binding to worker '{worker_id}' failed: {reason}")]
    Failed {
        /// Worker id.
        worker_id: String,
        /// What went wrong.
        reason: String,
    },
}

impl BindError {
    /// Whether retrying the bind may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Resolution(_))
    }
}

/// Outcome of a failed controller operation.
///
/// Every dispatched call ends with exactly one `Ok` or one of these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PluginError {
    /// No live connection could be obtained.
    #[error(transparent)]
    Binding(#[from] BindError),

    /// The worker reported a load failure.
    #[error("load failed: {0}")]
    Load(Failure),

    /// The worker reported an execute failure, or the call was invalid in
    /// the plugin's current state.
    #[error("execute failed: {0}")]
    Execute(Failure),

    /// The worker reported an unload failure.
    #[error("unload failed: {0}")]
    Unload(Failure),

    /// The channel broke before the worker answered.
    #[error("transport error: {message}")]
    Transport {
        /// What broke.
        message: String,
    },

    /// The binding was torn down while the call was in flight.
    #[error("connection to worker '{worker_id}' lost")]
    ConnectionLost {
        /// Worker id.
        worker_id: String,
    },

    /// An input or output payload exceeded the configured limit.
    #[error(transparent)]
    PayloadTooLarge(#[from] PayloadTooLarge),
}

impl PluginError {
    /// Transport error with `message`.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Binding(e) => e.is_retryable(),
            Self::Transport { .. } | Self::ConnectionLost { .. } => true,
            _ => false,
        }
    }

    /// Reserved failure code, when the error maps to one.
    pub fn failure_type(&self) -> Option<FailureType> {
        match self {
            Self::Load(f) | Self::Execute(f) | Self::Unload(f) => Some(f.code),
            Self::Transport { .. } | Self::ConnectionLost { .. } => Some(FailureType::Transport),
            Self::Binding(_) | Self::PayloadTooLarge(_) => None,
        }
    }
}

/// Errors from [`PluginManager::create`](crate::PluginManager::create).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// No endpoint could be resolved or bound for the worker.
    #[error("service not found for worker '{worker_id}'")]
    ServiceNotFound {
        /// Worker id.
        worker_id: String,
        /// Underlying bind failure.
        #[source]
        source: BindError,
    },
}

/// Errors from a live channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The worker side is gone.
    #[error("channel to '{component}' is closed")]
    Closed {
        /// Endpoint component.
        component: String,
    },

    /// A frame could not be produced.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML did not parse.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}
