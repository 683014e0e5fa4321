//! Sandbox error types.

use enclave_plugin::Failure;

/// Why a plugin could not be instantiated.
///
/// Always reported to the host as `ERROR_LOADING_PLUGIN`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadFailure {
    /// No factory is registered for the entry point.
    #[error("unknown entry point '{0}'")]
    UnknownEntryPoint(String),

    /// A declared archive is not in the archive store.
    #[error("archive '{0}' is not available")]
    MissingArchive(String),

    /// A declared archive checksum does not match the stored one.
    #[error("archive '{archive}' checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch {
        /// Archive id.
        archive: String,
        /// Checksum declared by the descriptor.
        expected: String,
        /// Checksum in the store.
        actual: String,
    },

    /// The factory returned a failure.
    #[error("factory failed: {0}")]
    Factory(Failure),

    /// The factory panicked.
    #[error("factory panicked: {0}")]
    Panicked(String),
}

impl LoadFailure {
    /// The failure reported across the boundary.
    pub fn to_failure(&self) -> Failure {
        Failure::loading(self.to_string())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
