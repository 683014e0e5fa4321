//! Contract-level error types.

/// Errors from building a [`WorkerDescriptor`](crate::WorkerDescriptor).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// A required field was empty.
    #[error("missing required field '{field}' for worker descriptor")]
    MissingField {
        /// The missing field name.
        field: &'static str,
    },

    /// The same archive id was listed twice.
    #[error("archive '{0}' listed more than once")]
    DuplicateArchive(String),
}
