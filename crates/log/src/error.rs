//! Error types for logger setup.

/// Result type for logger operations
pub type LogResult<T> = Result<T, LogError>;

/// Error type for logger operations
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Filter parsing error
    #[error("invalid filter: {0}")]
    Filter(String),

    /// The global subscriber could not be installed
    #[error("subscriber init failed: {0}")]
    Init(String),
}
