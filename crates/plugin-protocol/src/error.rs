//! Protocol error types.

/// Errors from encoding, decoding or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The underlying stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame was not valid JSON for the expected frame type.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame exceeded the configured size.
    #[error("frame is {actual} bytes, limit is {limit}")]
    FrameTooLarge {
        /// Configured limit.
        limit: usize,
        /// Observed size.
        actual: usize,
    },

    /// The peer announced a protocol revision this side does not speak.
    #[error("protocol version {actual} not supported (expected {expected})")]
    VersionMismatch {
        /// Revision this side speaks.
        expected: u32,
        /// Revision the peer announced.
        actual: u32,
    },
}
