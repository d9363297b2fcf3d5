//! Envelope serialization error types.

use thiserror::Error;

/// Error produced while serializing or parsing the envelope container format.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Header or item-header JSON could not be serialized or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The byte stream ended before the declared item payload length.
    #[error("truncated item payload: declared {declared} bytes, found {found}")]
    TruncatedPayload {
        /// Length declared in the item header.
        declared: usize,
        /// Bytes actually available.
        found: usize,
    },

    /// A required header line was missing or not terminated.
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
}

/// Convenience Result alias for envelope operations.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
