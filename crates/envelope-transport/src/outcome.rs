//! The sender capability and its outcome taxonomy.

use async_trait::async_trait;
use envelope_protocol::Envelope;

/// Result of one delivery attempt.
///
/// Failures are part of the outcome, not an error channel: nothing in the
/// pipeline propagates send failures back to capture call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The endpoint accepted the envelope.
    Sent,
    /// Dropped client-side or rejected with 429; the attempt is expected,
    /// not a failure, and is never retried synchronously.
    RateLimited,
    /// Transient failure (5xx, timeout, connection error); a cached copy
    /// is worth replaying on a later sweep.
    Retryable(String),
    /// Permanent rejection (payload or auth); resending identical bytes
    /// cannot succeed.
    Fatal(String),
}

impl SendOutcome {
    /// Terminal outcomes allow the cached copy to be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendOutcome::Sent | SendOutcome::Fatal(_))
    }
}

/// One-method capability implemented by every sender variant.
#[async_trait]
pub trait EnvelopeSender: Send + Sync {
    /// Attempt to deliver one envelope. Never panics, never blocks beyond
    /// its own I/O timeouts.
    async fn send(&self, envelope: Envelope) -> SendOutcome;
}
