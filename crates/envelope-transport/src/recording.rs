//! In-memory sender double for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use envelope_protocol::Envelope;

use crate::{EnvelopeSender, SendOutcome};

/// Records every envelope it is handed and replies with scripted outcomes.
///
/// Outcomes pushed with [`RecordingSender::push_outcome`] are consumed in
/// FIFO order; once exhausted the sender answers [`SendOutcome::Sent`]. An
/// optional per-send delay simulates a slow or hung endpoint.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Envelope>>,
    outcomes: Mutex<VecDeque<SendOutcome>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingSender {
    /// A sender that answers `Sent` to everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for a future send.
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.outcomes.lock().expect("lock poisoned").push_back(outcome);
    }

    /// Delay every send by `delay` (e.g. to simulate a hung socket).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock poisoned") = Some(delay);
    }

    /// Envelopes received so far, in arrival order.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    /// Number of send calls observed.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("lock poisoned").len()
    }

    /// Forget previously recorded envelopes.
    pub fn clear_sent(&self) {
        self.sent.lock().expect("lock poisoned").clear();
    }
}

#[async_trait]
impl EnvelopeSender for RecordingSender {
    async fn send(&self, envelope: Envelope) -> SendOutcome {
        let delay = *self.delay.lock().expect("lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().expect("lock poisoned").push(envelope);
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(SendOutcome::Sent)
    }
}
