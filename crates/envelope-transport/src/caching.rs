//! Caching decorator: persist before send, replay after failure.

use std::sync::Arc;

use async_trait::async_trait;
use envelope_disk_cache::{CacheError, EnvelopeCache};
use envelope_protocol::Envelope;
use tracing::{debug, error, warn};

use crate::{EnvelopeSender, SendOutcome};

/// Wraps an inner sender with the durable disk cache.
///
/// Live sends persist to disk (claimed, so a concurrent sweep cannot see
/// them) before the network attempt; the entry is deleted only after a
/// terminal outcome. [`CachingTransport::sweep`] replays leftovers from
/// prior failures or crashes oldest-first, stopping at the first
/// retryable or rate-limited outcome to avoid hammering a degraded
/// endpoint.
///
/// With no cache configured this is a plain pass-through.
pub struct CachingTransport {
    inner: Arc<dyn EnvelopeSender>,
    cache: Option<EnvelopeCache>,
}

impl CachingTransport {
    /// Wrap `inner`, spilling to `cache` when present.
    pub fn new(inner: Arc<dyn EnvelopeSender>, cache: Option<EnvelopeCache>) -> Self {
        Self { inner, cache }
    }

    /// The disk cache, if caching is enabled.
    pub fn cache(&self) -> Option<&EnvelopeCache> {
        self.cache.as_ref()
    }

    /// Replay cached envelopes oldest-first.
    ///
    /// Each entry is claimed before its send so live traffic and other
    /// sweeps never double-send it. Returns the number delivered.
    pub async fn sweep(&self) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        let keys = match cache.enumerate() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "cache sweep failed to enumerate");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }
        debug!(pending = keys.len(), "sweeping envelope cache");

        let mut delivered = 0;
        for key in keys {
            let claimed = match cache.claim(&key) {
                Ok(claimed) => claimed,
                // Deleted, claimed elsewhere, or dropped as corrupt: move on.
                Err(CacheError::NotFound(_)) | Err(CacheError::Corrupt { .. }) => continue,
                Err(err) => {
                    warn!(error = %err, "cache sweep stopped");
                    break;
                }
            };

            match self.inner.send(claimed.envelope().clone()).await {
                SendOutcome::Sent => {
                    self.remove(&claimed);
                    delivered += 1;
                }
                SendOutcome::Fatal(reason) => {
                    error!(key = %claimed.key().as_str(), reason, "cached envelope permanently rejected");
                    self.remove(&claimed);
                }
                SendOutcome::Retryable(_) | SendOutcome::RateLimited => {
                    // Leave this and everything younger for the next sweep.
                    self.restore(&claimed);
                    break;
                }
            }
        }
        delivered
    }

    fn remove(&self, claimed: &envelope_disk_cache::ClaimedEnvelope) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.discard(claimed) {
                warn!(error = %err, "failed to remove delivered envelope from cache");
            }
        }
    }

    fn restore(&self, claimed: &envelope_disk_cache::ClaimedEnvelope) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.release(claimed) {
                warn!(error = %err, "failed to return envelope to cache");
            }
        }
    }
}

#[async_trait]
impl EnvelopeSender for CachingTransport {
    async fn send(&self, envelope: Envelope) -> SendOutcome {
        let Some(cache) = &self.cache else {
            return self.inner.send(envelope).await;
        };

        match cache.persist_claimed(&envelope) {
            Ok(claimed) => {
                let outcome = self.inner.send(envelope).await;
                if outcome.is_terminal() {
                    self.remove(&claimed);
                } else {
                    self.restore(&claimed);
                }
                outcome
            }
            Err(err) => {
                // Cache gone (disk full, read-only): better an uncached
                // attempt than losing the envelope outright.
                warn!(error = %err, "cache unavailable, attempting direct send");
                self.inner.send(envelope).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordingSender;
    use envelope_protocol::{EnvelopeHeaders, EnvelopeItem, ItemType};

    fn sample(tag: &str) -> Envelope {
        Envelope::new(EnvelopeHeaders::default()).with_item(EnvelopeItem::new(
            ItemType::Event,
            None,
            format!(r#"{{"message":"{tag}"}}"#).into_bytes(),
        ))
    }

    fn cached_transport(dir: &std::path::Path, inner: Arc<RecordingSender>) -> CachingTransport {
        CachingTransport::new(inner, Some(EnvelopeCache::open(dir, 10).unwrap()))
    }

    #[tokio::test]
    async fn success_leaves_cache_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inner = Arc::new(RecordingSender::new());
        let transport = cached_transport(temp.path(), inner.clone());

        assert_eq!(transport.send(sample("a")).await, SendOutcome::Sent);
        assert!(transport.cache().unwrap().is_empty().unwrap());
        assert_eq!(inner.sent_count(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_keeps_entry_for_sweep() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inner = Arc::new(RecordingSender::new());
        let transport = cached_transport(temp.path(), inner.clone());

        inner.push_outcome(SendOutcome::Retryable("503".to_string()));
        assert!(matches!(
            transport.send(sample("a")).await,
            SendOutcome::Retryable(_)
        ));
        assert_eq!(transport.cache().unwrap().len().unwrap(), 1);

        // Next sweep replays and drains it.
        assert_eq!(transport.sweep().await, 1);
        assert!(transport.cache().unwrap().is_empty().unwrap());
        assert_eq!(inner.sent_count(), 2);
    }

    #[tokio::test]
    async fn fatal_failure_discards_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inner = Arc::new(RecordingSender::new());
        let transport = cached_transport(temp.path(), inner.clone());

        inner.push_outcome(SendOutcome::Fatal("HTTP 400".to_string()));
        assert!(matches!(
            transport.send(sample("a")).await,
            SendOutcome::Fatal(_)
        ));
        assert!(transport.cache().unwrap().is_empty().unwrap());
    }

    #[tokio::test]
    async fn sweep_stops_early_on_retryable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inner = Arc::new(RecordingSender::new());
        let transport = cached_transport(temp.path(), inner.clone());

        // Three failures leave three cached entries.
        for tag in ["1", "2", "3"] {
            inner.push_outcome(SendOutcome::Retryable("503".to_string()));
            transport.send(sample(tag)).await;
        }
        assert_eq!(transport.cache().unwrap().len().unwrap(), 3);
        let calls_before = inner.sent_count();

        // First replay fails again: the sweep must stop after one attempt.
        inner.push_outcome(SendOutcome::Retryable("503".to_string()));
        assert_eq!(transport.sweep().await, 0);
        assert_eq!(inner.sent_count(), calls_before + 1);
        assert_eq!(transport.cache().unwrap().len().unwrap(), 3);

        // Endpoint recovered: everything drains in order.
        assert_eq!(transport.sweep().await, 3);
        assert!(transport.cache().unwrap().is_empty().unwrap());
    }

    #[tokio::test]
    async fn sweep_replays_oldest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inner = Arc::new(RecordingSender::new());
        let transport = cached_transport(temp.path(), inner.clone());

        for tag in ["old", "mid", "new"] {
            inner.push_outcome(SendOutcome::Retryable("503".to_string()));
            transport.send(sample(tag)).await;
        }
        inner.clear_sent();

        transport.sweep().await;
        let replayed: Vec<Vec<u8>> = inner
            .sent()
            .iter()
            .map(|e| e.items()[0].payload().to_vec())
            .collect();
        assert_eq!(
            replayed,
            vec![
                br#"{"message":"old"}"#.to_vec(),
                br#"{"message":"mid"}"#.to_vec(),
                br#"{"message":"new"}"#.to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn without_cache_send_passes_through() {
        let inner = Arc::new(RecordingSender::new());
        let transport = CachingTransport::new(inner.clone(), None);

        assert_eq!(transport.send(sample("a")).await, SendOutcome::Sent);
        assert_eq!(transport.sweep().await, 0);
        assert_eq!(inner.sent_count(), 1);
    }

    #[tokio::test]
    async fn startup_sweep_replays_prior_run_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let inner = Arc::new(RecordingSender::new());
            let transport = cached_transport(temp.path(), inner.clone());
            inner.push_outcome(SendOutcome::Retryable("503".to_string()));
            transport.send(sample("leftover")).await;
        } // process "restarts"

        let inner = Arc::new(RecordingSender::new());
        let transport = cached_transport(temp.path(), inner.clone());
        assert_eq!(transport.sweep().await, 1);
        assert_eq!(inner.sent_count(), 1);
        assert!(transport.cache().unwrap().is_empty().unwrap());
    }
}
