//! Client handle: pipeline assembly and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use delivery_worker::{DeliveryWorker, WorkerConfig};
use envelope_disk_cache::{CacheError, EnvelopeCache};
use envelope_protocol::Envelope;
use envelope_transport::{CachingTransport, HttpTransport, TransportError};
use rate_limit_gate::RateLimiter;
use thiserror::Error;
use tracing::info;

use crate::options::{ClientOptions, Dsn};

/// Error starting a client. Once running, the pipeline never surfaces
/// errors to capture call sites.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The DSN is missing or malformed.
    #[error("invalid DSN: {0}")]
    InvalidDsn(String),
    /// The HTTP transport could not be constructed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The cache directory could not be opened.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Convenience Result alias for client construction.
pub type ClientResult<T> = Result<T, ClientError>;

/// Handle to a running delivery pipeline.
///
/// Must be started inside a tokio runtime; the consumer loop is spawned
/// onto it. Dropping the handle without [`TelemetryClient::close`] stops
/// accepting envelopes but does not drain the queue.
pub struct TelemetryClient {
    worker: DeliveryWorker,
}

impl TelemetryClient {
    /// Assemble and start the pipeline described by `options`.
    pub fn start(options: ClientOptions) -> ClientResult<Self> {
        let dsn: Dsn = options
            .dsn
            .as_deref()
            .ok_or_else(|| ClientError::InvalidDsn("no DSN configured".to_string()))?
            .parse()?;

        let limiter = Arc::new(RateLimiter::new());
        let transport = HttpTransport::new(
            dsn.ingest_url().clone(),
            dsn.auth_header(),
            options.request_timeout,
            limiter,
        )?;

        let cache = match &options.cache_dir {
            Some(dir) => Some(EnvelopeCache::open(dir, options.max_cached_envelopes)?),
            None => None,
        };
        let caching = CachingTransport::new(Arc::new(transport), cache);

        let worker = DeliveryWorker::start(
            caching,
            WorkerConfig {
                queue_size: options.queue_size,
                shutdown_timeout: options.shutdown_timeout,
                sweep_interval: options.sweep_interval,
            },
        );

        info!(
            endpoint = %dsn.ingest_url(),
            project = dsn.project_id(),
            cached = options.cache_dir.is_some(),
            "telemetry client started"
        );
        Ok(Self { worker })
    }

    /// Hand an envelope to the pipeline. Never blocks; returns whether it
    /// was accepted.
    pub fn enqueue_envelope(&self, envelope: Envelope) -> bool {
        self.worker.enqueue(envelope)
    }

    /// Wait until everything enqueued so far has been handed to the
    /// transport, or `timeout` elapses. Returns whether the drain
    /// completed in time.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.worker.flush(timeout).await
    }

    /// Drain and shut the pipeline down. Idempotent.
    pub async fn close(&self) -> bool {
        self.worker.close().await
    }
}
