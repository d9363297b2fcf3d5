//! Background delivery worker: a bounded queue feeding a single consumer
//! loop that hands envelopes to the caching transport in strict FIFO
//! order.
//!
//! Enqueue never blocks and never suspends; a full queue rejects the new
//! envelope (back-pressure by drop, reported with a diagnostic). One
//! consumer, no fan-out: session lifecycle envelopes must reach the
//! transport in the order they were enqueued.
//!
//! Flush works by marker: a flush request travels through the queue
//! behind everything enqueued before it, so its completion means the
//! queue was drained and the in-flight send finished. Concurrent flushes
//! coalesce onto the same drain signal. Shutdown is a bounded flush
//! followed by a cooperative stop; the consumer checks for it between
//! envelopes, and the in-flight HTTP call is bounded by its own request
//! timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelope_protocol::Envelope;
use envelope_transport::{CachingTransport, EnvelopeSender, SendOutcome};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, warn};

/// Queue and shutdown tuning for the delivery worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum envelopes waiting in the in-memory queue.
    pub queue_size: usize,
    /// How long `close` waits for the queue to drain.
    pub shutdown_timeout: Duration,
    /// Cadence of cache replay sweeps.
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_size: 100,
            shutdown_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

enum WorkerMessage {
    Envelope(Envelope),
    Flush(watch::Sender<bool>),
}

/// Lifecycle: Running until `close`, Draining while the shutdown flush
/// runs, Disposed once the consumer has stopped. Disposed is terminal;
/// only idempotent `close` is accepted afterwards.
pub struct DeliveryWorker {
    sender: mpsc::Sender<WorkerMessage>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending_flush: Arc<Mutex<Option<watch::Receiver<bool>>>>,
    disposed: AtomicBool,
    config: WorkerConfig,
}

impl DeliveryWorker {
    /// Spawn the consumer loop over `transport`.
    ///
    /// The first sweep tick fires immediately, replaying anything a
    /// previous process left in the cache.
    pub fn start(transport: CachingTransport, config: WorkerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending_flush = Arc::new(Mutex::new(None));

        let handle = tokio::spawn(consumer_loop(
            transport,
            receiver,
            shutdown_rx,
            pending_flush.clone(),
            config.sweep_interval,
        ));

        Self {
            sender,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
            pending_flush,
            disposed: AtomicBool::new(false),
            config,
        }
    }

    /// Hand an envelope to the pipeline. Never blocks.
    ///
    /// Returns whether the envelope was accepted. A full queue or a
    /// disposed worker rejects it; nothing is ever surfaced to the
    /// capture call site beyond this bool.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            debug!("worker disposed, dropping envelope");
            return false;
        }
        match self.sender.try_send(WorkerMessage::Envelope(envelope)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("delivery queue full, dropping envelope");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("delivery queue closed, dropping envelope");
                false
            }
        }
    }

    /// Wait until everything enqueued so far is handed off (including the
    /// in-flight send), or `timeout` elapses. Returns whether the drain
    /// completed in time. Callers arriving while a drain marker is still
    /// queued share its signal.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let rx = {
            let mut pending = self.pending_flush.lock().expect("lock poisoned");
            if let Some(rx) = pending.as_ref() {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(false);
                match self.sender.try_send(WorkerMessage::Flush(tx)) {
                    Ok(()) => {
                        *pending = Some(rx.clone());
                        rx
                    }
                    // Queue full or closed: the drain certainly cannot
                    // complete, report honestly.
                    Err(_) => return false,
                }
            }
        };
        let mut rx = rx;
        tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Drain with the configured shutdown timeout, then stop the consumer
    /// and release the transport. Idempotent; returns whether the final
    /// drain completed.
    pub async fn close(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return true;
        }
        // Enqueues are rejected from here on, so a marker placed at the
        // back of the queue covers every accepted envelope.
        let drained = self.drain(self.config.shutdown_timeout).await;
        if !drained {
            warn!("shutdown flush timed out, envelopes remain cached or queued");
        }

        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            // The loop stops between envelopes; an in-flight send is
            // bounded by the transport's request timeout.
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("consumer loop did not stop in time, detaching");
            }
        }
        drained
    }

    /// Shutdown drain with its own marker.
    ///
    /// `flush` may coalesce onto a marker that predates recently accepted
    /// envelopes; the final drain must sit behind all of them, so it never
    /// shares a signal. Retries while the queue has no free slot, up to
    /// the deadline.
    async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let (tx, mut rx) = watch::channel(false);
        let mut marker = WorkerMessage::Flush(tx);
        loop {
            match self.sender.try_send(marker) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    if tokio::time::Instant::now() >= deadline {
                        return false;
                    }
                    marker = returned;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        tokio::time::timeout_at(deadline, rx.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

async fn consumer_loop(
    transport: CachingTransport,
    mut receiver: mpsc::Receiver<WorkerMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    pending_flush: Arc<Mutex<Option<watch::Receiver<bool>>>>,
    sweep_interval: Duration,
) {
    let mut ticker = interval(sweep_interval);
    loop {
        tokio::select! {
            maybe_msg = receiver.recv() => {
                match maybe_msg {
                    Some(WorkerMessage::Envelope(envelope)) => {
                        deliver(&transport, envelope).await;
                    }
                    Some(WorkerMessage::Flush(done)) => {
                        // Everything enqueued before this marker has been
                        // delivered; clear the slot before signaling so a
                        // late flush caller starts a fresh cycle.
                        *pending_flush.lock().expect("lock poisoned") = None;
                        let _ = done.send(true);
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let delivered = transport.sweep().await;
                if delivered > 0 {
                    debug!(delivered, "cache sweep replayed envelopes");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("delivery consumer stopped");
}

async fn deliver(transport: &CachingTransport, envelope: Envelope) {
    match transport.send(envelope).await {
        SendOutcome::Sent => {}
        SendOutcome::RateLimited => debug!("envelope dropped by rate limit"),
        SendOutcome::Retryable(reason) => {
            debug!(reason, "envelope delivery failed, cached for retry")
        }
        SendOutcome::Fatal(reason) => error!(reason, "envelope permanently rejected"),
    }
}
