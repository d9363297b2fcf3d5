//! HTTP sender for the ingestion endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use envelope_protocol::Envelope;
use rate_limit_gate::{RateLimiter, RATE_LIMITS_HEADER, RETRY_AFTER_HEADER};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{EnvelopeSender, SendOutcome};

/// Authentication header carrying the DSN-derived credentials.
pub const AUTH_HEADER: &str = "X-Telemetry-Auth";

/// Content type of a serialized envelope body.
pub const ENVELOPE_CONTENT_TYPE: &str = "application/x-telemetry-envelope";

/// Error constructing a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Convenience Result alias for transport construction.
pub type TransportResult<T> = Result<T, TransportError>;

/// Sends one envelope per call over HTTP POST.
///
/// Rate-limited items are filtered out before serialization; if nothing
/// remains the network call is skipped entirely. There is no retry loop in
/// here: retry is the caching decorator's replay-on-next-sweep.
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    auth: String,
    limiter: Arc<RateLimiter>,
}

impl HttpTransport {
    /// Build a transport with a per-request timeout.
    pub fn new(
        endpoint: Url,
        auth: String,
        request_timeout: Duration,
        limiter: Arc<RateLimiter>,
    ) -> TransportResult<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            auth,
            limiter,
        })
    }

    /// The rate limiter consulted before every send.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl EnvelopeSender for HttpTransport {
    async fn send(&self, envelope: Envelope) -> SendOutcome {
        // One clock read covers every item's category check.
        let now = Instant::now();
        let Some(filtered) = envelope.filtered(|category| !self.limiter.is_limited_at(category, now))
        else {
            debug!("all envelope items rate limited, skipping send");
            return SendOutcome::RateLimited;
        };

        let body = match filtered.to_bytes() {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "envelope failed to serialize, discarding");
                return SendOutcome::Fatal(err.to_string());
            }
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(AUTH_HEADER, &self.auth)
            .header("Content-Type", ENVELOPE_CONTENT_TYPE)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "envelope send failed, will retry on next sweep");
                return SendOutcome::Retryable(err.to_string());
            }
        };

        let status = response.status();
        let rate_limits = header_value(&response, RATE_LIMITS_HEADER);
        let retry_after = header_value(&response, RETRY_AFTER_HEADER);

        // Servers may signal limits preemptively, even on success.
        self.limiter
            .update(status.as_u16(), rate_limits.as_deref(), retry_after.as_deref());

        if status.is_success() {
            return SendOutcome::Sent;
        }
        if status.as_u16() == 429 || (status.is_client_error() && rate_limits.is_some()) {
            debug!(status = status.as_u16(), "envelope rate limited by server");
            return SendOutcome::RateLimited;
        }
        if status.is_client_error() {
            warn!(status = status.as_u16(), "envelope rejected by server");
            return SendOutcome::Fatal(format!("HTTP {status}"));
        }
        debug!(status = status.as_u16(), "server error, will retry on next sweep");
        SendOutcome::Retryable(format!("HTTP {status}"))
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envelope_protocol::{Category, EnvelopeHeaders, EnvelopeItem, ItemType};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event_envelope() -> Envelope {
        Envelope::new(EnvelopeHeaders::default()).with_item(EnvelopeItem::new(
            ItemType::Event,
            Some("application/json".to_string()),
            br#"{"message":"boom"}"#.to_vec(),
        ))
    }

    async fn transport_for(server: &MockServer) -> HttpTransport {
        HttpTransport::new(
            Url::parse(&format!("{}/api/42/envelope/", server.uri())).unwrap(),
            "key=public".to_string(),
            Duration::from_secs(2),
            Arc::new(RateLimiter::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn success_response_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/42/envelope/"))
            .and(header(AUTH_HEADER, "key=public"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        assert_eq!(transport.send(event_envelope()).await, SendOutcome::Sent);
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        assert!(matches!(
            transport.send(event_envelope()).await,
            SendOutcome::Retryable(_)
        ));
    }

    #[tokio::test]
    async fn client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        assert!(matches!(
            transport.send(event_envelope()).await,
            SendOutcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn connection_failure_is_retryable() {
        // Grab a free port and close it again so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(
            Url::parse(&format!("http://{addr}/api/42/envelope/")).unwrap(),
            "key=public".to_string(),
            Duration::from_secs(2),
            Arc::new(RateLimiter::new()),
        )
        .unwrap();

        assert!(matches!(
            transport.send(event_envelope()).await,
            SendOutcome::Retryable(_)
        ));
    }

    #[tokio::test]
    async fn rate_limit_on_429_blocks_followup_sends() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("X-Telemetry-Rate-Limits", "60:error:quota"),
            )
            .expect(1) // the second envelope must never reach the wire
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        assert_eq!(
            transport.send(event_envelope()).await,
            SendOutcome::RateLimited
        );
        assert!(transport.limiter().is_limited(Category::Error));
        assert_eq!(
            transport.send(event_envelope()).await,
            SendOutcome::RateLimited
        );
    }

    #[tokio::test]
    async fn preemptive_rate_limit_on_success_is_applied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Telemetry-Rate-Limits", "60:session:quota"),
            )
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        assert_eq!(transport.send(event_envelope()).await, SendOutcome::Sent);
        assert!(transport.limiter().is_limited(Category::Session));
        assert!(!transport.limiter().is_limited(Category::Error));
    }

    #[tokio::test]
    async fn partial_filtering_sends_remaining_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let limiter = Arc::new(RateLimiter::new());
        limiter.update(200, Some("60:error:quota"), None);
        let transport = HttpTransport::new(
            Url::parse(&format!("{}/api/42/envelope/", server.uri())).unwrap(),
            "key=public".to_string(),
            Duration::from_secs(2),
            limiter,
        )
        .unwrap();

        // Mixed envelope: the error item is filtered, the session item flows.
        let envelope = Envelope::new(EnvelopeHeaders::default())
            .with_item(EnvelopeItem::new(ItemType::Event, None, b"{}".to_vec()))
            .with_item(EnvelopeItem::new(ItemType::Session, None, b"{}".to_vec()));
        assert_eq!(transport.send(envelope).await, SendOutcome::Sent);
    }
}
