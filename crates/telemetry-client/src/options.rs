//! Client configuration and DSN parsing.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::client::ClientError;

/// Tuning knobs for the delivery pipeline.
///
/// Every field has a production default so a config file only needs to
/// spell out the DSN:
///
/// ```json
/// { "dsn": "https://abc123@ingest.example.com/42" }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOptions {
    /// Where to deliver envelopes. Required at start.
    pub dsn: Option<String>,
    /// Maximum envelopes waiting in the in-memory queue.
    pub queue_size: usize,
    /// Spill directory for undeliverable envelopes. `None` disables the
    /// disk cache; failed envelopes are then dropped.
    pub cache_dir: Option<PathBuf>,
    /// Maximum envelopes kept on disk; oldest evicted first.
    pub max_cached_envelopes: usize,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// How long `close` waits for the final drain.
    pub shutdown_timeout: Duration,
    /// Cadence of cache replay sweeps.
    pub sweep_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dsn: None,
            queue_size: 100,
            cache_dir: None,
            max_cached_envelopes: 30,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ClientOptions {
    /// Options pointing at `dsn`, everything else defaulted.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }
}

/// A parsed data source name: `scheme://public_key@host[:port]/project_id`.
///
/// The public key authenticates the client; the project id routes the
/// envelope. Both are baked into the ingest URL and auth header at parse
/// time so nothing downstream ever re-validates them.
#[derive(Debug, Clone)]
pub struct Dsn {
    public_key: String,
    project_id: String,
    ingest: Url,
}

impl Dsn {
    /// The public key from the DSN's userinfo part.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The project id from the DSN path.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Fully resolved envelope ingestion endpoint.
    pub fn ingest_url(&self) -> &Url {
        &self.ingest
    }

    /// Value for the authentication header.
    pub fn auth_header(&self) -> String {
        format!("key={}", self.public_key)
    }
}

impl FromStr for Dsn {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url =
            Url::parse(s).map_err(|e| ClientError::InvalidDsn(format!("{s:?}: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidDsn(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }
        let public_key = url.username();
        if public_key.is_empty() {
            return Err(ClientError::InvalidDsn(
                "missing public key before '@'".to_string(),
            ));
        }
        if url.host_str().is_none() {
            return Err(ClientError::InvalidDsn("missing host".to_string()));
        }
        let project_id = url.path().trim_matches('/');
        if project_id.is_empty() || project_id.contains('/') {
            return Err(ClientError::InvalidDsn(
                "path must be a single project id".to_string(),
            ));
        }

        let public_key = public_key.to_string();
        let project_id = project_id.to_string();

        // Credentials travel in the auth header, never in the URL.
        let mut ingest = url;
        ingest
            .set_username("")
            .map_err(|_| ClientError::InvalidDsn("cannot strip credentials".to_string()))?;
        ingest
            .set_password(None)
            .map_err(|_| ClientError::InvalidDsn("cannot strip credentials".to_string()))?;
        ingest.set_path(&format!("/api/{project_id}/envelope/"));
        ingest.set_query(None);
        ingest.set_fragment(None);

        Ok(Self {
            public_key,
            project_id,
            ingest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_resolves_ingest_url_and_auth() {
        let dsn: Dsn = "https://abc123@ingest.example.com/42".parse().unwrap();
        assert_eq!(dsn.public_key(), "abc123");
        assert_eq!(dsn.project_id(), "42");
        assert_eq!(
            dsn.ingest_url().as_str(),
            "https://ingest.example.com/api/42/envelope/"
        );
        assert_eq!(dsn.auth_header(), "key=abc123");
    }

    #[test]
    fn dsn_keeps_explicit_port() {
        let dsn: Dsn = "http://key@localhost:9000/7".parse().unwrap();
        assert_eq!(
            dsn.ingest_url().as_str(),
            "http://localhost:9000/api/7/envelope/"
        );
    }

    #[test]
    fn dsn_rejects_missing_pieces() {
        for bad in [
            "https://ingest.example.com/42",    // no public key
            "https://key@ingest.example.com/",  // no project id
            "https://key@ingest.example.com/a/b", // nested path
            "ftp://key@ingest.example.com/42",  // scheme
            "not a url",
        ] {
            assert!(
                bad.parse::<Dsn>().is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ClientOptions =
            serde_json::from_str(r#"{"dsn":"https://k@h.example/1","queue_size":5}"#).unwrap();
        assert_eq!(options.dsn.as_deref(), Some("https://k@h.example/1"));
        assert_eq!(options.queue_size, 5);
        assert_eq!(options.max_cached_envelopes, 30);
        assert_eq!(options.request_timeout, Duration::from_secs(30));
        assert!(options.cache_dir.is_none());
    }

    #[test]
    fn options_reject_unknown_fields() {
        assert!(serde_json::from_str::<ClientOptions>(r#"{"qeue_size":5}"#).is_err());
    }
}
