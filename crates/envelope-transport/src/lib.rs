//! Envelope senders: the HTTP transport, its caching decorator, and an
//! in-memory recording sender for tests.
//!
//! Everything implements the one [`EnvelopeSender`] capability; decoration
//! is explicit wrapping at construction time (HTTP sender inside
//! [`CachingTransport`]), never open-ended inheritance.

mod caching;
mod http;
mod outcome;
mod recording;

pub use caching::CachingTransport;
pub use http::{HttpTransport, TransportError, TransportResult, AUTH_HEADER, ENVELOPE_CONTENT_TYPE};
pub use outcome::{EnvelopeSender, SendOutcome};
pub use recording::RecordingSender;
