//! Envelope container format for the Beacon delivery pipeline.
//!
//! An [`Envelope`] is the unit of delivery: an ordered sequence of
//! [`EnvelopeItem`]s (event, session, transaction, attachment) plus a small
//! header mapping. Envelopes are immutable once built and move by value
//! through the pipeline: queue slot, cache file, in-flight send.
//!
//! The crate also defines the rate-limit [`Category`] taxonomy shared by the
//! rate limiter and the HTTP transport.

mod category;
mod envelope;
mod error;
mod item;

pub use category::{Category, ItemType};
pub use envelope::{Envelope, EnvelopeHeaders};
pub use error::{EnvelopeError, EnvelopeResult};
pub use item::EnvelopeItem;
