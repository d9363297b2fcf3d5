//! The envelope container and its byte format.
//!
//! Serialized layout is newline-delimited: one JSON line of envelope
//! headers, then for each item a JSON header line (with the payload byte
//! length) followed by the raw payload bytes and a terminating newline.
//! Parsing recovers the envelope exactly, which is what lets the disk
//! cache replay entries bit-for-bit after a crash.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::item::ItemHeaderWire;
use crate::{Category, EnvelopeError, EnvelopeItem, EnvelopeResult};

/// Header mapping carried at the top of an envelope.
///
/// Extra fields are preserved in a sorted map so serialization stays
/// deterministic across a cache round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    /// Id of the primary event in this envelope, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    /// Client-side send timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Any further header fields, passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// An ordered batch of telemetry items ready for transmission.
///
/// Immutable once built: the pipeline only ever moves envelopes between
/// owners (queue slot, cache file, in-flight send), it never mutates them.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    headers: EnvelopeHeaders,
    items: Vec<EnvelopeItem>,
}

impl Envelope {
    /// Create an empty envelope with the given headers.
    pub fn new(headers: EnvelopeHeaders) -> Self {
        Self {
            headers,
            items: Vec::new(),
        }
    }

    /// Create an envelope with a fresh event id and `sent_at` of now.
    pub fn with_event_id() -> Self {
        Self::new(EnvelopeHeaders {
            event_id: Some(Uuid::new_v4()),
            sent_at: Some(Utc::now()),
            extra: BTreeMap::new(),
        })
    }

    /// Append an item, consuming and returning the envelope.
    pub fn with_item(mut self, item: EnvelopeItem) -> Self {
        self.items.push(item);
        self
    }

    /// Envelope headers.
    pub fn headers(&self) -> &EnvelopeHeaders {
        &self.headers
    }

    /// Items in insertion order.
    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    /// True when the envelope carries no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Distinct rate-limit categories across all items, in item order.
    pub fn categories(&self) -> Vec<Category> {
        let mut seen = Vec::new();
        for item in &self.items {
            let category = item.item_type().category();
            if !seen.contains(&category) {
                seen.push(category);
            }
        }
        seen
    }

    /// Copy of this envelope containing only items whose category passes
    /// `keep`. Returns `None` when every item is filtered out.
    pub fn filtered<F>(&self, mut keep: F) -> Option<Envelope>
    where
        F: FnMut(Category) -> bool,
    {
        let items: Vec<EnvelopeItem> = self
            .items
            .iter()
            .filter(|item| keep(item.item_type().category()))
            .cloned()
            .collect();
        if items.is_empty() {
            return None;
        }
        Some(Envelope {
            headers: self.headers.clone(),
            items,
        })
    }

    /// Serialize to the newline-delimited container format.
    pub fn to_bytes(&self) -> EnvelopeResult<Vec<u8>> {
        let mut out = Vec::with_capacity(
            64 + self
                .items
                .iter()
                .map(|item| item.payload().len() + 64)
                .sum::<usize>(),
        );
        serde_json::to_writer(&mut out, &self.headers)?;
        out.push(b'\n');
        for item in &self.items {
            item.write_into(&mut out)?;
        }
        Ok(out)
    }

    /// Parse an envelope previously produced by [`Envelope::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> EnvelopeResult<Envelope> {
        let (header_line, mut rest) =
            split_line(bytes).ok_or(EnvelopeError::Malformed("missing envelope header line"))?;
        let headers: EnvelopeHeaders = serde_json::from_slice(header_line)?;

        let mut items = Vec::new();
        while !rest.is_empty() {
            let (item_header_line, after_header) =
                split_line(rest).ok_or(EnvelopeError::Malformed("unterminated item header"))?;
            let wire: ItemHeaderWire = serde_json::from_slice(item_header_line)?;

            if after_header.len() < wire.length {
                return Err(EnvelopeError::TruncatedPayload {
                    declared: wire.length,
                    found: after_header.len(),
                });
            }
            let payload = after_header[..wire.length].to_vec();
            let item = EnvelopeItem::from_wire(wire, payload);
            rest = &after_header[payload_end(after_header, &item)..];
            items.push(item);
        }

        Ok(Envelope { headers, items })
    }
}

/// Split at the first newline; the newline itself is consumed.
fn split_line(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|&b| b == b'\n')?;
    Some((&bytes[..pos], &bytes[pos + 1..]))
}

/// Offset just past an item payload and its optional trailing newline.
fn payload_end(after_header: &[u8], item: &EnvelopeItem) -> usize {
    let len = item.payload().len();
    if after_header.get(len) == Some(&b'\n') {
        len + 1
    } else {
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemType;

    fn sample_envelope() -> Envelope {
        Envelope::with_event_id()
            .with_item(
                EnvelopeItem::from_json(ItemType::Event, &serde_json::json!({"message": "boom"}))
                    .unwrap(),
            )
            .with_item(EnvelopeItem::new(
                ItemType::Attachment,
                Some("application/octet-stream".to_string()),
                vec![0, 159, 146, 150],
            ))
    }

    #[test]
    fn round_trip_preserves_envelope() {
        let envelope = sample_envelope();
        let bytes = envelope.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn round_trip_is_byte_stable() {
        let envelope = sample_envelope();
        let bytes = envelope.to_bytes().unwrap();
        let reserialized = Envelope::from_bytes(&bytes).unwrap().to_bytes().unwrap();
        assert_eq!(reserialized, bytes);
    }

    #[test]
    fn binary_payload_with_newlines_survives() {
        let envelope = Envelope::new(EnvelopeHeaders::default()).with_item(EnvelopeItem::new(
            ItemType::Attachment,
            None,
            b"line1\nline2\n\n\xff".to_vec(),
        ));
        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.items()[0].payload(), b"line1\nline2\n\n\xff");
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let envelope = sample_envelope();
        let bytes = envelope.to_bytes().unwrap();
        let err = Envelope::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, EnvelopeError::TruncatedPayload { .. }));
    }

    #[test]
    fn unknown_item_type_round_trips() {
        let envelope = Envelope::new(EnvelopeHeaders::default()).with_item(EnvelopeItem::new(
            ItemType::Other("profile".to_string()),
            None,
            b"{}".to_vec(),
        ));
        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(
            parsed.items()[0].item_type(),
            &ItemType::Other("profile".to_string())
        );
    }

    #[test]
    fn extra_header_fields_are_preserved() {
        let mut headers = EnvelopeHeaders::default();
        headers
            .extra
            .insert("dsn".to_string(), serde_json::json!("https://k@h/1"));
        let envelope = Envelope::new(headers).with_item(EnvelopeItem::new(
            ItemType::Session,
            None,
            b"{}".to_vec(),
        ));
        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(
            parsed.headers().extra.get("dsn"),
            Some(&serde_json::json!("https://k@h/1"))
        );
    }

    #[test]
    fn categories_are_distinct_and_ordered() {
        let envelope = Envelope::new(EnvelopeHeaders::default())
            .with_item(EnvelopeItem::new(ItemType::Event, None, b"{}".to_vec()))
            .with_item(EnvelopeItem::new(ItemType::Session, None, b"{}".to_vec()))
            .with_item(EnvelopeItem::new(ItemType::Event, None, b"{}".to_vec()));
        assert_eq!(envelope.categories(), vec![Category::Error, Category::Session]);
    }

    #[test]
    fn filtered_drops_only_matching_items() {
        let envelope = Envelope::new(EnvelopeHeaders::default())
            .with_item(EnvelopeItem::new(ItemType::Event, None, b"{}".to_vec()))
            .with_item(EnvelopeItem::new(ItemType::Session, None, b"{}".to_vec()));

        let kept = envelope
            .filtered(|category| category != Category::Error)
            .unwrap();
        assert_eq!(kept.items().len(), 1);
        assert_eq!(kept.items()[0].item_type(), &ItemType::Session);

        assert!(envelope.filtered(|_| false).is_none());
    }
}
