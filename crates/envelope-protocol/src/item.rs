//! Single typed payload within an envelope.

use serde::{Deserialize, Serialize};

use crate::{EnvelopeResult, ItemType};

/// Wire form of an item header line.
///
/// `length` is always the exact payload byte count; it is computed at
/// serialization time, never caller-supplied.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ItemHeaderWire {
    #[serde(rename = "type")]
    pub item_type: String,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A single typed payload (event, session, transaction, attachment) inside
/// an [`Envelope`](crate::Envelope).
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeItem {
    item_type: ItemType,
    content_type: Option<String>,
    payload: Vec<u8>,
}

impl EnvelopeItem {
    /// Create an item from raw payload bytes.
    pub fn new(item_type: ItemType, content_type: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            item_type,
            content_type,
            payload,
        }
    }

    /// Create a JSON item by serializing `payload`.
    pub fn from_json<T: Serialize>(item_type: ItemType, payload: &T) -> EnvelopeResult<Self> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(Self::new(
            item_type,
            Some("application/json".to_string()),
            bytes,
        ))
    }

    /// The item's type discriminator.
    pub fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    /// Declared content type, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize the item header line plus payload into `out`.
    pub(crate) fn write_into(&self, out: &mut Vec<u8>) -> EnvelopeResult<()> {
        let header = ItemHeaderWire {
            item_type: self.item_type.as_str().to_string(),
            length: self.payload.len(),
            content_type: self.content_type.clone(),
        };
        serde_json::to_writer(&mut *out, &header)?;
        out.push(b'\n');
        out.extend_from_slice(&self.payload);
        out.push(b'\n');
        Ok(())
    }

    pub(crate) fn from_wire(header: ItemHeaderWire, payload: Vec<u8>) -> Self {
        Self {
            item_type: ItemType::from_name(&header.item_type),
            content_type: header.content_type,
            payload,
        }
    }
}
