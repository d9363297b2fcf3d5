//! Item types and rate-limit categories.

use std::fmt;

/// Type discriminator of a single envelope item.
///
/// The closed set covers everything the pipeline produces today; unknown
/// discriminators round-trip through [`ItemType::Other`] so a newer peer's
/// envelopes survive caching and replay unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// An error event payload.
    Event,
    /// A session lifecycle update.
    Session,
    /// A performance transaction.
    Transaction,
    /// A binary attachment.
    Attachment,
    /// Unrecognized item type, preserved verbatim.
    Other(String),
}

impl ItemType {
    /// Wire name used in the item header `type` field.
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::Event => "event",
            ItemType::Session => "session",
            ItemType::Transaction => "transaction",
            ItemType::Attachment => "attachment",
            ItemType::Other(name) => name,
        }
    }

    /// Parse a wire name back into an item type.
    pub fn from_name(name: &str) -> Self {
        match name {
            "event" => ItemType::Event,
            "session" => ItemType::Session,
            "transaction" => ItemType::Transaction,
            "attachment" => ItemType::Attachment,
            other => ItemType::Other(other.to_string()),
        }
    }

    /// The rate-limit category this item counts against.
    pub fn category(&self) -> Category {
        match self {
            ItemType::Event => Category::Error,
            ItemType::Session => Category::Session,
            ItemType::Transaction => Category::Transaction,
            ItemType::Attachment => Category::Attachment,
            ItemType::Other(_) => Category::Default,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of telemetry used for independent rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Applies to every category.
    All,
    /// Items without a more specific category.
    Default,
    /// Error events.
    Error,
    /// Session updates.
    Session,
    /// Performance transactions.
    Transaction,
    /// Attachments.
    Attachment,
}

impl Category {
    /// Parse a category name from a rate-limit header entry.
    ///
    /// Returns `None` for names this client does not track; unknown
    /// categories in a server response are ignored rather than widened
    /// into `All`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Category::Default),
            "error" => Some(Category::Error),
            "session" => Some(Category::Session),
            "transaction" => Some(Category::Transaction),
            "attachment" => Some(Category::Attachment),
            _ => None,
        }
    }

    /// Header name for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::All => "all",
            Category::Default => "default",
            Category::Error => "error",
            Category::Session => "session",
            Category::Transaction => "transaction",
            Category::Attachment => "attachment",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
