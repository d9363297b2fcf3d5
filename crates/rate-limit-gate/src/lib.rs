//! Server-driven rate-limit windows, tracked per telemetry category.
//!
//! The ingestion endpoint signals limits through the structured
//! `X-Telemetry-Rate-Limits` response header: comma-separated entries of
//! `retry_after_secs:category;category;...:reason`. An empty category list
//! applies to every category. When only a plain `Retry-After` accompanies a
//! 429, the window applies to [`Category::All`].
//!
//! Windows only ever widen: a later update for the same category keeps the
//! later expiry. Expired entries are treated as absent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use envelope_protocol::Category;
use tracing::debug;

/// Name of the structured rate-limit response header.
pub const RATE_LIMITS_HEADER: &str = "x-telemetry-rate-limits";

/// Name of the plain retry-after fallback header.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Tracks per-category retry-after windows parsed from server responses.
///
/// Updates are rare (one per rate-limited response) while reads happen
/// before every send, so a plain mutex around the map is sufficient.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<Category, Instant>>,
}

impl RateLimiter {
    /// Create a limiter with no active windows.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `category` or [`Category::All`] has a non-expired window.
    pub fn is_limited(&self, category: Category) -> bool {
        self.is_limited_at(category, Instant::now())
    }

    /// Like [`RateLimiter::is_limited`] with an explicit clock reading, so
    /// both lookups observe the same instant.
    pub fn is_limited_at(&self, category: Category, now: Instant) -> bool {
        let windows = self.windows.lock().expect("lock poisoned");
        let active = |cat: &Category| windows.get(cat).is_some_and(|expiry| *expiry > now);
        active(&Category::All) || active(&category)
    }

    /// Remaining wait until no category is limited. `None` when idle.
    pub fn longest_wait(&self) -> Option<Duration> {
        let now = Instant::now();
        let windows = self.windows.lock().expect("lock poisoned");
        windows
            .values()
            .filter_map(|expiry| expiry.checked_duration_since(now))
            .max()
    }

    /// Apply rate-limit information from a server response.
    ///
    /// `rate_limits` is the structured header value, `retry_after` the plain
    /// fallback; either may be absent. The fallback is only honored on a
    /// 429 status.
    pub fn update(&self, status: u16, rate_limits: Option<&str>, retry_after: Option<&str>) {
        let now = Instant::now();
        if let Some(header) = rate_limits {
            self.apply_structured(header, now);
        } else if status == 429 {
            if let Some(seconds) = retry_after.and_then(parse_seconds) {
                self.widen(Category::All, now + seconds);
                debug!(retry_after_secs = seconds.as_secs(), "rate limited (all categories)");
            }
        }
    }

    fn apply_structured(&self, header: &str, now: Instant) {
        for entry in header.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut fields = entry.split(':');
            let Some(seconds) = fields.next().and_then(parse_seconds) else {
                debug!(entry, "skipping malformed rate-limit entry");
                continue;
            };
            let expiry = now + seconds;

            let categories = fields.next().unwrap_or("");
            if categories.is_empty() {
                self.widen(Category::All, expiry);
                continue;
            }
            for name in categories.split(';') {
                match Category::from_name(name.trim()) {
                    Some(category) => self.widen(category, expiry),
                    None => debug!(category = name, "ignoring unknown rate-limit category"),
                }
            }
        }
    }

    /// Set the window for `category`, keeping the later expiry if one exists.
    fn widen(&self, category: Category, expiry: Instant) {
        let mut windows = self.windows.lock().expect("lock poisoned");
        let slot = windows.entry(category).or_insert(expiry);
        if expiry > *slot {
            *slot = expiry;
        }
    }
}

/// Parse a non-negative whole-second retry-after value.
fn parse_seconds(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
