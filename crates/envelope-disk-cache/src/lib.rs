//! Durable on-disk spillover cache for undelivered envelopes.
//!
//! Each cached envelope is one file in the cache directory, named
//! `{unix_millis:020}-{counter:06}.envelope` so lexicographic filename
//! order equals creation order (the zero-padded millisecond timestamp
//! dominates, the process-local counter breaks ties within a tick).
//!
//! Writes are atomic: content goes to a hidden temp file which is fsynced
//! and renamed into place, so a crash mid-write never leaves a partially
//! readable entry to poison replay. The sweep claims an entry by renaming
//! it to a `.sending` file before reading it, which keeps a concurrent
//! sweep or delete from ever seeing the same entry twice. Foreign files in
//! the directory are ignored.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use envelope_protocol::{Envelope, EnvelopeError};
use thiserror::Error;
use tracing::{debug, warn};

/// Extension of a pending cache entry.
const ENTRY_EXT: &str = "envelope";
/// Extension of an entry claimed by an in-flight send.
const CLAIMED_EXT: &str = "sending";

/// Error produced by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache directory cannot be created or written; callers should
    /// fall back to a direct send without caching.
    #[error("cache unavailable: {0}")]
    Unavailable(#[source] io::Error),

    /// The entry no longer exists (deleted or claimed concurrently).
    #[error("cache entry not found: {0}")]
    NotFound(String),

    /// A cached entry could not be parsed back into an envelope.
    #[error("corrupt cache entry {key}: {source}")]
    Corrupt {
        /// Key of the unreadable entry.
        key: String,
        /// Underlying parse failure.
        #[source]
        source: EnvelopeError,
    },

    /// Other filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Handle to one cached envelope, ordered by creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    stem: String,
}

impl CacheKey {
    /// Stable identifier (the filename without extension).
    pub fn as_str(&self) -> &str {
        &self.stem
    }

    /// Parse a directory entry stem, rejecting foreign names.
    fn parse(stem: &str) -> Option<CacheKey> {
        let (millis, counter) = stem.split_once('-')?;
        if millis.len() == 20
            && counter.len() == 6
            && millis.bytes().all(|b| b.is_ascii_digit())
            && counter.bytes().all(|b| b.is_ascii_digit())
        {
            Some(CacheKey {
                stem: stem.to_string(),
            })
        } else {
            None
        }
    }
}

/// An entry claimed for sending: invisible to enumeration until released.
#[derive(Debug)]
pub struct ClaimedEnvelope {
    key: CacheKey,
    envelope: Envelope,
}

impl ClaimedEnvelope {
    /// Key of the claimed entry.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The recovered envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Consume the claim, returning the envelope.
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

/// Append-only directory of serialized envelopes, bounded by entry count.
#[derive(Debug)]
pub struct EnvelopeCache {
    dir: PathBuf,
    max_entries: usize,
    counter: AtomicU64,
}

impl EnvelopeCache {
    /// Open (creating if needed) the cache directory.
    ///
    /// Leftovers from a crashed process are recovered: claimed `.sending`
    /// entries are renamed back into pending entries, abandoned temp files
    /// are removed.
    pub fn open(dir: impl Into<PathBuf>, max_entries: usize) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(CacheError::Unavailable)?;

        let cache = Self {
            dir,
            max_entries,
            counter: AtomicU64::new(0),
        };
        cache.recover_leftovers()?;
        Ok(cache)
    }

    /// Directory this cache writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an envelope, pruning oldest entries first when at capacity.
    pub fn persist(&self, envelope: &Envelope) -> CacheResult<CacheKey> {
        let bytes = envelope
            .to_bytes()
            .map_err(|e| CacheError::Unavailable(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        self.prune_for_insert()?;

        let key = self.next_key();
        self.atomic_write(&self.entry_path(&key), &bytes)
            .map_err(CacheError::Unavailable)?;
        debug!(key = %key.as_str(), bytes = bytes.len(), "cached envelope");
        Ok(key)
    }

    /// Persist an envelope directly in the claimed state.
    ///
    /// Used by the live-send path: the entry is on disk (crash safe) but
    /// invisible to a concurrent sweep while the send is in flight. Release
    /// it on a retryable outcome, discard it on a terminal one.
    pub fn persist_claimed(&self, envelope: &Envelope) -> CacheResult<ClaimedEnvelope> {
        let bytes = envelope
            .to_bytes()
            .map_err(|e| CacheError::Unavailable(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        self.prune_for_insert()?;

        let key = self.next_key();
        self.atomic_write(&self.claimed_path(&key), &bytes)
            .map_err(CacheError::Unavailable)?;
        debug!(key = %key.as_str(), bytes = bytes.len(), "cached in-flight envelope");
        Ok(ClaimedEnvelope {
            key,
            envelope: envelope.clone(),
        })
    }

    /// Pending entries, oldest first. Claimed entries are not listed.
    pub fn enumerate(&self) -> CacheResult<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match CacheKey::parse(stem) {
                Some(key) => keys.push(key),
                None => debug!(file = %path.display(), "ignoring foreign file in cache dir"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Number of pending entries.
    pub fn len(&self) -> CacheResult<usize> {
        Ok(self.enumerate()?.len())
    }

    /// True when no pending entries exist.
    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.enumerate()?.is_empty())
    }

    /// Read a pending entry back into an envelope without claiming it.
    pub fn load(&self, key: &CacheKey) -> CacheResult<Envelope> {
        let bytes = match fs::read(self.entry_path(key)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(key.as_str().to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Envelope::from_bytes(&bytes).map_err(|source| CacheError::Corrupt {
            key: key.as_str().to_string(),
            source,
        })
    }

    /// Delete a pending entry. Missing entries are not an error.
    pub fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Claim a pending entry for an in-flight send.
    ///
    /// The rename makes the entry invisible to concurrent enumeration, so
    /// an envelope is never handed to two senders. Fails with
    /// [`CacheError::NotFound`] if the entry was deleted or claimed first.
    pub fn claim(&self, key: &CacheKey) -> CacheResult<ClaimedEnvelope> {
        let claimed_path = self.claimed_path(key);
        match fs::rename(self.entry_path(key), &claimed_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(key.as_str().to_string()))
            }
            Err(err) => return Err(err.into()),
        }

        let bytes = fs::read(&claimed_path)?;
        match Envelope::from_bytes(&bytes) {
            Ok(envelope) => Ok(ClaimedEnvelope {
                key: key.clone(),
                envelope,
            }),
            Err(source) => {
                // A corrupt entry can never replay; drop it rather than
                // letting it wedge every future sweep.
                warn!(key = %key.as_str(), error = %source, "removing corrupt cache entry");
                let _ = fs::remove_file(&claimed_path);
                Err(CacheError::Corrupt {
                    key: key.as_str().to_string(),
                    source,
                })
            }
        }
    }

    /// Return a claimed entry to pending after a retryable failure.
    pub fn release(&self, claimed: &ClaimedEnvelope) -> CacheResult<()> {
        fs::rename(
            self.claimed_path(&claimed.key),
            self.entry_path(&claimed.key),
        )?;
        Ok(())
    }

    /// Remove a claimed entry after a terminal outcome.
    pub fn discard(&self, claimed: &ClaimedEnvelope) -> CacheResult<()> {
        match fs::remove_file(self.claimed_path(&claimed.key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXT}", key.stem))
    }

    fn claimed_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{CLAIMED_EXT}", key.stem))
    }

    fn next_key(&self) -> CacheKey {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        CacheKey {
            stem: format!("{millis:020}-{counter:06}"),
        }
    }

    /// Make room so that after one insert the entry count stays within
    /// `max_entries`. Oldest entries go first: bounded disk usage wins
    /// over completeness.
    fn prune_for_insert(&self) -> CacheResult<()> {
        if self.max_entries == 0 {
            return Ok(());
        }
        let keys = self.enumerate()?;
        if keys.len() < self.max_entries {
            return Ok(());
        }
        let excess = keys.len() - self.max_entries + 1;
        for key in keys.iter().take(excess) {
            warn!(key = %key.as_str(), "cache full, evicting oldest envelope");
            self.delete(key)?;
        }
        Ok(())
    }

    fn recover_leftovers(&self) -> CacheResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            let stem = path.file_stem().and_then(|s| s.to_str());

            if ext == Some(CLAIMED_EXT) {
                if let Some(key) = stem.and_then(CacheKey::parse) {
                    debug!(key = %key.as_str(), "recovering claimed entry from previous run");
                    fs::rename(&path, self.entry_path(&key))?;
                }
            } else if stem.is_some_and(|s| s.starts_with('.')) && ext == Some("tmp") {
                debug!(file = %path.display(), "removing abandoned temp file");
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Write `bytes` to `path` atomically: temp file, fsync, rename, then
    /// fsync the directory so the rename itself is durable.
    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid entry name"))?;
        let tmp_path = self.dir.join(format!(
            ".{file_name}.{}.tmp",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));

        let write_result = (|| -> io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)?;

            if let Ok(dir) = fs::File::open(&self.dir) {
                let _ = dir.sync_all();
            }
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}
