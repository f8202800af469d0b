//! Cache entries and playback handles

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

/// Persisted metadata for one cached synthesis result
///
/// This is everything the durable store keeps apart from the audio payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Fingerprint of the normalized source text
    pub text_hash: String,
    /// Original text, kept for diagnostics and frequency listings
    pub source_text: String,
    /// Payload size in bytes
    pub byte_size: u64,
    /// Milliseconds since epoch
    pub created_at: i64,
    /// Milliseconds since epoch
    pub last_accessed_at: i64,
    /// Successful lookups plus the initial store
    pub access_count: u64,
}

/// In-memory entry: metadata plus a lazily materialized payload
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub record: EntryRecord,
    /// `None` until first hit after loading from the durable store
    pub payload: Option<Arc<[u8]>>,
}

impl CacheEntry {
    pub const fn new(record: EntryRecord, payload: Option<Arc<[u8]>>) -> Self {
        Self { record, payload }
    }

    pub const fn touch(&mut self, now: i64) {
        self.record.last_accessed_at = now;
        self.record.access_count = self.record.access_count.saturating_add(1);
    }
}

/// Weak playback handle to a cached payload
///
/// The cache holds the only long-lived strong reference. Once the entry is
/// evicted or cleared, `upgrade` returns `None` as soon as outstanding
/// [`CachedAudio`] values are dropped.
#[derive(Debug, Clone)]
pub struct AudioHandle(Weak<[u8]>);

impl AudioHandle {
    pub(crate) fn new(payload: &Arc<[u8]>) -> Self {
        Self(Arc::downgrade(payload))
    }

    /// Get the payload if it is still backed by the cache
    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<[u8]>> {
        self.0.upgrade()
    }

    /// Whether the backing payload has been released
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// Result of a cache hit
#[derive(Debug, Clone)]
pub struct CachedAudio {
    /// Key of the entry
    pub text_hash: String,
    /// Audio payload
    pub bytes: Arc<[u8]>,
    /// Playback handle, revoked on eviction
    pub handle: AudioHandle,
    /// Access count after this lookup
    pub access_count: u64,
}

/// Outcome of a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    /// Key of the stored entry
    pub text_hash: String,
    /// Entries evicted by the post-store check
    pub evicted: usize,
}
