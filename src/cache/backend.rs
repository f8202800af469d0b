//! Durable storage boundary for the response cache

use crate::Result;

use super::entry::EntryRecord;
use super::stats::StatsRecord;

/// Durable key-value medium keyed by text hash
///
/// Implementations must be safe to share across threads; the cache
/// serializes all writers through its own lock.
pub trait CacheBackend: Send + Sync {
    /// Insert or replace an entry and its payload
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn put(&self, record: &EntryRecord, audio: &[u8]) -> Result<()>;

    /// Load the payload for an entry
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn audio(&self, text_hash: &str) -> Result<Option<Vec<u8>>>;

    /// Persist updated access metadata
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn touch(&self, text_hash: &str, last_accessed_at: i64, access_count: u64) -> Result<()>;

    /// Remove an entry
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn delete(&self, text_hash: &str) -> Result<()>;

    /// List every entry's metadata without payloads
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn list_all(&self) -> Result<Vec<EntryRecord>>;

    /// Remove every entry
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn clear(&self) -> Result<()>;

    /// Load the singleton statistics record
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn load_stats(&self) -> Result<Option<StatsRecord>>;

    /// Save the singleton statistics record
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn save_stats(&self, stats: &StatsRecord) -> Result<()>;
}
