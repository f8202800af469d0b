//! Response cache
//!
//! Maps spoken text to previously synthesized audio so repeated responses
//! skip re-synthesis. Bounded by entry count and aggregate byte size with
//! LRU eviction, swept periodically for old entries that were rarely used,
//! and optionally backed by a durable store.
//!
//! Every operation runs under one lock, so statistics updates and eviction
//! never interleave with each other. Durable-store failures are logged and
//! the in-memory view carries on.

mod backend;
mod entry;
pub mod eviction;
mod key;
mod stats;

pub use backend::CacheBackend;
pub use entry::{AudioHandle, CachedAudio, EntryRecord, StoreReport};
pub use eviction::{EvictionPlan, Limits};
pub use key::{normalize, text_hash};
pub use stats::{CacheStats, FrequentEntry, StatsRecord};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::engine::Synthesizer;

use self::entry::CacheEntry;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    stats: StatsRecord,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry) {
        self.total_bytes += entry.record.byte_size;
        if let Some(old) = self.entries.insert(entry.record.text_hash.clone(), entry) {
            self.total_bytes -= old.record.byte_size;
        }
    }

    fn remove(&mut self, text_hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(text_hash)?;
        self.total_bytes -= entry.record.byte_size;
        Some(entry)
    }
}

/// Text-to-audio response cache
pub struct ResponseCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    backend: Option<Arc<dyn CacheBackend>>,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("persistent", &self.backend.is_some())
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Create a cache with no durable store
    #[must_use]
    pub fn in_memory(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            backend: None,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Open a cache over a durable store
    ///
    /// Entry metadata is loaded eagerly; payloads are read on first hit.
    /// If the store cannot be read the cache starts empty.
    #[must_use]
    pub fn open(config: CacheConfig, clock: Arc<dyn Clock>, backend: Arc<dyn CacheBackend>) -> Self {
        let mut state = CacheState::default();

        match backend.list_all() {
            Ok(records) => {
                for record in records {
                    state.insert(CacheEntry::new(record, None));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load cache entries, starting empty");
            }
        }

        match backend.load_stats() {
            Ok(Some(stats)) => state.stats = stats,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load cache statistics"),
        }

        tracing::info!(
            entries = state.entries.len(),
            bytes = state.total_bytes,
            "response cache opened"
        );

        let cache = Self {
            config,
            clock,
            backend: Some(backend),
            state: Mutex::new(state),
        };

        // Ceilings may have shrunk since the store was written
        let mut state = cache.lock();
        cache.evict(&mut state);
        drop(state);

        cache
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    const fn limits(&self) -> Limits {
        Limits {
            max_entries: self.config.max_entries,
            max_bytes: self.config.max_size_bytes(),
        }
    }

    /// Store synthesized audio for `text`, replacing any previous entry
    ///
    /// Runs the eviction check afterwards.
    pub fn store(&self, text: &str, audio: Vec<u8>) -> StoreReport {
        let text_hash = text_hash(text);
        let now = self.clock.now_ms();
        let payload: Arc<[u8]> = Arc::from(audio);

        let record = EntryRecord {
            text_hash: text_hash.clone(),
            source_text: text.to_string(),
            byte_size: payload.len() as u64,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
        };

        let mut state = self.lock();

        if let Some(backend) = &self.backend
            && let Err(e) = backend.put(&record, &payload)
        {
            tracing::warn!(error = %e, text_hash, "failed to persist cache entry");
        }

        tracing::debug!(text_hash, bytes = record.byte_size, "cache store");
        state.insert(CacheEntry::new(record, Some(payload)));

        let evicted = self.evict(&mut state);
        StoreReport { text_hash, evicted }
    }

    /// Look up cached audio for `text`
    ///
    /// A hit refreshes the entry's recency and access count.
    pub fn get(&self, text: &str) -> Option<CachedAudio> {
        let text_hash = text_hash(text);
        let now = self.clock.now_ms();
        let mut state = self.lock();

        let resident = state.entries.get(&text_hash).map(|e| e.payload.clone());
        let payload = match resident {
            None => {
                state.stats.total_misses += 1;
                tracing::trace!(text_hash, "cache miss");
                return None;
            }
            Some(Some(payload)) => payload,
            Some(None) => {
                let Some(payload) = self.load_payload(&text_hash) else {
                    // Index entry without a readable payload is unusable
                    state.remove(&text_hash);
                    state.stats.total_misses += 1;
                    return None;
                };
                payload
            }
        };

        let CacheState { entries, stats, .. } = &mut *state;
        let entry = entries.get_mut(&text_hash)?;
        if entry.payload.is_none() {
            entry.payload = Some(Arc::clone(&payload));
        }
        entry.touch(now);
        stats.total_hits += 1;

        let access_count = entry.record.access_count;
        if let Some(backend) = &self.backend
            && let Err(e) = backend.touch(&text_hash, now, access_count)
        {
            tracing::warn!(error = %e, text_hash, "failed to persist cache access");
        }

        tracing::trace!(text_hash, access_count, "cache hit");
        Some(CachedAudio {
            handle: AudioHandle::new(&payload),
            text_hash,
            bytes: payload,
            access_count,
        })
    }

    fn load_payload(&self, text_hash: &str) -> Option<Arc<[u8]>> {
        let backend = self.backend.as_ref()?;
        match backend.audio(text_hash) {
            Ok(Some(bytes)) => Some(Arc::from(bytes)),
            Ok(None) => {
                tracing::warn!(text_hash, "cache payload missing from store");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, text_hash, "failed to load cache payload");
                None
            }
        }
    }

    /// Whether `text` is cached, without touching statistics
    #[must_use]
    pub fn has(&self, text: &str) -> bool {
        self.lock().entries.contains_key(&text_hash(text))
    }

    /// Remove the entry for `text`
    pub fn remove(&self, text: &str) -> bool {
        let text_hash = text_hash(text);
        let mut state = self.lock();
        let removed = state.remove(&text_hash).is_some();
        if removed {
            self.delete_persisted(&text_hash);
        }
        removed
    }

    /// Drop every entry and reset statistics
    pub fn clear(&self) {
        let mut state = self.lock();
        let count = state.entries.len();

        state.entries.clear();
        state.total_bytes = 0;
        state.stats = StatsRecord {
            total_hits: 0,
            total_misses: 0,
            last_cleanup_at: Some(self.clock.now_ms()),
        };

        if let Some(backend) = &self.backend {
            if let Err(e) = backend.clear() {
                tracing::warn!(error = %e, "failed to clear persisted cache");
            }
            if let Err(e) = backend.save_stats(&state.stats) {
                tracing::warn!(error = %e, "failed to persist cache statistics");
            }
        }

        tracing::info!(count, "cache cleared");
    }

    /// Remove entries that are both old and rarely used
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let max_age = i64::try_from(self.config.cleanup_max_age.as_millis()).unwrap_or(i64::MAX);
        let min_access = self.config.cleanup_min_access;

        let mut state = self.lock();
        let stale: Vec<String> = state
            .entries
            .values()
            .filter(|e| {
                now.saturating_sub(e.record.created_at) > max_age
                    && e.record.access_count < min_access
            })
            .map(|e| e.record.text_hash.clone())
            .collect();

        for text_hash in &stale {
            state.remove(text_hash);
            self.delete_persisted(text_hash);
        }

        state.stats.last_cleanup_at = Some(now);
        self.save_stats(&state.stats);

        tracing::info!(
            removed = stale.len(),
            remaining = state.entries.len(),
            "cache cleanup complete"
        );
        stale.len()
    }

    /// Evict until the store fits its ceilings; returns the count removed
    fn evict(&self, state: &mut CacheState) -> usize {
        let limits = self.limits();
        let plan = eviction::plan(state.entries.values().map(|e| &e.record), limits);
        if plan.is_empty() {
            return 0;
        }

        let count_before = state.entries.len();
        for text_hash in &plan.victims {
            // Dropping the entry releases the payload before the record goes
            state.remove(text_hash);
            self.delete_persisted(text_hash);
        }

        if let Err(e) = eviction::verify(
            &plan,
            count_before,
            state.entries.len(),
            state.total_bytes,
            limits,
        ) {
            tracing::error!(error = %e, "cache eviction invariant violated");
            debug_assert!(false, "{e}");
        }

        tracing::debug!(
            evicted = plan.victims.len(),
            count_excess = plan.count_excess,
            size_batches = plan.size_batches.len(),
            "cache eviction"
        );
        plan.victims.len()
    }

    fn delete_persisted(&self, text_hash: &str) {
        if let Some(backend) = &self.backend
            && let Err(e) = backend.delete(text_hash)
        {
            tracing::warn!(error = %e, text_hash, "failed to delete persisted cache entry");
        }
    }

    fn save_stats(&self, stats: &StatsRecord) {
        if let Some(backend) = &self.backend
            && let Err(e) = backend.save_stats(stats)
        {
            tracing::warn!(error = %e, "failed to persist cache statistics");
        }
    }

    /// Persist the statistics record
    pub fn flush(&self) {
        let state = self.lock();
        self.save_stats(&state.stats);
    }

    /// Most-used entries, highest access count first
    #[must_use]
    pub fn frequent(&self, n: usize) -> Vec<FrequentEntry> {
        top_entries(&self.lock(), n)
    }

    /// Snapshot of size, hit rate and most-used entries
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entry_count: state.entries.len(),
            total_size_bytes: state.total_bytes,
            hit_rate: state.stats.hit_rate(),
            total_hits: state.stats.total_hits,
            total_misses: state.stats.total_misses,
            last_cleanup_at: state.stats.last_cleanup_at,
            top: top_entries(&state, self.config.top_n),
        }
    }

    /// Fraction of lookups that hit
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        self.lock().stats.hit_rate()
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Aggregate payload size in bytes
    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// Metadata of the entry for `text`, without touching statistics
    #[must_use]
    pub fn peek(&self, text: &str) -> Option<EntryRecord> {
        self.lock()
            .entries
            .get(&text_hash(text))
            .map(|e| e.record.clone())
    }

    /// Warm the cache with common responses
    ///
    /// Texts already cached are skipped; synthesis failures are logged and
    /// skipped. Returns the number of entries stored.
    pub async fn preload<I, S>(&self, texts: I, synthesizer: &dyn Synthesizer) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stored = 0;
        for text in texts {
            let text = text.as_ref();
            if self.has(text) {
                continue;
            }
            match synthesizer.synthesize(text).await {
                Ok(audio) => {
                    self.store(text, audio);
                    stored += 1;
                }
                Err(e) => tracing::warn!(error = %e, text, "preload synthesis failed"),
            }
        }
        tracing::debug!(stored, "cache preload complete");
        stored
    }
}

fn top_entries(state: &CacheState, n: usize) -> Vec<FrequentEntry> {
    let mut records: Vec<&EntryRecord> = state.entries.values().map(|e| &e.record).collect();
    records.sort_by(|a, b| {
        b.access_count
            .cmp(&a.access_count)
            .then(b.last_accessed_at.cmp(&a.last_accessed_at))
    });

    records
        .into_iter()
        .take(n)
        .map(|r| FrequentEntry {
            text: r.source_text.clone(),
            access_count: r.access_count,
            last_accessed_at: r.last_accessed_at,
        })
        .collect()
}
