//! Cache statistics

use serde::{Deserialize, Serialize};

/// Process-wide counters, persisted as a singleton record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub total_hits: u64,
    pub total_misses: u64,
    /// Milliseconds since epoch of the last cleanup sweep
    pub last_cleanup_at: Option<i64>,
}

impl StatsRecord {
    /// Fraction of lookups that hit, zero before any lookup
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.total_hits.saturating_add(self.total_misses);
        if lookups == 0 {
            return 0.0;
        }
        self.total_hits as f64 / lookups as f64
    }

    /// Total lookups recorded
    #[must_use]
    pub const fn lookups(&self) -> u64 {
        self.total_hits.saturating_add(self.total_misses)
    }
}

/// One row of the most-used listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrequentEntry {
    pub text: String,
    pub access_count: u64,
    pub last_accessed_at: i64,
}

/// Snapshot returned to dashboards
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    pub hit_rate: f64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub last_cleanup_at: Option<i64>,
    pub top: Vec<FrequentEntry>,
}
