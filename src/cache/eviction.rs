//! Size and count bounded eviction
//!
//! Victims are chosen least-recently-used first, ties broken by the lowest
//! access count. Recency dominates; frequency only orders equal timestamps.

use std::cmp::Ordering;

use crate::{Error, Result};

use super::entry::EntryRecord;

/// Ceilings the store must respect after every write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_entries: usize,
    pub max_bytes: u64,
}

/// Entries chosen for removal and why
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Keys to remove, in eviction order
    pub victims: Vec<String>,
    /// Victims removed because the entry count exceeded its ceiling
    pub count_excess: usize,
    /// Sizes of the 20% batches removed because the byte ceiling was exceeded
    pub size_batches: Vec<usize>,
}

impl EvictionPlan {
    /// Whether nothing needs to be removed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Compare two entries in eviction order
#[must_use]
pub fn eviction_order(a: &EntryRecord, b: &EntryRecord) -> Ordering {
    a.last_accessed_at
        .cmp(&b.last_accessed_at)
        .then(a.access_count.cmp(&b.access_count))
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.text_hash.cmp(&b.text_hash))
}

/// Number of entries in one size-triggered batch: `ceil(20% of n)`
#[must_use]
pub const fn size_batch(n: usize) -> usize {
    n.div_ceil(5)
}

/// Decide which entries to evict so the store fits `limits`
///
/// The count check removes exactly the excess. If the aggregate size is
/// still above the byte ceiling, whole 20% batches of the remaining store
/// are removed until it fits.
#[must_use]
pub fn plan<'a, I>(entries: I, limits: Limits) -> EvictionPlan
where
    I: IntoIterator<Item = &'a EntryRecord>,
{
    let mut order: Vec<&EntryRecord> = entries.into_iter().collect();
    order.sort_by(|a, b| eviction_order(a, b));

    let mut total: u64 = order.iter().map(|e| e.byte_size).sum();
    let mut plan = EvictionPlan::default();
    let mut cursor = 0;

    if order.len() > limits.max_entries {
        let excess = order.len() - limits.max_entries;
        for entry in &order[..excess] {
            total -= entry.byte_size;
            plan.victims.push(entry.text_hash.clone());
        }
        plan.count_excess = excess;
        cursor = excess;
    }

    while total > limits.max_bytes && cursor < order.len() {
        let batch = size_batch(order.len() - cursor);
        let end = (cursor + batch).min(order.len());
        for entry in &order[cursor..end] {
            total -= entry.byte_size;
            plan.victims.push(entry.text_hash.clone());
        }
        plan.size_batches.push(end - cursor);
        cursor = end;
    }

    plan
}

/// Check a store snapshot against the plan that produced it
///
/// # Errors
///
/// Returns `Error::EvictionInvariant` if the store still exceeds a ceiling
/// or if a count-only eviction removed anything but the exact excess.
pub fn verify(
    plan: &EvictionPlan,
    count_before: usize,
    count_after: usize,
    bytes_after: u64,
    limits: Limits,
) -> Result<()> {
    if count_after > limits.max_entries {
        return Err(Error::EvictionInvariant(format!(
            "{count_after} entries remain, ceiling is {}",
            limits.max_entries
        )));
    }
    if bytes_after > limits.max_bytes {
        return Err(Error::EvictionInvariant(format!(
            "{bytes_after} bytes remain, ceiling is {}",
            limits.max_bytes
        )));
    }
    let removed = count_before.saturating_sub(count_after);
    if removed != plan.victims.len() {
        return Err(Error::EvictionInvariant(format!(
            "planned {} removals, store shrank by {removed}",
            plan.victims.len()
        )));
    }
    if plan.size_batches.is_empty() && removed != count_before.saturating_sub(limits.max_entries) {
        return Err(Error::EvictionInvariant(format!(
            "count eviction removed {removed}, excess was {}",
            count_before.saturating_sub(limits.max_entries)
        )));
    }
    Ok(())
}
