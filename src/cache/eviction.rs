// Eviction planning. Pure over a snapshot of the index so it can run without
// holding the index lock while files are deleted.

use chrono::{DateTime, Utc};

use super::entry::CacheEntry;

/// Choose the entries to delete.
///
/// Pass one takes every entry idle for longer than `expiration_days`. Pass two
/// walks the rest least-recently then least-frequently used first, stopping once
/// the bytes freed by both passes reach `target_bytes`.
pub fn plan_eviction(
    entries: &[CacheEntry],
    target_bytes: u64,
    expiration_days: u32,
    now: DateTime<Utc>,
) -> Vec<CacheEntry> {
    let (mut plan, mut rest): (Vec<CacheEntry>, Vec<CacheEntry>) = entries
        .iter()
        .cloned()
        .partition(|e| e.idle_days(now) > i64::from(expiration_days));

    let mut freed: u64 = plan.iter().map(|e| e.size).sum();

    rest.sort_by(|a, b| {
        a.last_access_time
            .cmp(&b.last_access_time)
            .then(a.access_count.cmp(&b.access_count))
            .then_with(|| a.file_name.cmp(&b.file_name))
    });

    for entry in rest {
        if freed >= target_bytes {
            break;
        }
        freed += entry.size;
        plan.push(entry);
    }
    plan
}

/// Default amount to free when no explicit target is given.
pub fn default_target(max_size: u64, cleanup_threshold: f64, factor: f64) -> u64 {
    let share = (1.0 - cleanup_threshold * factor).clamp(0.0, 1.0);
    (max_size as f64 * share).round() as u64
}
