use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::BundleInfo;

/// One bundle file known to be present in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub file_name: String,
    pub hash: String,
    pub size: u64,
    pub last_access_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub access_count: u32,
}

impl CacheEntry {
    pub fn from_bundle(info: &BundleInfo, now: DateTime<Utc>) -> Self {
        Self {
            file_name: info.file_name(),
            hash: info.hash.clone(),
            size: info.size,
            last_access_time: now,
            create_time: now,
            access_count: 1,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_access_time = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Whole days since the entry was last accessed.
    pub fn idle_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_access_time).num_days()
    }
}

/// Aggregate view of the cache returned by [`super::CacheIndex::statistics`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatistics {
    pub total_size: u64,
    pub entry_count: usize,
    pub max_size: u64,
    pub oldest_access_time: Option<DateTime<Utc>>,
    pub newest_access_time: Option<DateTime<Utc>>,
}

impl CacheStatistics {
    pub fn usage_ratio(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.total_size as f64 / self.max_size as f64
        }
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
}
