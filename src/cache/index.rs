// Durable index of the bundle files present in the cache directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheStatistics, CleanupReport};
use super::eviction::{default_target, plan_eviction};
use crate::config::{EngineConfig, CACHE_INDEX_FILE_NAME, CLEANUP_TARGET_FACTOR};
use crate::error::{AssetError, Result};
use crate::manifest::{BundleInfo, BundleManifest};

/// Size budget and cleanup settings of a [`CacheIndex`].
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub max_size: u64,
    pub cleanup_threshold: f64,
    pub expiration_days: u32,
    pub auto_cleanup: bool,
}

impl CachePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_size: config.max_cache_size,
            cleanup_threshold: config.cleanup_threshold,
            expiration_days: config.cache_expiration_days,
            auto_cleanup: config.enable_auto_cleanup,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexDocument {
    #[serde(default)]
    entries: Vec<CacheEntry>,
    #[serde(default)]
    total_size: u64,
    last_update_time: Option<DateTime<Utc>>,
}

struct IndexState {
    entries: HashMap<String, CacheEntry>,
    total_size: u64,
    last_update_time: DateTime<Utc>,
}

impl IndexState {
    fn remove(&mut self, file_name: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(file_name)?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(entry)
    }
}

struct CacheInner {
    dir: PathBuf,
    index_path: PathBuf,
    policy: CachePolicy,
    state: Mutex<IndexState>,
    cleanup_running: AtomicBool,
}

/// Cheap to clone; every clone shares the same index.
#[derive(Clone)]
pub struct CacheIndex {
    inner: Arc<CacheInner>,
}

impl CacheIndex {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::open(config.persistent_dir(), CachePolicy::from_config(config))
    }

    /// Open the index stored in `dir`, creating the directory if needed.
    ///
    /// An unreadable index document is discarded. Entries whose file is missing
    /// or has the wrong size are pruned before the index is returned.
    pub fn open(dir: impl Into<PathBuf>, policy: CachePolicy) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(CACHE_INDEX_FILE_NAME);

        let entries = match read_document(&index_path) {
            Ok(Some(doc)) => doc.entries,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("cache index {} unreadable, starting empty: {}", index_path.display(), e);
                Vec::new()
            }
        };

        let index = Self {
            inner: Arc::new(CacheInner {
                dir,
                index_path,
                policy,
                state: Mutex::new(IndexState {
                    entries: HashMap::new(),
                    total_size: 0,
                    last_update_time: Utc::now(),
                }),
                cleanup_running: AtomicBool::new(false),
            }),
        };
        index.revalidate(entries);
        Ok(index)
    }

    fn revalidate(&self, entries: Vec<CacheEntry>) {
        let mut state = self.inner.state.lock();
        let mut pruned = 0usize;
        for entry in entries {
            let path = self.inner.dir.join(&entry.file_name);
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() == entry.size => {
                    state.total_size += entry.size;
                    state.entries.insert(entry.file_name.clone(), entry);
                }
                Ok(meta) => {
                    if meta.is_file() {
                        let _ = fs::remove_file(&path);
                    }
                    pruned += 1;
                }
                Err(_) => pruned += 1,
            }
        }
        if pruned > 0 {
            info!("cache index pruned {} stale entries", pruned);
        }
        self.persist(&mut state);
        debug!(
            "cache index ready entries={} total={}",
            state.entries.len(),
            state.total_size
        );
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    pub fn cache_path(&self, info: &BundleInfo) -> PathBuf {
        self.inner.dir.join(info.file_name())
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.inner.state.lock().entries.contains_key(file_name)
    }

    pub fn entry(&self, file_name: &str) -> Option<CacheEntry> {
        self.inner.state.lock().entries.get(file_name).cloned()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.state.lock().total_size
    }

    pub fn entry_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn usage_ratio(&self) -> f64 {
        let max = self.inner.policy.max_size;
        if max == 0 {
            return 0.0;
        }
        self.total_size() as f64 / max as f64
    }

    /// `true` when the bundle's file is indexed under the same hash and is on
    /// disk with the recorded size. A hit refreshes the access statistics; a
    /// stale entry is dropped.
    pub fn validate(&self, info: &BundleInfo) -> bool {
        let file_name = info.file_name();
        let mut state = self.inner.state.lock();

        let Some(entry) = state.entries.get(&file_name) else {
            return false;
        };

        let on_disk = fs::metadata(self.inner.dir.join(&file_name))
            .map(|m| m.is_file() && m.len() == entry.size)
            .unwrap_or(false);

        if entry.hash != info.hash || !on_disk {
            debug!("cache entry {} stale, dropping", file_name);
            state.remove(&file_name);
            self.persist(&mut state);
            return false;
        }

        let now = Utc::now();
        if let Some(entry) = state.entries.get_mut(&file_name) {
            entry.touch(now);
        }
        self.persist(&mut state);
        true
    }

    /// Record a bundle file that was just written into the cache directory.
    pub fn add(&self, info: &BundleInfo) {
        let now = Utc::now();
        let over_threshold = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let file_name = info.file_name();
            match state.entries.get_mut(&file_name) {
                Some(entry) => {
                    let old_size = entry.size;
                    entry.hash = info.hash.clone();
                    entry.size = info.size;
                    entry.touch(now);
                    state.total_size = state.total_size.saturating_sub(old_size) + info.size;
                }
                None => {
                    state
                        .entries
                        .insert(file_name, CacheEntry::from_bundle(info, now));
                    state.total_size += info.size;
                }
            }
            self.persist(state);
            let policy = &self.inner.policy;
            policy.max_size > 0
                && state.total_size as f64 / policy.max_size as f64 >= policy.cleanup_threshold
        };

        if over_threshold && self.inner.policy.auto_cleanup {
            self.schedule_cleanup();
        }
    }

    /// Drop the entry for `file_name`. The file itself is left alone.
    pub fn remove(&self, file_name: &str) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state.remove(file_name).is_some();
        if removed {
            self.persist(&mut state);
        }
        removed
    }

    pub fn statistics(&self) -> CacheStatistics {
        let state = self.inner.state.lock();
        CacheStatistics {
            total_size: state.total_size,
            entry_count: state.entries.len(),
            max_size: self.inner.policy.max_size,
            oldest_access_time: state.entries.values().map(|e| e.last_access_time).min(),
            newest_access_time: state.entries.values().map(|e| e.last_access_time).max(),
        }
    }

    /// Free at least `target_bytes` (or the configured default) plus every
    /// expired entry. Yields to the runtime after each file deletion.
    pub async fn cleanup(&self, target_bytes: Option<u64>) -> CleanupReport {
        let policy = &self.inner.policy;
        let target = target_bytes
            .filter(|t| *t > 0)
            .unwrap_or_else(|| {
                default_target(policy.max_size, policy.cleanup_threshold, CLEANUP_TARGET_FACTOR)
            });
        info!("cache cleanup started target={}", target);

        let plan = {
            let state = self.inner.state.lock();
            let snapshot: Vec<CacheEntry> = state.entries.values().cloned().collect();
            plan_eviction(&snapshot, target, policy.expiration_days, Utc::now())
        };

        let mut report = CleanupReport::default();
        for victim in plan {
            let path = self.inner.dir.join(&victim.file_name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("failed to delete cache file {}: {}", victim.file_name, e);
                    tokio::task::yield_now().await;
                    continue;
                }
            }
            {
                let mut state = self.inner.state.lock();
                // The entry may have been refreshed or replaced since planning.
                if let Some(entry) = state.remove(&victim.file_name) {
                    report.freed_bytes += entry.size;
                    report.removed.push(entry.file_name);
                }
                self.persist(&mut state);
            }
            tokio::task::yield_now().await;
        }

        info!(
            "cache cleanup completed removed={} freed={}",
            report.removed.len(),
            report.freed_bytes
        );
        report
    }

    /// `true` while an automatic cleanup pass is running.
    pub fn is_cleanup_running(&self) -> bool {
        self.inner.cleanup_running.load(Ordering::Acquire)
    }

    fn schedule_cleanup(&self) {
        if self
            .inner
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, automatic cache cleanup skipped");
            self.inner.cleanup_running.store(false, Ordering::Release);
            return;
        };
        let index = self.clone();
        runtime.spawn(async move {
            index.cleanup(None).await;
            index.inner.cleanup_running.store(false, Ordering::Release);
        });
    }

    /// Delete every indexed bundle file and empty the index.
    pub fn clear_all(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        for file_name in state.entries.keys() {
            let path = self.inner.dir.join(file_name);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to delete cache file {}: {}", file_name, e);
                }
            }
        }
        state.entries.clear();
        state.total_size = 0;
        self.persist(&mut state);
        info!("cache cleared");
        Ok(())
    }

    /// Delete the cached files of every bundle tagged `tag`.
    pub fn clear_by_tag(&self, tag: &str, manifest: &BundleManifest) -> usize {
        let mut state = self.inner.state.lock();
        let mut removed = 0;
        for bundle in manifest.bundles_by_tag(tag) {
            let file_name = bundle.file_name();
            let _ = fs::remove_file(self.inner.dir.join(&file_name));
            if state.remove(&file_name).is_some() {
                removed += 1;
            }
        }
        self.persist(&mut state);
        removed
    }

    /// Best-effort atomic write of the index document.
    fn persist(&self, state: &mut IndexState) {
        state.last_update_time = Utc::now();
        let mut entries: Vec<CacheEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.create_time
                .cmp(&b.create_time)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        let doc = IndexDocument {
            entries,
            total_size: state.total_size,
            last_update_time: Some(state.last_update_time),
        };
        if let Err(e) = write_document(&self.inner.index_path, &doc) {
            warn!("failed to save cache index: {}", e);
        }
    }
}

fn read_document(path: &Path) -> Result<Option<IndexDocument>> {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| AssetError::CacheCorruption(e.to_string()))
}

fn write_document(path: &Path, doc: &IndexDocument) -> Result<()> {
    let json = serde_json::to_vec_pretty(doc)
        .map_err(|e| AssetError::CacheCorruption(e.to_string()))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
