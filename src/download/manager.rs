// Bounded-concurrency, retrying, resumable bundle downloader.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{DownloadProgress, ThroughputMeter};
use super::task::{temp_path, DownloadReport, DownloadTask, TaskStatus};
use crate::cache::CacheIndex;
use crate::checksum::{crc32_file, file_matches_crc};
use crate::config::{
    EngineConfig, PROGRESS_INTERVAL_MS, SCHEDULER_POLL_INTERVAL_MS, SPEED_SAMPLE_INTERVAL_MS,
};
use crate::error::{AssetError, Result};
use crate::manifest::BundleInfo;
use crate::source::RemoteSource;

/// Transfer settings taken from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Origin directory; bundle file names are appended to it.
    pub base_url: String,
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub max_retry_count: u32,
    pub retry_delay: Duration,
    pub resume: bool,
}

impl DownloadSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_url: config.remote_base_url(),
            max_concurrent: config.max_concurrent_downloads.max(1),
            timeout: config.download_timeout(),
            max_retry_count: config.max_retry_count,
            retry_delay: config.retry_delay(),
            resume: config.enable_breakpoint_resume,
        }
    }
}

type SharedTransfer = Shared<BoxFuture<'static, Result<()>>>;

/// One running transfer per destination, joined by every batch that needs it.
struct InFlightTransfer {
    id: u64,
    transfer: SharedTransfer,
    received: Arc<AtomicU64>,
    token: CancellationToken,
    /// Batches currently waiting on the transfer.
    waiters: usize,
}

/// A batch's view of an in-flight transfer.
struct ActiveTransfer {
    task: DownloadTask,
    id: u64,
    received: Arc<AtomicU64>,
    token: CancellationToken,
    transfer: SharedTransfer,
    waiter: JoinHandle<Result<()>>,
}

pub struct DownloadManager {
    source: Arc<dyn RemoteSource>,
    cache: CacheIndex,
    settings: DownloadSettings,
    cancel_token: Mutex<CancellationToken>,
    in_flight: Arc<Mutex<HashMap<PathBuf, InFlightTransfer>>>,
    next_id: AtomicU64,
    paused: AtomicBool,
}

impl DownloadManager {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        cache: CacheIndex,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            source,
            cache,
            settings,
            cancel_token: Mutex::new(CancellationToken::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            paused: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    pub fn bundle_url(&self, info: &BundleInfo) -> String {
        format!("{}{}", self.settings.base_url, info.file_name())
    }

    /// Cancel every running batch. Later calls to [`Self::download`] start fresh.
    pub fn cancel_all(&self) {
        let mut token = self.cancel_token.lock();
        token.cancel();
        *token = CancellationToken::new();
        info!("all downloads cancelled");
    }

    /// Stop starting new transfers. Running transfers finish normally.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("downloads paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("downloads resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Number of distinct files being transferred across all batches.
    pub fn active_transfers(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Bring every bundle in `bundles` into the cache directory.
    ///
    /// Bundles already on disk with the expected size and CRC are skipped. A
    /// file already being transferred for another batch is awaited rather than
    /// fetched twice. The batch fails on the first transfer that exhausts its
    /// retries, and on cancellation through `cancel` or [`Self::cancel_all`].
    pub async fn download(
        &self,
        bundles: &[BundleInfo],
        progress: Option<&watch::Sender<DownloadProgress>>,
        cancel: Option<CancellationToken>,
    ) -> Result<DownloadReport> {
        let batch = self.cancel_token.lock().child_token();
        let _finish = batch.clone().drop_guard();
        if let Some(external) = cancel {
            let linked = batch.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            });
        }

        let mut report = DownloadReport::default();
        let mut pending = VecDeque::new();
        let mut seen = HashSet::new();
        for info in bundles {
            let dest = self.cache.cache_path(info);
            if !seen.insert(dest.clone()) {
                continue;
            }
            if is_complete(&dest, info.size, info.crc).await {
                debug!("bundle {} already present, skipping", info.bundle_name);
                if !self.cache.contains(&info.file_name()) {
                    self.cache.add(info);
                }
                report.skipped_files += 1;
                continue;
            }
            pending.push_back(DownloadTask::new(self.bundle_url(info), dest, info.clone()));
        }

        let mut snapshot = DownloadProgress {
            total_count: pending.len(),
            total_bytes: pending.iter().map(|t| t.expected_size()).sum(),
            ..Default::default()
        };
        if pending.is_empty() {
            publish(progress, &snapshot);
            return Ok(report);
        }
        info!(
            "download batch started files={} bytes={}",
            snapshot.total_count, snapshot.total_bytes
        );

        let mut active: Vec<ActiveTransfer> = Vec::new();
        let mut delayed: Vec<(Instant, DownloadTask)> = Vec::new();
        let mut completed_bytes = 0u64;
        let mut meter =
            ThroughputMeter::new(Duration::from_millis(SPEED_SAMPLE_INTERVAL_MS), Instant::now());
        let mut last_publish = Instant::now();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(SCHEDULER_POLL_INTERVAL_MS));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = batch.cancelled() => {}
            }

            if batch.is_cancelled() {
                for transfer in active.drain(..) {
                    let name = transfer.task.file_name();
                    self.detach(transfer).await;
                    debug!("download {} cancelled", name);
                }
                info!("download batch cancelled");
                return Err(AssetError::Cancelled);
            }

            // Reap finished transfers.
            let mut i = 0;
            while i < active.len() {
                if !active[i].waiter.is_finished() {
                    i += 1;
                    continue;
                }
                let transfer = active.swap_remove(i);
                let mut task = transfer.task;
                task.downloaded_bytes = transfer.received.load(Ordering::Relaxed);
                let outcome = transfer
                    .waiter
                    .await
                    .unwrap_or_else(|e| Err(AssetError::Io(format!("download worker: {}", e))));

                match outcome {
                    Ok(()) => {
                        task.status = TaskStatus::Completed;
                        self.cache.add(&task.bundle);
                        completed_bytes += task.expected_size();
                        snapshot.completed_count += 1;
                        report.downloaded_files += 1;
                        report.downloaded_bytes += task.expected_size();
                        debug!("download {} completed", task.file_name());
                        report.tasks.push(task);
                    }
                    Err(AssetError::Cancelled) if !batch.is_cancelled() => {
                        // Joined a transfer its last owner had already abandoned.
                        debug!("download {} was abandoned, requeued", task.file_name());
                        task.status = TaskStatus::Pending;
                        pending.push_back(task);
                    }
                    // Batch-level cancellation is handled on the next tick.
                    Err(AssetError::Cancelled) => {}
                    Err(e) => {
                        task.retry_count += 1;
                        if task.retry_count < self.settings.max_retry_count && e.is_retryable() {
                            warn!(
                                "download {} failed (attempt {}): {}",
                                task.file_name(),
                                task.retry_count,
                                e
                            );
                            task.status = TaskStatus::Pending;
                            task.error = Some(e);
                            delayed.push((Instant::now() + self.settings.retry_delay, task));
                        } else {
                            error!(
                                "download {} failed after {} attempts: {}",
                                task.file_name(),
                                task.retry_count,
                                e
                            );
                            for other in active.drain(..) {
                                self.detach(other).await;
                            }
                            return Err(e);
                        }
                    }
                }
            }

            // Retries whose delay has elapsed go back to the pending queue.
            let now = Instant::now();
            let mut j = 0;
            while j < delayed.len() {
                if delayed[j].0 <= now {
                    let (_, task) = delayed.swap_remove(j);
                    pending.push_back(task);
                } else {
                    j += 1;
                }
            }

            if !self.is_paused() {
                while active.len() < self.settings.max_concurrent {
                    let Some(task) = pending.pop_front() else {
                        break;
                    };
                    active.push(self.start_transfer(task));
                }
            }

            let in_flight: u64 = active
                .iter()
                .map(|t| t.received.load(Ordering::Relaxed))
                .sum();
            snapshot.downloaded_bytes = completed_bytes + in_flight;
            if let Some(current) = active.first() {
                snapshot.current_file = current.task.bundle.bundle_name.clone();
            }

            let done = active.is_empty() && pending.is_empty() && delayed.is_empty();
            if done || last_publish.elapsed() >= Duration::from_millis(PROGRESS_INTERVAL_MS) {
                snapshot.speed = meter.update(snapshot.downloaded_bytes, Instant::now());
                publish(progress, &snapshot);
                last_publish = Instant::now();
            }
            if done {
                break;
            }
        }

        info!(
            "download batch completed files={} bytes={} skipped={}",
            report.downloaded_files, report.downloaded_bytes, report.skipped_files
        );
        Ok(report)
    }

    /// Start the transfer for `task`, or join the one already running for its destination.
    fn start_transfer(&self, mut task: DownloadTask) -> ActiveTransfer {
        task.status = TaskStatus::Downloading;
        let mut table = self.in_flight.lock();
        let entry = match table.entry(task.dest.clone()) {
            Entry::Occupied(occupied) => {
                debug!("download {} already running, joining", task.file_name());
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let received = Arc::new(AtomicU64::new(0));
                let token = self.cancel_token.lock().child_token();
                let job = TransferJob {
                    source: Arc::clone(&self.source),
                    url: task.url.clone(),
                    dest: task.dest.clone(),
                    expected_size: task.expected_size(),
                    expected_crc: task.expected_crc(),
                    resume: self.settings.resume,
                    timeout: self.settings.timeout,
                    received: Arc::clone(&received),
                    token: token.clone(),
                };
                debug!("download {} started url={}", task.file_name(), task.url);

                let table_ref = Arc::clone(&self.in_flight);
                let dest = task.dest.clone();
                let handle = tokio::spawn(async move {
                    let outcome = job.run().await;
                    let mut table = table_ref.lock();
                    if table.get(&dest).map(|e| e.id) == Some(id) {
                        table.remove(&dest);
                    }
                    outcome
                });
                let transfer = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(AssetError::Io(format!("download worker: {}", e))))
                }
                .boxed()
                .shared();

                vacant.insert(InFlightTransfer {
                    id,
                    transfer,
                    received,
                    token,
                    waiters: 0,
                })
            }
        };
        entry.waiters += 1;

        ActiveTransfer {
            id: entry.id,
            received: Arc::clone(&entry.received),
            token: entry.token.clone(),
            transfer: entry.transfer.clone(),
            waiter: tokio::spawn(entry.transfer.clone()),
            task,
        }
    }

    /// Stop waiting on `transfer`. The last batch to let go stops the transfer
    /// and waits for it to settle, leaving partial data for a later resume.
    async fn detach(&self, transfer: ActiveTransfer) {
        transfer.waiter.abort();
        let last = {
            let mut table = self.in_flight.lock();
            match table.get_mut(&transfer.task.dest) {
                Some(entry) if entry.id == transfer.id => {
                    entry.waiters = entry.waiters.saturating_sub(1);
                    entry.waiters == 0
                }
                _ => false,
            }
        };
        if last {
            transfer.token.cancel();
            let _ = transfer.transfer.await;
        }
    }
}

struct TransferJob {
    source: Arc<dyn RemoteSource>,
    url: String,
    dest: PathBuf,
    expected_size: u64,
    expected_crc: u32,
    resume: bool,
    timeout: Duration,
    received: Arc<AtomicU64>,
    token: CancellationToken,
}

impl TransferJob {
    async fn run(self) -> Result<()> {
        // Another batch may have promoted the file since this one was planned.
        if is_complete(&self.dest, self.expected_size, self.expected_crc).await {
            self.received.store(self.expected_size, Ordering::Relaxed);
            return Ok(());
        }

        let tmp = temp_path(&self.dest);
        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut offset = if self.resume {
            tokio::fs::metadata(&tmp).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        if self.expected_size > 0 && offset > self.expected_size {
            offset = 0;
        }

        // A complete temp file left by an interrupted promotion only needs verifying.
        if !(self.expected_size > 0 && offset == self.expected_size) {
            self.stream_into(&tmp, offset).await?;
        } else {
            self.received.store(offset, Ordering::Relaxed);
        }

        self.verify_and_promote(&tmp).await
    }

    async fn stream_into(&self, tmp: &Path, mut offset: u64) -> Result<()> {
        let stream = self
            .source
            .open_stream(&self.url, offset, self.timeout)
            .await
            .map_err(|e| AssetError::transfer(&self.url, e))?;

        if offset > 0 && !stream.resumed {
            debug!("origin ignored range for {}, restarting", self.url);
            offset = 0;
        }
        if offset > 0 {
            debug!("resuming {} at {}", self.url, offset);
        }

        let mut file = if offset > 0 {
            tokio::fs::OpenOptions::new().append(true).open(tmp).await?
        } else {
            tokio::fs::File::create(tmp).await?
        };
        self.received.store(offset, Ordering::Relaxed);

        let mut body = stream.body;
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => None,
                next = body.next() => Some(next),
            };
            // Cancelled; what was written so far stays for a later resume.
            let Some(next) = next else {
                file.flush().await?;
                return Err(AssetError::Cancelled);
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| AssetError::transfer(&self.url, e))?;
            file.write_all(&chunk).await?;
            self.received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn verify_and_promote(&self, tmp: &Path) -> Result<()> {
        let len = tokio::fs::metadata(tmp).await?.len();
        if self.expected_size > 0 && len != self.expected_size {
            let _ = tokio::fs::remove_file(tmp).await;
            return Err(AssetError::transfer(
                &self.url,
                format!("size mismatch: expected {}, got {}", self.expected_size, len),
            ));
        }

        if self.expected_crc != 0 {
            let path = tmp.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || crc32_file(&path))
                .await
                .map_err(|e| AssetError::Io(e.to_string()))??;
            if actual != self.expected_crc {
                let _ = tokio::fs::remove_file(tmp).await;
                return Err(AssetError::HashMismatch {
                    file: file_label(&self.dest),
                    expected: self.expected_crc,
                    actual,
                });
            }
        }

        match tokio::fs::remove_file(&self.dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::rename(tmp, &self.dest).await?;
        Ok(())
    }
}

async fn is_complete(dest: &Path, size: u64, crc: u32) -> bool {
    let Ok(meta) = tokio::fs::metadata(dest).await else {
        return false;
    };
    if !meta.is_file() || meta.len() != size {
        return false;
    }
    let path = dest.to_path_buf();
    tokio::task::spawn_blocking(move || file_matches_crc(&path, crc))
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(false)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn publish(progress: Option<&watch::Sender<DownloadProgress>>, snapshot: &DownloadProgress) {
    if let Some(tx) = progress {
        tx.send_replace(snapshot.clone());
    }
}
