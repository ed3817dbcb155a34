use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ma_asset_engine::cache::{CacheIndex, CachePolicy};
use ma_asset_engine::checksum::crc32_bytes;
use ma_asset_engine::download::{
    DownloadManager, DownloadProgress, DownloadReport, DownloadSettings, TaskStatus,
};
use ma_asset_engine::error::AssetError;
use ma_asset_engine::manifest::BundleInfo;
use ma_asset_engine::source::{HttpSource, RemoteSource, RemoteStream};

const BASE_URL: &str = "http://origin.test/Linux/";
const CHUNK: usize = 1024;

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn bundle(name: &str, data: &[u8]) -> BundleInfo {
    let mut info = BundleInfo::new(name, format!("{:08x}", crc32_bytes(data)), data.len() as u64);
    info.crc = crc32_bytes(data);
    info
}

fn settings(base_url: &str) -> DownloadSettings {
    DownloadSettings {
        base_url: base_url.to_string(),
        max_concurrent: 2,
        timeout: Duration::from_secs(5),
        max_retry_count: 3,
        retry_delay: Duration::from_millis(10),
        resume: true,
    }
}

fn open_cache(dir: &std::path::Path) -> CacheIndex {
    CacheIndex::open(
        dir,
        CachePolicy {
            max_size: 1 << 30,
            cleanup_threshold: 0.9,
            expiration_days: 30,
            auto_cleanup: false,
        },
    )
    .unwrap()
}

/// In-memory origin recording every stream request.
#[derive(Default)]
struct MockOrigin {
    files: Mutex<HashMap<String, Bytes>>,
    requests: Mutex<Vec<(String, u64)>>,
    /// Streams for these URLs yield one chunk and then stall.
    stalled: Mutex<Vec<String>>,
    /// The next stream for these URLs carries a flipped first byte.
    corrupt_once: Mutex<HashSet<String>>,
    /// Pause before every chunk.
    chunk_delay: Duration,
}

impl MockOrigin {
    fn paced(chunk_delay: Duration) -> Self {
        Self {
            chunk_delay,
            ..Default::default()
        }
    }

    fn url(info: &BundleInfo) -> String {
        format!("{}{}", BASE_URL, info.file_name())
    }

    fn serve(&self, info: &BundleInfo, data: Vec<u8>) {
        self.files.lock().insert(Self::url(info), Bytes::from(data));
    }

    fn requests(&self) -> Vec<(String, u64)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RemoteSource for MockOrigin {
    async fn fetch(&self, url: &str, _timeout: Duration) -> anyhow::Result<Bytes> {
        self.files
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("request failed: HTTP 404"))
    }

    async fn open_stream(
        &self,
        url: &str,
        offset: u64,
        _timeout: Duration,
    ) -> anyhow::Result<RemoteStream> {
        self.requests.lock().push((url.to_string(), offset));
        let mut data = self
            .files
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("request failed: HTTP 404"))?;
        if self.corrupt_once.lock().remove(url) {
            let mut bad = data.to_vec();
            bad[0] ^= 0xFF;
            data = Bytes::from(bad);
        }
        let total_len = Some(data.len() as u64);
        let rest = data.slice(offset as usize..);
        let chunks: Vec<anyhow::Result<Bytes>> = rest
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let delay = self.chunk_delay;
        let body = if self.stalled.lock().iter().any(|u| u == url) {
            futures::stream::iter(chunks.into_iter().take(1))
                .chain(futures::stream::pending())
                .boxed()
        } else if !delay.is_zero() {
            futures::stream::iter(chunks)
                .then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                })
                .boxed()
        } else {
            futures::stream::iter(chunks).boxed()
        };
        Ok(RemoteStream {
            resumed: offset > 0,
            total_len,
            body,
        })
    }
}

#[tokio::test]
async fn test_download_resumes_from_partial_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(10_000, 7);
    let info = bundle("ui_common", &data);

    let origin = Arc::new(MockOrigin::default());
    origin.serve(&info, data.clone());

    let dest = cache.cache_path(&info);
    let mut tmp = dest.clone().into_os_string();
    tmp.push(".tmp");
    std::fs::write(&tmp, &data[..4000]).unwrap();

    let manager = DownloadManager::new(origin.clone(), cache.clone(), settings(BASE_URL));
    let report = manager.download(&[info.clone()], None, None).await.unwrap();

    assert_eq!(report.downloaded_files, 1);
    assert_eq!(report.downloaded_bytes, 10_000);
    assert_eq!(
        origin.requests(),
        vec![(MockOrigin::url(&info), 4000)]
    );
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!std::path::Path::new(&tmp).exists());
    assert!(cache.validate(&info));
}

#[tokio::test]
async fn test_download_crc_mismatch_retries_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(3000, 1);
    let mut info = bundle("broken", &data);
    info.crc ^= 0xFFFF;

    let origin = Arc::new(MockOrigin::default());
    origin.serve(&info, data);

    let manager = DownloadManager::new(origin.clone(), cache.clone(), settings(BASE_URL));
    let err = manager.download(&[info.clone()], None, None).await.unwrap_err();

    assert!(matches!(err, AssetError::HashMismatch { .. }));
    // A failed check deletes the temp file, so every attempt starts over.
    let requests = origin.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|(_, offset)| *offset == 0));
    assert!(!cache.cache_path(&info).exists());
    assert!(!cache.contains(&info.file_name()));
}

#[tokio::test]
async fn test_download_missing_file_fails_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let info = bundle("absent", &payload(100, 0));

    let origin = Arc::new(MockOrigin::default());
    let manager = DownloadManager::new(origin.clone(), cache, settings(BASE_URL));
    let err = manager.download(&[info], None, None).await.unwrap_err();

    assert!(matches!(err, AssetError::Transfer { .. }));
    assert_eq!(origin.requests().len(), 3);
}

#[tokio::test]
async fn test_download_skips_valid_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(2048, 3);
    let info = bundle("shared_shaders", &data);
    std::fs::write(cache.cache_path(&info), &data).unwrap();

    let origin = Arc::new(MockOrigin::default());
    let manager = DownloadManager::new(origin.clone(), cache.clone(), settings(BASE_URL));
    let report = manager.download(&[info.clone(), info.clone()], None, None).await.unwrap();

    assert_eq!(report.skipped_files, 1);
    assert_eq!(report.downloaded_files, 0);
    assert!(origin.requests().is_empty());
    assert!(cache.contains(&info.file_name()));
}

#[tokio::test]
async fn test_download_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let origin = Arc::new(MockOrigin::default());

    let mut bundles = Vec::new();
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        let data = payload(5000 + i * 100, i as u8);
        let info = bundle(name, &data);
        origin.serve(&info, data);
        bundles.push(info);
    }
    let total: u64 = bundles.iter().map(|b| b.size).sum();

    let (tx, rx) = watch::channel(DownloadProgress::default());
    let manager = DownloadManager::new(origin.clone(), cache.clone(), settings(BASE_URL));
    let report = manager.download(&bundles, Some(&tx), None).await.unwrap();

    assert_eq!(report.downloaded_files, 4);
    let last = rx.borrow().clone();
    assert_eq!(last.total_count, 4);
    assert_eq!(last.completed_count, 4);
    assert_eq!(last.total_bytes, total);
    assert_eq!(last.downloaded_bytes, total);
    assert!(last.is_done());
    for info in &bundles {
        assert!(cache.validate(info));
    }
}

#[tokio::test]
async fn test_download_cancellation_keeps_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(8 * CHUNK, 9);
    let info = bundle("big_level", &data);

    let origin = Arc::new(MockOrigin::default());
    origin.serve(&info, data);
    origin
        .stalled
        .lock()
        .push(MockOrigin::url(&info));

    let manager = DownloadManager::new(origin.clone(), cache.clone(), settings(BASE_URL));
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = manager.download(&[info.clone()], None, Some(token)).await.unwrap_err();
    assert_eq!(err, AssetError::Cancelled);
    assert!(!cache.cache_path(&info).exists());
    assert!(!cache.contains(&info.file_name()));

    let mut tmp = cache.cache_path(&info).into_os_string();
    tmp.push(".tmp");
    assert_eq!(std::fs::metadata(&tmp).unwrap().len(), CHUNK as u64);
}

#[tokio::test]
async fn test_cancel_all_stops_running_batch() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(4 * CHUNK, 2);
    let info = bundle("stuck", &data);

    let origin = Arc::new(MockOrigin::default());
    origin.serve(&info, data);
    origin
        .stalled
        .lock()
        .push(MockOrigin::url(&info));

    let manager = Arc::new(DownloadManager::new(origin, cache, settings(BASE_URL)));
    let canceller = manager.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel_all();
    });

    let err = manager.download(&[info], None, None).await.unwrap_err();
    assert_eq!(err, AssetError::Cancelled);
}

#[tokio::test]
async fn test_download_retry_recovers_after_bad_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(3000, 6);
    let info = bundle("flaky", &data);

    let origin = Arc::new(MockOrigin::default());
    origin.serve(&info, data.clone());
    origin.corrupt_once.lock().insert(MockOrigin::url(&info));

    let manager = DownloadManager::new(origin.clone(), cache.clone(), settings(BASE_URL));
    let report = manager.download(&[info.clone()], None, None).await.unwrap();

    assert_eq!(report.downloaded_files, 1);
    assert_eq!(
        origin.requests(),
        vec![(MockOrigin::url(&info), 0), (MockOrigin::url(&info), 0)]
    );
    let task = &report.tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert!(matches!(task.error, Some(AssetError::HashMismatch { .. })));
    assert_eq!(std::fs::read(cache.cache_path(&info)).unwrap(), data);
    assert!(cache.validate(&info));
}

fn spawn_download(
    manager: &Arc<DownloadManager>,
    info: &BundleInfo,
    cancel: Option<CancellationToken>,
) -> JoinHandle<ma_asset_engine::error::Result<DownloadReport>> {
    let manager = manager.clone();
    let info = info.clone();
    tokio::spawn(async move { manager.download(&[info], None, cancel).await })
}

#[tokio::test]
async fn test_overlapping_batches_share_one_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(64 * CHUNK, 4);
    let info = bundle("level_pack", &data);

    let origin = Arc::new(MockOrigin::paced(Duration::from_millis(5)));
    origin.serve(&info, data.clone());
    let manager = Arc::new(DownloadManager::new(
        origin.clone(),
        cache.clone(),
        settings(BASE_URL),
    ));

    let first = spawn_download(&manager, &info, None);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(manager.active_transfers(), 1);
    let second = spawn_download(&manager, &info, None);

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a.downloaded_files, 1);
    assert_eq!(b.downloaded_files, 1);
    assert_eq!(origin.requests(), vec![(MockOrigin::url(&info), 0)]);
    assert_eq!(std::fs::read(cache.cache_path(&info)).unwrap(), data);
    assert!(cache.validate(&info));
    assert_eq!(manager.active_transfers(), 0);
}

#[tokio::test]
async fn test_cancelled_batch_leaves_shared_transfer_running() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(64 * CHUNK, 8);
    let info = bundle("world_map", &data);

    let origin = Arc::new(MockOrigin::paced(Duration::from_millis(5)));
    origin.serve(&info, data.clone());
    let manager = Arc::new(DownloadManager::new(
        origin.clone(),
        cache.clone(),
        settings(BASE_URL),
    ));

    let token = CancellationToken::new();
    let first = spawn_download(&manager, &info, Some(token.clone()));
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = spawn_download(&manager, &info, None);
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    assert_eq!(first.await.unwrap().unwrap_err(), AssetError::Cancelled);
    let report = second.await.unwrap().unwrap();
    assert_eq!(report.downloaded_files, 1);
    assert_eq!(origin.requests().len(), 1);
    assert_eq!(std::fs::read(cache.cache_path(&info)).unwrap(), data);
}

#[tokio::test]
async fn test_paused_manager_holds_new_transfers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(2 * CHUNK, 3);
    let info = bundle("intro_movie", &data);

    let origin = Arc::new(MockOrigin::default());
    origin.serve(&info, data);
    let manager = Arc::new(DownloadManager::new(
        origin.clone(),
        cache.clone(),
        settings(BASE_URL),
    ));

    manager.pause();
    assert!(manager.is_paused());
    let batch = spawn_download(&manager, &info, None);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(origin.requests().is_empty());
    assert!(!batch.is_finished());

    manager.resume();
    let report = batch.await.unwrap().unwrap();
    assert_eq!(report.downloaded_files, 1);
    assert!(cache.validate(&info));
}

// HTTP origin for the end-to-end path through `HttpSource`.

async fn serve_bundle(req: Request, body: Arc<Vec<u8>>) -> impl IntoResponse {
    let total = body.len();
    if let Some(start) = req
        .headers()
        .get("Range")
        .and_then(|v| v.to_str().ok())
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|s| s.parse::<usize>().ok())
    {
        return (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, total - 1, total),
            )],
            body[start..].to_vec(),
        )
            .into_response();
    }
    (StatusCode::OK, body.to_vec()).into_response()
}

async fn start_server(path: String, body: Vec<u8>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let body = Arc::new(body);
    let app = Router::new().route(
        &path,
        get(move |req: Request| serve_bundle(req, body.clone())),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

#[tokio::test]
async fn test_http_download_resumes_with_range_request() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());
    let data = payload(64 * 1024, 5);
    let info = bundle("login_scene", &data);

    let (addr, _handle) = start_server(format!("/Linux/{}", info.file_name()), data.clone()).await;
    let base_url = format!("http://{}/Linux/", addr);

    let mut tmp = cache.cache_path(&info).into_os_string();
    tmp.push(".tmp");
    std::fs::write(&tmp, &data[..10_000]).unwrap();

    let manager = DownloadManager::new(
        Arc::new(HttpSource::new(HashMap::new())),
        cache.clone(),
        settings(&base_url),
    );
    let report = manager.download(&[info.clone()], None, None).await.unwrap();

    assert_eq!(report.downloaded_files, 1);
    assert_eq!(std::fs::read(cache.cache_path(&info)).unwrap(), data);
    assert!(cache.validate(&info));
}
