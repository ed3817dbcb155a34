#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;

use ma_asset_engine::checksum::crc32_bytes;
use ma_asset_engine::config::{EngineConfig, PlayMode};
use ma_asset_engine::manifest::{BundleInfo, BundleManifest};
use ma_asset_engine::source::{RemoteSource, RemoteStream};
use ma_asset_engine::update::VersionInfo;

pub const REMOTE_URL: &str = "http://origin.test";
pub const PLATFORM: &str = "Linux";

/// In-memory origin keyed by full URL.
#[derive(Default)]
pub struct MockOrigin {
    files: Mutex<HashMap<String, Bytes>>,
    fetched: Mutex<Vec<String>>,
}

impl MockOrigin {
    pub fn url(file: &str) -> String {
        format!("{}/{}/{}", REMOTE_URL, PLATFORM, file)
    }

    pub fn put(&self, file: &str, data: impl Into<Bytes>) {
        self.files.lock().insert(Self::url(file), data.into());
    }

    pub fn remove(&self, file: &str) {
        self.files.lock().remove(&Self::url(file));
    }

    pub fn publish(&self, version: &VersionInfo, manifest: &BundleManifest) {
        self.put("version.json", version.to_json().unwrap());
        self.put("manifest.json", manifest.to_json().unwrap());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    fn get(&self, url: &str) -> anyhow::Result<Bytes> {
        self.fetched.lock().push(url.to_string());
        self.files
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("request failed: HTTP 404"))
    }
}

#[async_trait]
impl RemoteSource for MockOrigin {
    async fn fetch(&self, url: &str, _timeout: Duration) -> anyhow::Result<Bytes> {
        self.get(url)
    }

    async fn open_stream(
        &self,
        url: &str,
        offset: u64,
        _timeout: Duration,
    ) -> anyhow::Result<RemoteStream> {
        let data = self.get(url)?;
        let total_len = Some(data.len() as u64);
        let rest = data.slice(offset as usize..);
        Ok(RemoteStream {
            resumed: offset > 0,
            total_len,
            body: futures::stream::once(async move { Ok(rest) }).boxed(),
        })
    }
}

pub fn config(root: &Path, play_mode: PlayMode) -> EngineConfig {
    ma_asset_engine::logging::init_tracing();
    EngineConfig {
        play_mode,
        remote_url: REMOTE_URL.to_string(),
        platform: PLATFORM.to_string(),
        cache_dir: root.join("cache"),
        streaming_dir: root.join("streaming"),
        simulate_root: root.join("source"),
        retry_delay_ms: 10,
        enable_auto_cleanup: false,
        ..Default::default()
    }
}

pub fn version(v: &str, force_update: bool) -> VersionInfo {
    VersionInfo {
        version: v.to_string(),
        force_update,
        ..Default::default()
    }
}

/// Bundle description matching `data`.
pub fn bundle(name: &str, data: &[u8], tags: &[&str], assets: &[&str]) -> BundleInfo {
    let crc = crc32_bytes(data);
    let mut info = BundleInfo::new(name, format!("{:08x}", crc), data.len() as u64);
    info.crc = crc;
    info.tags = tags.iter().map(|t| t.to_string()).collect();
    info.assets = assets.iter().map(|a| a.to_string()).collect();
    info
}

pub fn manifest(v: &str, bundles: Vec<BundleInfo>) -> BundleManifest {
    BundleManifest::new(v, "2026-01-01T00:00:00Z", PLATFORM, bundles, Vec::new())
}

/// Write the version and manifest documents shipped with the application.
pub fn ship(root: &Path, version: &VersionInfo, manifest: &BundleManifest) {
    let dir = root.join("streaming").join(PLATFORM);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("version.json"), version.to_json().unwrap()).unwrap();
    std::fs::write(dir.join("manifest.json"), manifest.to_json().unwrap()).unwrap();
}
