use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// A byte stream opened against a remote file.
pub struct RemoteStream {
    /// The origin honoured the requested start offset (`206 Partial Content`).
    /// When `false` the body starts at byte 0 regardless of the request.
    pub resumed: bool,
    /// Total size of the remote file when the origin reported it.
    pub total_len: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Origin serving version documents, manifests and bundle payloads.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch a whole (small) document.
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Bytes>;

    /// Open a streaming download starting at `offset`.
    async fn open_stream(&self, url: &str, offset: u64, timeout: Duration) -> Result<RemoteStream>;
}
