use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use super::traits::{RemoteSource, RemoteStream};

pub struct HttpSource {
    client: Client,
    headers: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpSource {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            headers: Arc::new(RwLock::new(headers)),
        }
    }

    /// Replace the headers sent with every request (e.g. after token refresh).
    pub fn update_headers(&self, new_headers: HashMap<String, String>) {
        *self.headers.write() = new_headers;
    }

    fn build_request(
        &self,
        url: &str,
        range_header: Option<&str>,
        timeout: Duration,
    ) -> RequestBuilder {
        let headers = self.headers.read().clone();

        let mut req = self.client.get(url).timeout(timeout);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(range) = range_header {
            req = req.header("Range", range);
        }
        req
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<()> {
    if matches!(status.as_u16(), 401 | 403 | 412) {
        warn!("http auth rejected status={} url={}", status.as_u16(), url);
        return Err(anyhow!("auth_rejected: HTTP {}", status.as_u16()));
    }
    if !status.is_success() {
        warn!("http request failed status={} url={}", status.as_u16(), url);
        return Err(anyhow!("request failed: HTTP {}", status.as_u16()));
    }
    Ok(())
}

/// Total length from `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Bytes> {
        let resp = self.build_request(url, None, timeout).send().await?;
        check_status(resp.status(), url)?;
        let bytes = resp.bytes().await?;
        debug!("http fetch url={} bytes={}", url, bytes.len());
        Ok(bytes)
    }

    async fn open_stream(&self, url: &str, offset: u64, timeout: Duration) -> Result<RemoteStream> {
        let range = (offset > 0).then(|| format!("bytes={}-", offset));
        let resp = self
            .build_request(url, range.as_deref(), timeout)
            .send()
            .await?;

        let status = resp.status();
        check_status(status, url)?;

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let total_len = if status == StatusCode::PARTIAL_CONTENT {
            resp.headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_total)
        } else {
            resp.content_length()
        };
        debug!(
            "http stream url={} offset={} status={} total={:?}",
            url,
            offset,
            status.as_u16(),
            total_len
        );

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed();

        Ok(RemoteStream {
            resumed,
            total_len,
            body,
        })
    }
}
