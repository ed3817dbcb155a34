use std::path::{Path, PathBuf};

use crate::config::TEMP_FILE_SUFFIX;
use crate::error::AssetError;
use crate::manifest::BundleInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

/// One bundle file transfer within a batch. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub dest: PathBuf,
    pub bundle: BundleInfo,
    pub retry_count: u32,
    pub downloaded_bytes: u64,
    pub status: TaskStatus,
    /// Last failed attempt, kept when a retry later succeeds.
    pub error: Option<AssetError>,
}

impl DownloadTask {
    pub fn new(url: String, dest: PathBuf, bundle: BundleInfo) -> Self {
        Self {
            url,
            dest,
            bundle,
            retry_count: 0,
            downloaded_bytes: 0,
            status: TaskStatus::Pending,
            error: None,
        }
    }

    pub fn expected_size(&self) -> u64 {
        self.bundle.size
    }

    pub fn expected_crc(&self) -> u32 {
        self.bundle.crc
    }

    pub fn temp_path(&self) -> PathBuf {
        temp_path(&self.dest)
    }

    pub fn file_name(&self) -> String {
        self.bundle.file_name()
    }
}

/// `<dest>.tmp`, the file a transfer streams into before promotion.
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(TEMP_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Summary of a finished batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded_files: usize,
    pub downloaded_bytes: u64,
    /// Bundles already present with the expected size and checksum.
    pub skipped_files: usize,
    /// Completed transfers in completion order, with their retry history.
    pub tasks: Vec<DownloadTask>,
}
