// Remote bundle transfer into the cache directory.

pub mod manager;
pub mod progress;
pub mod task;

pub use manager::{DownloadManager, DownloadSettings};
pub use progress::{DownloadProgress, ThroughputMeter};
pub use task::{DownloadReport, DownloadTask, TaskStatus};
