// Error taxonomy shared by every subsystem.

/// Errors surfaced by the asset engine.
///
/// Payloads are plain strings so one failed in-flight load can be handed to
/// every caller awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    /// No usable local or remote manifest.
    #[error("manifest unavailable: {0}")]
    ManifestUnavailable(String),

    /// Bundle name absent from the manifest.
    #[error("bundle not found: {0}")]
    BundleNotFound(String),

    /// Asset path absent from the manifest or the source tree.
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// A downloaded or cached file failed its CRC check.
    #[error("hash mismatch for {file}: expected {expected:08x}, got {actual:08x}")]
    HashMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    /// Network or IO failure while transferring a file.
    #[error("transfer failed for {url}: {message}")]
    Transfer { url: String, message: String },

    /// Cache index unreadable or inconsistent with the disk.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    /// Use of a handle after it was disposed.
    #[error("handle already disposed: {0}")]
    DisposedHandle(String),

    /// Malformed manifest whose dependency graph loops back on itself.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// The same asset path was requested with a different asset type.
    #[error("asset {path} already loaded as {loaded}, requested {requested}")]
    TypeMismatch {
        path: String,
        loaded: &'static str,
        requested: &'static str,
    },

    #[error("asset is not a raw file: {0}")]
    NotRawFile(String),

    /// The backend or the asset decoder rejected the bytes.
    #[error("failed to decode {path}: {message}")]
    Decode { path: String, message: String },

    #[error("io error: {0}")]
    Io(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl AssetError {
    pub fn transfer(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        AssetError::Transfer {
            url: url.into(),
            message: err.to_string(),
        }
    }

    /// Whether a retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AssetError::Transfer { .. } | AssetError::HashMismatch { .. } | AssetError::Io(_)
        )
    }
}

impl From<std::io::Error> for AssetError {
    fn from(err: std::io::Error) -> Self {
        AssetError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AssetError>;
