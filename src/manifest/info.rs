use serde::{Deserialize, Serialize};

/// One packaged bundle as described by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleInfo {
    pub bundle_name: String,
    /// Content hash; part of the on-disk file name.
    pub hash: String,
    pub crc: u32,
    pub size: u64,
    /// Bundles that must be resident before this one, in load order.
    pub dependencies: Vec<String>,
    /// Grouping labels used for partial downloads.
    pub tags: Vec<String>,
    pub priority: i32,
    pub is_raw_file: bool,
    pub is_encrypted: bool,
    /// Logical asset paths packed into this bundle.
    pub assets: Vec<String>,
}

impl BundleInfo {
    pub fn new(bundle_name: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        Self {
            bundle_name: bundle_name.into(),
            hash: hash.into(),
            size,
            ..Default::default()
        }
    }

    /// File name shared by the build output, the cache index and the download path.
    pub fn file_name(&self) -> String {
        bundle_file_name(&self.bundle_name, &self.hash)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

pub fn bundle_file_name(bundle_name: &str, hash: &str) -> String {
    format!("{}_{}", bundle_name, hash)
}

/// One logical asset and the bundle that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AssetInfo {
    pub asset_path: String,
    /// Declared type name, informational.
    pub asset_type: String,
    pub bundle_name: String,
    pub is_raw_file: bool,
}
