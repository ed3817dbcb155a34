use anyhow::{Context, Result};
use bytes::Bytes;

use super::backend::NativeBundle;

/// A type that can be produced from a resident bundle.
///
/// Hosts implement this for their own asset types; the bundle packing format
/// is theirs to interpret.
pub trait Asset: Send + Sync + Sized + 'static {
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Extract `asset_path` from `bundle`.
    fn decode(bundle: &NativeBundle, asset_path: &str) -> Result<Self>;

    /// Build the asset from its unpacked source file.
    fn from_source(asset_path: &str, data: Bytes) -> Result<Self> {
        Self::decode(&NativeBundle::from_bytes(asset_path, data), asset_path)
    }
}

/// The whole bundle, as used by raw-file bundles.
impl Asset for Bytes {
    fn decode(bundle: &NativeBundle, _asset_path: &str) -> Result<Self> {
        Ok(bundle.to_bytes())
    }
}

/// The whole bundle as UTF-8 text.
impl Asset for String {
    fn decode(bundle: &NativeBundle, asset_path: &str) -> Result<Self> {
        let text = std::str::from_utf8(bundle.as_slice())
            .with_context(|| format!("{} is not valid UTF-8", asset_path))?;
        Ok(text.to_string())
    }
}
