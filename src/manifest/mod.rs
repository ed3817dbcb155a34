// Manifest model: bundle/asset catalog consumed by every other subsystem.

pub mod catalog;
pub mod info;

pub use catalog::BundleManifest;
pub use info::{bundle_file_name, AssetInfo, BundleInfo};
