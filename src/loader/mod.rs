// Turns "load asset X" into resident bundles and tracked asset handles.

pub mod asset;
pub mod backend;
pub mod bundle_loader;
pub mod strategy;

pub use asset::Asset;
pub use backend::{BundleBackend, BundleLocation, MmapBackend, NativeBundle};
pub use bundle_loader::{AssetSnapshot, BundleLoader};
pub use strategy::LoadStrategy;
