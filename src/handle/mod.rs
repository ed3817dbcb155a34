// Reference-counted handles over loaded bundles and assets.

pub mod asset;
pub mod bundle;
pub mod refcount;

pub use asset::{AssetHandle, TrackedAsset};
pub use bundle::{BundleHandle, BundleRef, BundleSnapshot, WeakBundle};
pub use refcount::RefCounter;
