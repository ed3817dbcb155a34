pub mod resolver;
pub mod version;

pub use resolver::VersionResolver;
pub use version::{UpdateCheckResult, UpdateStatus, VersionInfo};
