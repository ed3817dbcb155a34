pub mod cache;
pub mod checksum;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod handle;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod preload;
pub mod source;
pub mod update;

pub use config::{EngineConfig, PlayMode};
pub use engine::AssetEngine;
pub use error::{AssetError, Result};
