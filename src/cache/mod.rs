// On-device bundle cache: durable index, validation and LRU eviction.

pub mod entry;
pub mod eviction;
pub mod index;

pub use entry::{CacheEntry, CacheStatistics, CleanupReport};
pub use index::{CacheIndex, CachePolicy};
