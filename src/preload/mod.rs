// Background warm-up of assets the host expects to need soon.

pub mod manager;
pub mod predictor;

pub use manager::{PreloadEvent, PreloadManager, PreloadPriority, PreloadSettings};
pub use predictor::PreloadPredictor;
