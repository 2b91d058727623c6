use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

use crate::config::GenerationConfig;

/// Turns an RGB image into a caption.
///
/// Implementations are loaded once per process and shared read-only between
/// sessions, so `generate` takes `&self` and may block for seconds.
pub trait CaptionEngine: Send + Sync {
    fn generate(&self, image: &RgbImage, config: &GenerationConfig) -> Result<String>;
}

pub type EngineHandle = Arc<dyn CaptionEngine>;
