pub mod beam_search;
pub mod captioner;
pub mod download;
pub mod image_process;

pub use captioner::OnnxCaptioner;
pub use download::{download_caption_models, get_default_model_dir, models_present};
