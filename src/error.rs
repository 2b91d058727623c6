use thiserror::Error;

use crate::source::ImageOrigin;

pub type CaptionResult<T> = std::result::Result<T, CaptionError>;

/// Failures local to a single caption request. None of them are fatal to the
/// process or the session.
#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("Could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Could not fetch image: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Caption generation failed: {0}")]
    Generation(String),

    #[error("No example image with id {0}")]
    UnknownExample(usize),

    #[error("Image from {0} has not been captioned yet")]
    NotGenerated(ImageOrigin),
}

impl CaptionError {
    pub(crate) fn generation(err: impl std::fmt::Display) -> Self {
        CaptionError::Generation(err.to_string())
    }
}
