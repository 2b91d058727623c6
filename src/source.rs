use std::fmt;
use std::time::Duration;

use image::RgbImage;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::error::{CaptionError, CaptionResult};

/// A preset image offered next to upload and URL input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExampleImage {
    pub label: &'static str,
    pub url: &'static str,
}

pub const EXAMPLE_IMAGES: &[ExampleImage] = &[
    ExampleImage {
        label: "Two cats on a couch",
        url: "http://images.cocodataset.org/val2017/000000039769.jpg",
    },
    ExampleImage {
        label: "Kitchen",
        url: "http://images.cocodataset.org/val2017/000000397133.jpg",
    },
    ExampleImage {
        label: "Street scene",
        url: "http://images.cocodataset.org/val2017/000000037777.jpg",
    },
    ExampleImage {
        label: "Baseball game",
        url: "http://images.cocodataset.org/val2017/000000252219.jpg",
    },
];

pub fn example_image(id: usize) -> CaptionResult<&'static ExampleImage> {
    EXAMPLE_IMAGES.get(id).ok_or(CaptionError::UnknownExample(id))
}

/// Where the image of a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOrigin {
    Upload,
    Url(String),
    Example(usize),
}

impl fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageOrigin::Upload => write!(f, "upload"),
            ImageOrigin::Url(url) => write!(f, "url {}", url),
            ImageOrigin::Example(id) => write!(f, "example #{}", id),
        }
    }
}

/// Decodes an uploaded file into RGB. Paletted, grayscale and alpha images
/// are converted; alpha is dropped.
pub fn decode_image(bytes: &[u8]) -> CaptionResult<RgbImage> {
    let img = image::load_from_memory(bytes)?;
    debug!(
        "Decoded {:?} image {}x{}",
        img.color(),
        img.width(),
        img.height()
    );
    Ok(img.to_rgb8())
}

/// HTTP side of [`decode_image`]: one GET per call, no retries, no caching.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
}

impl ImageFetcher {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

    pub fn new() -> CaptionResult<Self> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> CaptionResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub async fn fetch_bytes(&self, url: &str) -> CaptionResult<Vec<u8>> {
        info!("Fetching image from {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!("Fetching {} failed: {}", url, e);
                e
            })?;

        let body = response.bytes().await?;
        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body.to_vec())
    }

    pub async fn fetch(&self, url: &str) -> CaptionResult<RgbImage> {
        let bytes = self.fetch_bytes(url).await?;
        decode_image(&bytes)
    }
}
