use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::GenerationConfig;
use crate::engine::EngineHandle;
use crate::error::{CaptionError, CaptionResult};
use crate::history::{CaptionHistory, CaptionRecord, CsvExport};
use crate::source::{decode_image, example_image, ImageFetcher, ImageOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    SourceResolved,
    Generating,
    Success,
    Failed,
}

#[derive(Debug)]
enum Stage {
    Idle,
    SourceResolved(RgbImage),
    Generating,
    Success(CaptionRecord),
    Failed(CaptionError),
}

/// One user action: resolve an image, then (on a separate command) caption it.
///
/// `Success` and `Failed` are terminal; a new action starts a new request.
#[derive(Debug)]
pub struct CaptionRequest {
    origin: ImageOrigin,
    stage: Stage,
}

impl CaptionRequest {
    fn new(origin: ImageOrigin) -> Self {
        Self {
            origin,
            stage: Stage::Idle,
        }
    }

    fn resolve(mut self, source: CaptionResult<RgbImage>) -> Self {
        self.stage = match source {
            Ok(image) => {
                debug!("Resolved {} to a {}x{} image", self.origin, image.width(), image.height());
                Stage::SourceResolved(image)
            }
            Err(e) => {
                warn!("Could not resolve {}: {}", self.origin, e);
                Stage::Failed(e)
            }
        };
        self
    }

    pub fn origin(&self) -> &ImageOrigin {
        &self.origin
    }

    pub fn state(&self) -> RequestState {
        match self.stage {
            Stage::Idle => RequestState::Idle,
            Stage::SourceResolved(_) => RequestState::SourceResolved,
            Stage::Generating => RequestState::Generating,
            Stage::Success(_) => RequestState::Success,
            Stage::Failed(_) => RequestState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::Success(_) | Stage::Failed(_))
    }

    /// The resolved image, available until generation starts.
    pub fn image(&self) -> Option<&RgbImage> {
        match &self.stage {
            Stage::SourceResolved(image) => Some(image),
            _ => None,
        }
    }

    pub fn record(&self) -> Option<&CaptionRecord> {
        match &self.stage {
            Stage::Success(record) => Some(record),
            _ => None,
        }
    }

    pub fn caption(&self) -> Option<&str> {
        self.record().map(|r| r.caption.as_str())
    }

    pub fn error(&self) -> Option<&CaptionError> {
        match &self.stage {
            Stage::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Outcome of a finished request. A request that was resolved but never
    /// passed to `generate` reports `NotGenerated`.
    pub fn into_result(self) -> CaptionResult<CaptionRecord> {
        match self.stage {
            Stage::Success(record) => Ok(record),
            Stage::Failed(e) => Err(e),
            _ => Err(CaptionError::NotGenerated(self.origin)),
        }
    }
}

/// Everything one interactive session owns: its history and the decoding
/// settings, plus handles to the shared engine and HTTP client.
///
/// Commands take `&mut self` where they mutate history, so two generations
/// can never interleave within a session.
pub struct CaptionSession {
    engine: EngineHandle,
    fetcher: ImageFetcher,
    history: CaptionHistory,
    config: GenerationConfig,
}

impl CaptionSession {
    pub fn new(engine: EngineHandle) -> Result<Self> {
        Ok(Self::with_fetcher(engine, ImageFetcher::new()?))
    }

    pub fn with_fetcher(engine: EngineHandle, fetcher: ImageFetcher) -> Self {
        Self {
            engine,
            fetcher,
            history: CaptionHistory::new(),
            config: GenerationConfig::default(),
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: GenerationConfig) {
        self.config = config.clamped();
    }

    pub fn history(&self) -> &CaptionHistory {
        &self.history
    }

    pub fn submit_upload(&self, bytes: &[u8]) -> CaptionRequest {
        CaptionRequest::new(ImageOrigin::Upload).resolve(decode_image(bytes))
    }

    pub async fn submit_url(&self, url: &str) -> CaptionRequest {
        let source = self.fetcher.fetch(url).await;
        CaptionRequest::new(ImageOrigin::Url(url.to_string())).resolve(source)
    }

    pub async fn submit_example(&self, id: usize) -> CaptionRequest {
        let source = match example_image(id) {
            Ok(example) => {
                info!("Using example #{}: {}", id, example.label);
                self.fetcher.fetch(example.url).await
            }
            Err(e) => Err(e),
        };
        CaptionRequest::new(ImageOrigin::Example(id)).resolve(source)
    }

    /// Runs the engine on a resolved request and records the caption.
    ///
    /// Terminal requests are returned untouched. History is only appended
    /// after the engine returned a caption.
    pub async fn generate(&mut self, mut request: CaptionRequest) -> CaptionRequest {
        let image = match std::mem::replace(&mut request.stage, Stage::Generating) {
            Stage::SourceResolved(image) => image,
            other => {
                request.stage = other;
                debug!("Request for {} is {:?}, nothing to generate", request.origin, request.state());
                return request;
            }
        };

        let config = self.config.clamped();
        let engine = self.engine.clone();
        let start = Instant::now();
        info!("Generating caption for {} with {:?}", request.origin, config);

        let outcome = tokio::task::spawn_blocking(move || engine.generate(&image, &config))
            .await
            .map_err(CaptionError::generation)
            .and_then(|r| r.map_err(|e| CaptionError::Generation(format!("{:#}", e))));

        request.stage = match outcome {
            Ok(caption) => {
                let record = self.history.append(caption, Utc::now()).clone();
                info!(
                    "Caption for {} ready in {:.2}s: {}",
                    request.origin,
                    start.elapsed().as_secs_f32(),
                    record.caption
                );
                Stage::Success(record)
            }
            Err(e) => {
                warn!("Caption generation for {} failed: {}", request.origin, e);
                Stage::Failed(e)
            }
        };
        request
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn export(&self) -> Result<CsvExport> {
        self.history.export()
    }
}
