//! Image captioning with adjustable decoding and a session-local history.
//!
//! An image arrives from an upload, a URL or a preset example, a loaded
//! captioning model describes it, and the caption is appended to the
//! session's history, which can be exported as CSV.
//!
//! ## Usage
//!
//! ```no_run
//! use image_captioner::{CaptionClient, GenerationConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // 1. Load the model once per process
//!     let mut client = CaptionClient::new();
//!     client.initialize(None).await?;
//!
//!     // 2. Each user gets a session with its own history
//!     let mut session = client.session()?;
//!     session.set_config(GenerationConfig { num_beams: 5, ..Default::default() });
//!
//!     // 3. Resolve an image, then caption it
//!     let request = session.submit_upload(&std::fs::read("image.jpg")?);
//!     let record = session.generate(request).await.into_result()?;
//!     println!("{}", record.caption);
//!
//!     // 4. Snapshot the history
//!     std::fs::write("captions.csv", session.export()?.bytes)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod source;

pub use config::GenerationConfig;
pub use engine::{CaptionEngine, EngineHandle};
pub use error::{CaptionError, CaptionResult};
pub use history::{CaptionHistory, CaptionRecord, CsvExport};
pub use model::{download_caption_models, get_default_model_dir, OnnxCaptioner};
pub use pipeline::{CaptionRequest, CaptionSession, RequestState};
pub use source::{ExampleImage, ImageFetcher, ImageOrigin, EXAMPLE_IMAGES};

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Process-level owner of the loaded engine. Sessions borrow the engine
/// through [`CaptionClient::session`].
pub struct CaptionClient {
    engine: Option<EngineHandle>,
    model_path: Option<PathBuf>,
}

impl CaptionClient {
    pub fn new() -> Self {
        Self {
            engine: None,
            model_path: None,
        }
    }

    /// Wraps an already loaded engine.
    pub fn with_engine(engine: EngineHandle) -> Self {
        Self {
            engine: Some(engine),
            model_path: None,
        }
    }

    /// Loads the model, downloading it first when files are missing.
    ///
    /// # Arguments
    /// * `model_path` - model directory, `None` for the platform default
    ///
    /// The engine is loaded at most once; later calls are no-ops.
    pub async fn initialize(&mut self, model_path: Option<&str>) -> Result<()> {
        if self.engine.is_some() {
            tracing::debug!("Caption model already loaded, skipping initialize");
            return Ok(());
        }

        let path = match model_path {
            Some(path) => PathBuf::from(path),
            None => get_default_model_dir(),
        };

        if !model::models_present(&path) {
            tracing::info!("Model files missing in {}, downloading...", path.display());
            download_caption_models(&path).await?;
        }

        let load_path = path.clone();
        let engine = tokio::task::spawn_blocking(move || OnnxCaptioner::load(&load_path))
            .await
            .context("Model loading task failed")??;
        self.engine = Some(Arc::new(engine));
        self.model_path = Some(path);

        tracing::info!("Caption model initialized");
        Ok(())
    }

    /// A fresh session with empty history and default settings.
    pub fn session(&self) -> Result<CaptionSession> {
        let engine = self
            .engine
            .clone()
            .ok_or_else(|| anyhow!("Model not initialized, call initialize() first"))?;
        CaptionSession::new(engine)
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn get_model_path(&self) -> Option<&std::path::Path> {
        self.model_path.as_deref()
    }

    /// Drops this client's handle to the engine. Sessions still holding it
    /// keep it alive until they end.
    pub fn cleanup(&mut self) {
        if self.engine.take().is_some() {
            tracing::info!("Caption model released");
        }
        self.model_path = None;
    }
}

impl Default for CaptionClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: download if needed, load, and return a ready client.
pub async fn create_caption_client(model_path: Option<&str>) -> Result<CaptionClient> {
    let mut client = CaptionClient::new();
    client.initialize(model_path).await?;
    Ok(client)
}
