use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ndarray::{s, Array2, Array3, Axis};
use ort::{
    session::builder::GraphOptimizationLevel,
    session::Session,
    value::{Tensor, TensorRef},
};

#[cfg(target_os = "macos")]
use ort::{
    execution_providers::coreml::CoreMLComputeUnits,
    execution_providers::CoreMLExecutionProvider,
};

#[cfg(target_os = "windows")]
use ort::{
    execution_providers::CPUExecutionProvider,
    execution_providers::CUDAExecutionProvider,
};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;

use super::beam_search::BeamSearch;
use super::download::{DECODER_FILE, ENCODER_FILE, TOKENIZER_FILE};
use super::image_process::CaptionImageProcessor;
use crate::config::GenerationConfig;
use crate::engine::CaptionEngine;

// GPT-2 uses <|endoftext|> both to start and to end a caption.
const ENDOFTEXT: &str = "<|endoftext|>";
const ENDOFTEXT_TOKEN_ID: u32 = 50256;

/// ViT encoder + GPT-2 decoder captioning model on ONNX Runtime.
///
/// Sessions sit behind mutexes so a single loaded instance can serve every
/// session in the process.
pub struct OnnxCaptioner {
    tokenizer: Tokenizer,
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    decoder_wants_encoder_mask: bool,
    special_token_id: u32,
    image_processor: CaptionImageProcessor,
}

impl OnnxCaptioner {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let init_start_time = Instant::now();
        tracing::info!("Loading caption model from {}", data_dir.display());

        let _ = ort::init()
            .with_name("image-captioner")
            .commit()
            .map_err(|e| {
                tracing::debug!("ONNX Runtime already initialized or failed: {:?}", e);
            });

        let tokenizer = Tokenizer::from_file(data_dir.join(TOKENIZER_FILE))
            .map_err(|e| anyhow!("Error loading tokenizer: {:?}", e))?;
        let special_token_id = tokenizer.token_to_id(ENDOFTEXT).unwrap_or(ENDOFTEXT_TOKEN_ID);

        let create_session = |model_path: &str| -> Result<Session> {
            let model_start = Instant::now();
            #[allow(unused_mut)]
            let mut builder = Session::builder()
                .map_err(|e| anyhow!("Session builder error: {:?}", e))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| anyhow!("Optimization level error: {:?}", e))?;

            #[cfg(target_os = "macos")]
            {
                builder = builder
                    .with_execution_providers([CoreMLExecutionProvider::default()
                        .with_compute_units(CoreMLComputeUnits::CPUAndGPU)
                        .build()])
                    .map_err(|e| anyhow!("CoreML execution provider error: {:?}", e))?;
                tracing::info!("Using CoreML execution provider for {}", model_path);
            }

            #[cfg(target_os = "windows")]
            {
                builder = builder
                    .with_execution_providers([
                        CUDAExecutionProvider::default().build(),
                        CPUExecutionProvider::default().build(),
                    ])
                    .map_err(|e| anyhow!("CUDA/CPU execution provider error: {:?}", e))?;
                tracing::info!("Using CUDA + CPU execution providers for {}", model_path);
            }

            #[cfg(not(any(target_os = "macos", target_os = "windows")))]
            tracing::info!("Using CPU execution provider for {}", model_path);

            let session = builder
                .commit_from_file(data_dir.join(model_path))
                .map_err(|e| anyhow!("Model loading error for {}: {:?}", model_path, e))?;

            tracing::info!(
                "Model {} loaded in {:.2}s",
                model_path,
                model_start.elapsed().as_secs_f32()
            );
            Ok(session)
        };

        let encoder = create_session(ENCODER_FILE)?;
        let decoder = create_session(DECODER_FILE)?;
        let decoder_wants_encoder_mask = decoder
            .inputs
            .iter()
            .any(|input| input.name == "encoder_attention_mask");

        tracing::info!(
            "Caption model ready in {:.2}s",
            init_start_time.elapsed().as_secs_f32()
        );

        Ok(Self {
            tokenizer,
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            decoder_wants_encoder_mask,
            special_token_id,
            image_processor: CaptionImageProcessor::new(),
        })
    }

    fn encode_image(&self, image: &RgbImage) -> Result<Array3<f32>> {
        let pixel_values = self.image_processor.preprocess(image)?;
        tracing::debug!("Encoder input shape: {:?}", pixel_values.shape());

        let mut encoder = self
            .encoder
            .lock()
            .map_err(|_| anyhow!("Encoder session lock poisoned"))?;
        let outputs = encoder.run(ort::inputs![
            "pixel_values" => Tensor::from_array(pixel_values)?,
        ])?;

        let output_name = if outputs.contains_key("last_hidden_state") {
            "last_hidden_state"
        } else {
            outputs
                .keys()
                .next()
                .ok_or_else(|| anyhow!("Encoder produced no outputs"))?
        };

        let hidden = outputs[output_name]
            .try_extract_array::<f32>()?
            .into_dimensionality::<ndarray::Ix3>()?
            .to_owned();
        tracing::debug!("Encoder output shape: {:?}", hidden.shape());
        Ok(hidden)
    }

    /// Next-token logits for each beam.
    fn decode_step(
        decoder: &mut Session,
        hidden: &Array3<f32>,
        wants_mask: bool,
        beams: &[Vec<u32>],
    ) -> Result<Vec<Vec<f32>>> {
        let batch = beams.len();
        let seq_len = beams[0].len();
        let input_ids = Array2::from_shape_fn((batch, seq_len), |(b, i)| beams[b][i] as i64);
        let views = vec![hidden.view(); batch];
        let encoder_hidden_states = ndarray::concatenate(Axis(0), &views)?;
        let encoder_mask: Array2<i64> = Array2::ones((batch, hidden.shape()[1]));

        let mut model_inputs = ort::inputs![
            "input_ids" => TensorRef::from_array_view(&input_ids)?,
            "encoder_hidden_states" => TensorRef::from_array_view(&encoder_hidden_states)?,
        ];
        if wants_mask {
            model_inputs.push((
                "encoder_attention_mask".into(),
                TensorRef::from_array_view(&encoder_mask)?.into(),
            ));
        }

        let outputs = decoder.run(model_inputs)?;
        let logits = outputs["logits"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<ndarray::Ix3>()?;

        let last = logits.shape()[1] - 1;
        Ok((0..batch)
            .map(|b| logits.slice(s![b, last, ..]).to_vec())
            .collect())
    }
}

impl CaptionEngine for OnnxCaptioner {
    fn generate(&self, image: &RgbImage, config: &GenerationConfig) -> Result<String> {
        let start_time = Instant::now();
        tracing::debug!(
            "Captioning {}x{} image with {:?}",
            image.width(),
            image.height(),
            config
        );

        let hidden = self.encode_image(image).context("Image encoding failed")?;
        let encode_time = start_time.elapsed();

        let mut decoder = self
            .decoder
            .lock()
            .map_err(|_| anyhow!("Decoder session lock poisoned"))?;
        let search = BeamSearch::new(config, self.special_token_id, self.special_token_id);
        let tokens = search
            .run(|beams| {
                Self::decode_step(&mut decoder, &hidden, self.decoder_wants_encoder_mask, beams)
            })
            .context("Caption decoding failed")?;
        drop(decoder);

        let caption = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("Decode error: {:?}", e))?;

        tracing::info!(
            "Caption generated in {:.2}s (encode: {:.2}s, {} tokens): {}",
            start_time.elapsed().as_secs_f32(),
            encode_time.as_secs_f32(),
            tokens.len(),
            caption.trim()
        );
        Ok(caption.trim().to_string())
    }
}
