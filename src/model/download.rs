use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Captioning model file information
pub(crate) struct ModelFile {
    pub(crate) name: &'static str,
    url: &'static str,
    size_mb: f32,
}

pub(crate) const ENCODER_FILE: &str = "encoder_model.onnx";
pub(crate) const DECODER_FILE: &str = "decoder_model.onnx";
pub(crate) const TOKENIZER_FILE: &str = "tokenizer.json";

pub(crate) const CAPTION_MODELS: &[ModelFile] = &[
    ModelFile {
        name: ENCODER_FILE,
        url: "https://huggingface.co/Xenova/vit-gpt2-image-captioning/resolve/main/onnx/encoder_model.onnx",
        size_mb: 343.0,
    },
    ModelFile {
        name: DECODER_FILE,
        url: "https://huggingface.co/Xenova/vit-gpt2-image-captioning/resolve/main/onnx/decoder_model.onnx",
        size_mb: 612.0,
    },
    ModelFile {
        name: TOKENIZER_FILE,
        url: "https://huggingface.co/Xenova/vit-gpt2-image-captioning/resolve/main/tokenizer.json",
        size_mb: 2.1,
    },
];

/// True when every model file is present in `model_dir`.
pub fn models_present(model_dir: &Path) -> bool {
    CAPTION_MODELS
        .iter()
        .all(|m| model_dir.join(m.name).exists())
}

/// Download the captioning models to the specified directory
pub async fn download_caption_models(model_dir: &Path) -> Result<()> {
    info!("Starting caption model download to: {}", model_dir.display());

    fs::create_dir_all(model_dir)
        .with_context(|| format!("Failed to create model directory: {}", model_dir.display()))?;

    let client = Client::new();
    let total_size: f32 = CAPTION_MODELS.iter().map(|m| m.size_mb).sum();
    info!(
        "Total download size: {:.1} GB ({} files)",
        total_size / 1024.0,
        CAPTION_MODELS.len()
    );

    for (index, model) in CAPTION_MODELS.iter().enumerate() {
        let file_path = model_dir.join(model.name);

        if file_path.exists() {
            info!("Model {} already exists, skipping", model.name);
            continue;
        }

        info!(
            "[{}/{}] Downloading {} ({:.1} MB)...",
            index + 1,
            CAPTION_MODELS.len(),
            model.name,
            model.size_mb
        );

        if let Err(e) = download_file(&client, model.url, &file_path).await {
            error!("Failed to download {}: {:#}", model.name, e);
            // A partial file would pass the exists() check on the next run.
            let _ = tokio::fs::remove_file(&file_path).await;
            return Err(e);
        }
        info!("Successfully downloaded {}", model.name);
    }

    info!("Caption models stored at: {}", model_dir.display());
    Ok(())
}

async fn download_file(client: &Client, url: &str, dest_path: &Path) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to request {}", url))?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!("Download failed with status: {}", response.status()));
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded = 0u64;
    let mut next_report = 0u64;
    let mut stream = response.bytes_stream();

    let mut file = tokio::fs::File::create(dest_path)
        .await
        .with_context(|| format!("Failed to create file: {}", dest_path.display()))?;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;

        file.write_all(&chunk)
            .await
            .context("Error writing to file")?;

        downloaded += chunk.len() as u64;

        if total_size > 0 && (downloaded >= next_report || downloaded == total_size) {
            next_report = downloaded + 10 * 1024 * 1024;
            info!(
                "Download progress: {:.1}% ({:.1} MB / {:.1} MB)",
                (downloaded as f64 / total_size as f64) * 100.0,
                downloaded as f64 / (1024.0 * 1024.0),
                total_size as f64 / (1024.0 * 1024.0)
            );
        }
    }

    file.flush().await.context("Failed to flush file")?;

    Ok(())
}

/// Get the default model directory using system-standard locations
pub fn get_default_model_dir() -> PathBuf {
    let model_dir = if cfg!(target_os = "macos") {
        // macOS: ~/Library/Caches/ImageCaptioner/models
        dirs::cache_dir().map(|cache| cache.join("ImageCaptioner").join("models"))
    } else if cfg!(target_os = "windows") {
        // Windows: %APPDATA%\ImageCaptioner\models
        dirs::config_dir().map(|config| config.join("ImageCaptioner").join("models"))
    } else {
        // Linux: ~/.local/share/image-captioner/models
        dirs::data_local_dir().map(|data| data.join("image-captioner").join("models"))
    }
    .unwrap_or_else(|| PathBuf::from("data/captioner"));

    if let Err(e) = std::fs::create_dir_all(&model_dir) {
        info!(
            "Could not create model directory {}, falling back to local: {}",
            model_dir.display(),
            e
        );
        let fallback = PathBuf::from("data/captioner");
        if std::fs::create_dir_all(&fallback).is_err() {
            PathBuf::from(".")
        } else {
            fallback
        }
    } else {
        model_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_present_requires_every_file() {
        let dir = std::env::temp_dir().join(format!("captioner-models-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        assert!(!models_present(&dir));

        for model in CAPTION_MODELS {
            fs::write(dir.join(model.name), b"stub").unwrap();
        }
        assert!(models_present(&dir));

        fs::remove_file(dir.join(TOKENIZER_FILE)).unwrap();
        assert!(!models_present(&dir));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_model_urls_match_file_names() {
        for model in CAPTION_MODELS {
            assert!(model.url.ends_with(model.name), "{}", model.url);
        }
    }
}
