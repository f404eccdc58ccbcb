//! Feature-extraction backends.
//!
//! The engine treats the model as an opaque capability: image bytes in,
//! fixed-length vector out. `ModelLoader` builds a backend for one named
//! configuration; the fastembed implementation downloads the ONNX weights on
//! first use.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fastembed::{ImageEmbedding, ImageInitOptions};

use crate::engine::errors::BackendError;

/// A loaded model able to turn image bytes into an embedding.
pub trait ModelBackend: Send + Sync {
    /// Configuration name this backend was loaded from.
    fn name(&self) -> &str;

    /// Length of every vector this backend produces.
    fn dimensions(&self) -> usize;

    fn extract(&self, image: &[u8]) -> Result<Vec<f32>, BackendError>;
}

/// Builds a backend for one named model configuration.
pub trait ModelLoader: Send + Sync {
    fn load(&self, configuration: &str) -> Result<Arc<dyn ModelBackend>, BackendError>;
}

/// Loads CLIP-family image models through fastembed.
pub struct FastembedLoader {
    cache_dir: PathBuf,
    show_download_progress: bool,
}

impl FastembedLoader {
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(cache_dir: PathBuf, show_download_progress: bool) -> Self {
        Self {
            cache_dir,
            show_download_progress,
        }
    }
}

impl ModelLoader for FastembedLoader {
    fn load(&self, configuration: &str) -> Result<Arc<dyn ModelBackend>, BackendError> {
        let model_enum = parse_model_name(configuration)?;

        let models_dir = self.cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            BackendError::other(format!("Failed to create models directory: {e}"))
        })?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(self.show_download_progress);

        let mut model =
            ImageEmbedding::try_new(options).map_err(|e| BackendError::new(e.to_string()))?;

        let dimensions = probe_dimensions(&mut model)?;
        log::debug!("model '{configuration}' produces {dimensions}-dimensional vectors");

        Ok(Arc::new(FastembedBackend {
            model: Mutex::new(model),
            name: configuration.to_string(),
            dimensions,
        }))
    }
}

/// Wrapper around fastembed's ImageEmbedding.
/// Uses a Mutex because fastembed's embed calls require &mut self.
pub struct FastembedBackend {
    model: Mutex<ImageEmbedding>,
    name: String,
    dimensions: usize,
}

impl ModelBackend for FastembedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn extract(&self, image: &[u8]) -> Result<Vec<f32>, BackendError> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| BackendError::other(format!("Failed to acquire model lock: {e}")))?;

        let embeddings = model
            .embed_bytes(&[image], None)
            .map_err(|e| BackendError::new(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::other("No embedding returned"))
    }
}

/// Parse a configuration name to fastembed's model enum.
fn parse_model_name(name: &str) -> Result<fastembed::ImageEmbeddingModel, BackendError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
        "resnet50" | "resnet-50" => Ok(fastembed::ImageEmbeddingModel::Resnet50),
        "unicom-vit-b-16" | "unicomvitb16" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB16),
        "unicom-vit-b-32" | "unicomvitb32" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB32),
        "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
            Ok(fastembed::ImageEmbeddingModel::NomicEmbedVisionV15)
        }
        _ => Err(BackendError::other(format!(
            "Unknown model: {name}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5"
        ))),
    }
}

/// Embed a generated test image to learn the output dimensions.
fn probe_dimensions(model: &mut ImageEmbedding) -> Result<usize, BackendError> {
    let probe = probe_image()?;
    let embeddings = model
        .embed_bytes(&[probe.as_slice()], None)
        .map_err(|e| BackendError::new(format!("Failed to probe dimensions: {e}")))?;

    embeddings
        .first()
        .map(|v| v.len())
        .filter(|len| *len > 0)
        .ok_or_else(|| BackendError::other("Model returned no embedding"))
}

fn probe_image() -> Result<Vec<u8>, BackendError> {
    let img = image::RgbImage::from_fn(64, 64, |x, y| {
        image::Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
    });

    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageFormat::Png)
        .map_err(|e| BackendError::other(format!("Failed to encode probe image: {e}")))?;
    Ok(buffer.into_inner())
}
