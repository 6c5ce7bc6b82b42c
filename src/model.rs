//! CLIP model wrapper using ONNX Runtime

use image::DynamicImage;
use ndarray::{concatenate, Array2, ArrayView2, ArrayView4, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use crate::config::{Config, RuntimeConfig};
use crate::download::ModelStore;
use crate::error::{ClipError, Result};
use crate::preprocess::{load_image, Preprocessor};
use crate::tokenizer::Tokenizer;

/// Embedding dimension of the ViT-B/32 encoders
pub const EMBEDDING_SIZE: usize = 512;

/// Turns preprocessed inputs into embeddings.
pub trait Encoder: Send + Sync {
    /// `pixels` is `[n, 3, 224, 224]`; returns `[n, dim]`.
    fn encode_images(&self, pixels: ArrayView4<f32>) -> Result<Array2<f32>>;

    /// `tokens` is `[n, 77]`; returns `[n, dim]`.
    fn encode_texts(&self, tokens: ArrayView2<i32>) -> Result<Array2<f32>>;
}

/// Image and text encoder sessions
pub struct OnnxEncoder {
    image: Mutex<Session>,
    text: Mutex<Session>,
    image_input: String,
    text_input: String,
}

impl OnnxEncoder {
    pub fn load(image_model: &Path, text_model: &Path, runtime: &RuntimeConfig) -> Result<Self> {
        let image = build_session(image_model, runtime.intra_threads)?;
        let text = build_session(text_model, runtime.intra_threads)?;

        Ok(Self {
            image: Mutex::new(image),
            text: Mutex::new(text),
            image_input: runtime.image_input.clone(),
            text_input: runtime.text_input.clone(),
        })
    }
}

fn build_session(path: &Path, intra_threads: usize) -> Result<Session> {
    let name = path.display().to_string();
    tracing::debug!(model = %name, intra_threads, "Building ONNX session");

    commit_session(path, intra_threads).map_err(|e| ClipError::model_load(name, format!("{e:#}")))
}

fn commit_session(path: &Path, intra_threads: usize) -> anyhow::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

impl Encoder for OnnxEncoder {
    fn encode_images(&self, pixels: ArrayView4<f32>) -> Result<Array2<f32>> {
        let shape = pixels.shape();
        let dims = [shape[0], shape[1], shape[2], shape[3]];
        let data: Vec<f32> = pixels.iter().copied().collect();

        let input_tensor = Tensor::from_array((dims, data.into_boxed_slice()))
            .map_err(|e| ClipError::inference("image", e))?;

        let mut session = self
            .image
            .lock()
            .map_err(|e| ClipError::inference("image", format!("failed to lock model: {e}")))?;

        let outputs = session
            .run(ort::inputs![self.image_input.as_str() => input_tensor])
            .map_err(|e| ClipError::inference("image", e))?;

        let embedding_output = outputs.iter().next().ok_or_else(|| ClipError::InvalidOutput {
            model: "image".to_string(),
            message: "no outputs".to_string(),
        })?;

        let (out_shape, out_data) = embedding_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| ClipError::inference("image", e))?;

        to_embeddings("image", &out_shape, out_data)
    }

    fn encode_texts(&self, tokens: ArrayView2<i32>) -> Result<Array2<f32>> {
        let dims = [tokens.nrows(), tokens.ncols()];
        let data: Vec<i32> = tokens.iter().copied().collect();

        let input_tensor = Tensor::from_array((dims, data.into_boxed_slice()))
            .map_err(|e| ClipError::inference("text", e))?;

        let mut session = self
            .text
            .lock()
            .map_err(|e| ClipError::inference("text", format!("failed to lock model: {e}")))?;

        let outputs = session
            .run(ort::inputs![self.text_input.as_str() => input_tensor])
            .map_err(|e| ClipError::inference("text", e))?;

        let embedding_output = outputs.iter().next().ok_or_else(|| ClipError::InvalidOutput {
            model: "text".to_string(),
            message: "no outputs".to_string(),
        })?;

        let (out_shape, out_data) = embedding_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| ClipError::inference("text", e))?;

        to_embeddings("text", &out_shape, out_data)
    }
}

/// Reshape a raw `[n, dim]` output tensor.
fn to_embeddings(model: &str, shape: &[i64], data: &[f32]) -> Result<Array2<f32>> {
    match shape {
        [rows, cols] if *rows >= 0 && *cols >= 0 => {
            Ok(Array2::from_shape_vec((*rows as usize, *cols as usize), data.to_vec())?)
        }
        _ => Err(ClipError::InvalidOutput {
            model: model.to_string(),
            message: format!("expected a [batch, dim] tensor, got shape {shape:?}"),
        }),
    }
}

/// CLIP embeddings for images and texts
pub struct OnnxClip {
    encoder: Box<dyn Encoder>,
    preprocessor: Preprocessor,
    tokenizer: Tokenizer,
    batch_size: Option<usize>,
}

impl OnnxClip {
    /// Load the models named in `config`, downloading any that are missing.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let models = &config.models;
        let silent = config.runtime.silent_download;
        let store = ModelStore::new(&models.dir);

        let image_path = store.ensure(&models.image_model, &models.image_model_url(), silent)?;
        let text_path = store.ensure(&models.text_model, &models.text_model_url(), silent)?;
        let merges_path = store.ensure(&models.merges_file, &models.merges_url, silent)?;

        let encoder = OnnxEncoder::load(&image_path, &text_path, &config.runtime)?;
        let tokenizer = Tokenizer::from_merges_file(&merges_path)?;

        tracing::info!(models = ?store.dir(), batch_size = ?config.runtime.batch_size, "CLIP models loaded");

        Self::with_encoder(Box::new(encoder), tokenizer, config.runtime.batch_size)
    }

    pub fn with_encoder(
        encoder: Box<dyn Encoder>,
        tokenizer: Tokenizer,
        batch_size: Option<usize>,
    ) -> Result<Self> {
        if batch_size == Some(0) {
            return Err(ClipError::Config("batch_size must be at least 1".into()));
        }

        Ok(Self {
            encoder,
            preprocessor: Preprocessor::new(),
            tokenizer,
            batch_size,
        })
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    fn chunk_size(&self, total: usize, with_batching: bool) -> usize {
        match self.batch_size {
            Some(size) if with_batching => size,
            _ => total,
        }
    }

    /// Embed `images`, returning one `[dim]` row per image in input order.
    pub fn get_image_embeddings(
        &self,
        images: &[DynamicImage],
        with_batching: bool,
    ) -> Result<Array2<f32>> {
        if images.is_empty() {
            return Ok(Array2::zeros((0, EMBEDDING_SIZE)));
        }

        let chunk = self.chunk_size(images.len(), with_batching);
        let mut parts = Vec::with_capacity(images.len().div_ceil(chunk));

        for batch in images.chunks(chunk) {
            tracing::debug!(batch = batch.len(), "Encoding image batch");
            let pixels = self.preprocessor.encode_images(batch)?;
            let embeddings = self.encoder.encode_images(pixels.view())?;
            check_rows("image", batch.len(), &embeddings)?;
            parts.push(embeddings);
        }

        stack(parts)
    }

    /// Embed `texts`, returning one `[dim]` row per text in input order.
    pub fn get_text_embeddings<S: AsRef<str>>(
        &self,
        texts: &[S],
        with_batching: bool,
    ) -> Result<Array2<f32>> {
        if texts.is_empty() {
            return Ok(Array2::zeros((0, EMBEDDING_SIZE)));
        }

        let chunk = self.chunk_size(texts.len(), with_batching);
        let mut parts = Vec::with_capacity(texts.len().div_ceil(chunk));

        for batch in texts.chunks(chunk) {
            tracing::debug!(batch = batch.len(), "Encoding text batch");
            let tokens = self.tokenizer.encode_text_with_padding(batch)?;
            let embeddings = self.encoder.encode_texts(tokens.view())?;
            check_rows("text", batch.len(), &embeddings)?;
            parts.push(embeddings);
        }

        stack(parts)
    }

    pub fn get_image_embeddings_from_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
        with_batching: bool,
    ) -> Result<Array2<f32>> {
        let images = paths
            .iter()
            .map(|p| load_image(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.get_image_embeddings(&images, with_batching)
    }
}

fn check_rows(model: &str, expected: usize, embeddings: &Array2<f32>) -> Result<()> {
    if embeddings.nrows() != expected {
        return Err(ClipError::InvalidOutput {
            model: model.to_string(),
            message: format!("expected {} rows, got {}", expected, embeddings.nrows()),
        });
    }
    Ok(())
}

fn stack(mut parts: Vec<Array2<f32>>) -> Result<Array2<f32>> {
    if parts.len() == 1 {
        return Ok(parts.remove(0));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Image embedding: mean of each channel. Text embedding: (first token, length).
    struct FakeEncoder {
        calls: Arc<AtomicUsize>,
    }

    impl Encoder for FakeEncoder {
        fn encode_images(&self, pixels: ArrayView4<f32>) -> Result<Array2<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = pixels.shape()[0];
            let mut out = Array2::zeros((n, 3));
            for i in 0..n {
                for c in 0..3 {
                    out[[i, c]] = pixels.slice(ndarray::s![i, c, .., ..]).mean().unwrap_or(0.0);
                }
            }
            Ok(out)
        }

        fn encode_texts(&self, tokens: ArrayView2<i32>) -> Result<Array2<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = Array2::zeros((tokens.nrows(), 2));
            for (i, row) in tokens.rows().into_iter().enumerate() {
                out[[i, 0]] = row[1] as f32;
                out[[i, 1]] = row.iter().filter(|&&t| t != 0).count() as f32;
            }
            Ok(out)
        }
    }

    struct ShortEncoder;

    impl Encoder for ShortEncoder {
        fn encode_images(&self, _pixels: ArrayView4<f32>) -> Result<Array2<f32>> {
            Ok(Array2::zeros((1, 4)))
        }

        fn encode_texts(&self, _tokens: ArrayView2<i32>) -> Result<Array2<f32>> {
            Ok(Array2::zeros((1, 4)))
        }
    }

    const MERGES: &str = "#version: 0.2\nc a\nca t</w>\nd o\ndo g</w>\n";

    fn clip(batch_size: Option<usize>) -> (OnnxClip, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let encoder = FakeEncoder {
            calls: Arc::clone(&calls),
        };
        let tokenizer = Tokenizer::from_merges_str(MERGES).unwrap();
        let clip = OnnxClip::with_encoder(Box::new(encoder), tokenizer, batch_size).unwrap();
        (clip, calls)
    }

    fn gray(level: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(30, 30, Rgb([level, level, level])))
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let tokenizer = Tokenizer::from_merges_str(MERGES).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = OnnxClip::with_encoder(Box::new(FakeEncoder { calls }), tokenizer, Some(0));
        assert!(matches!(result, Err(ClipError::Config(_))));
    }

    #[test]
    fn test_empty_inputs_skip_encoder() {
        let (clip, calls) = clip(Some(2));

        let images = clip.get_image_embeddings(&[], true).unwrap();
        assert_eq!(images.shape(), &[0, EMBEDDING_SIZE]);

        let texts = clip.get_text_embeddings::<&str>(&[], true).unwrap();
        assert_eq!(texts.shape(), &[0, EMBEDDING_SIZE]);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_image_batches_preserve_order() {
        let (clip, calls) = clip(Some(2));
        let images = vec![gray(0), gray(255), gray(0), gray(255), gray(0)];

        let batched = clip.get_image_embeddings(&images, true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(batched.shape(), &[5, 3]);
        assert!(batched[[1, 0]] > batched[[0, 0]]);
        assert!(batched[[3, 0]] > batched[[4, 0]]);

        let single = clip.get_image_embeddings(&images, false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(batched.shape(), single.shape());
        for (a, b) in batched.iter().zip(single.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_no_batch_size_runs_once() {
        let (clip, calls) = clip(None);
        let texts = ["cat", "dog", "a cat", "a dog"];

        let embeddings = clip.get_text_embeddings(&texts, true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(embeddings.shape(), &[4, 2]);
    }

    #[test]
    fn test_text_batches_preserve_order() {
        let (clip, calls) = clip(Some(3));
        let texts = ["cat", "dog", "a cat", "a dog"];

        let embeddings = clip.get_text_embeddings(&texts, true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let cat = clip.tokenizer().encode("cat")[0] as f32;
        let dog = clip.tokenizer().encode("dog")[0] as f32;
        assert_eq!(embeddings[[0, 0]], cat);
        assert_eq!(embeddings[[1, 0]], dog);
        // sot, a, cat, eot
        assert_eq!(embeddings[[2, 1]], 4.0);
        assert_eq!(embeddings[[3, 1]], 4.0);
    }

    #[test]
    fn test_text_too_long_propagates() {
        let (clip, _) = clip(None);
        let long: String = (0..100).map(|i| i.to_string()).collect();
        let err = clip.get_text_embeddings(&[long], true).unwrap_err();
        assert!(matches!(err, ClipError::TextTooLong { .. }));
    }

    #[test]
    fn test_row_count_mismatch() {
        let tokenizer = Tokenizer::from_merges_str(MERGES).unwrap();
        let clip = OnnxClip::with_encoder(Box::new(ShortEncoder), tokenizer, None).unwrap();

        let err = clip.get_image_embeddings(&[gray(1), gray(2)], true).unwrap_err();
        assert!(matches!(err, ClipError::InvalidOutput { .. }));
    }

    #[test]
    fn test_embeddings_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])).save(&path).unwrap();

        let (clip, _) = clip(None);
        let embeddings = clip.get_image_embeddings_from_files(&[&path], true).unwrap();
        assert_eq!(embeddings.nrows(), 1);

        let missing = clip.get_image_embeddings_from_files(&[dir.path().join("nope.png")], true);
        assert!(missing.is_err());
    }

    #[test]
    fn test_to_embeddings_shape() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = to_embeddings("image", &[2, 3], &data).unwrap();
        assert_eq!(out[[1, 0]], 4.0);

        assert!(to_embeddings("image", &[6], &data).is_err());
        assert!(to_embeddings("image", &[4, 4], &data).is_err());
    }
}
