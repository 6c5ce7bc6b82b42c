//! CLIP (Contrastive Language-Image Pre-training) embeddings with ONNX Runtime
//!
//! Maps images and texts into a shared 512-dimensional space:
//! - [`Preprocessor`] turns images into normalized NCHW tensors
//! - [`Tokenizer`] is the CLIP byte-level BPE tokenizer
//! - [`OnnxClip`] runs the image and text encoders
//! - [`similarity`] scores embeddings against each other
//!
//! ```no_run
//! use onnx_clip::{Config, OnnxClip, similarity};
//!
//! let clip = OnnxClip::new(&Config::default())?;
//! let image = image::open("cat.jpg")?;
//! let images = clip.get_image_embeddings(&[image], true)?;
//! let texts = clip.get_text_embeddings(&["a photo of a cat", "a photo of a dog"], true)?;
//!
//! let logits = similarity::get_similarity_scores(images.view(), texts.view())?;
//! let probabilities = similarity::softmax(logits.view());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod model;
pub mod preprocess;
pub mod similarity;
pub mod tokenizer;

pub use config::Config;
pub use download::ModelStore;
pub use error::{ClipError, Result};
pub use model::{Encoder, OnnxClip, OnnxEncoder, EMBEDDING_SIZE};
pub use preprocess::Preprocessor;
pub use tokenizer::{Tokenizer, CONTEXT_LENGTH};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
