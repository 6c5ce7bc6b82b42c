use thiserror::Error;

/// Result type for onnx-clip operations
pub type Result<T> = std::result::Result<T, ClipError>;

/// Errors produced while preprocessing, tokenizing or running the CLIP models
#[derive(Error, Debug)]
pub enum ClipError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding failed
    #[error("Failed to load image: {0}")]
    Image(#[from] image::ImageError),

    /// Image can't be fed to the preprocessor
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Model download failed
    #[error("Failed to download '{file}' from {url}: {message}")]
    Download {
        file: String,
        url: String,
        message: String,
    },

    /// ONNX session construction failed
    #[error("Failed to load model '{model}': {message}")]
    ModelLoad { model: String, message: String },

    /// ONNX session run failed
    #[error("Inference failed for {model} encoder: {message}")]
    Inference { model: String, message: String },

    /// Model produced something other than a [batch, dim] tensor
    #[error("Unexpected output from {model} encoder: {message}")]
    InvalidOutput { model: String, message: String },

    /// Tokenized text exceeds the context length
    #[error("Input {text:?} is too long for context length {context_length}")]
    TextTooLong { text: String, context_length: usize },

    /// Merges file or vocabulary problem
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Arrays with incompatible dimensions
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClipError {
    pub fn model_load(model: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ModelLoad {
            model: model.into(),
            message: message.to_string(),
        }
    }

    pub fn inference(model: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Inference {
            model: model.into(),
            message: message.to_string(),
        }
    }

    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<ndarray::ShapeError> for ClipError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::shape_mismatch("compatible array shape", err.to_string())
    }
}

impl From<toml::de::Error> for ClipError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ClipError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}
