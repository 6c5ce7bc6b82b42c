use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::download::ModelStore;
use crate::error::{ClipError, Result};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "ONNX_CLIP_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Write logs to a rolling file in this directory instead of stderr.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsConfig {
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_image_model")]
    pub image_model: String,

    #[serde(default = "default_text_model")]
    pub text_model: String,

    #[serde(default = "default_merges_file")]
    pub merges_file: String,

    #[serde(default = "default_merges_url")]
    pub merges_url: String,
}

fn default_models_dir() -> PathBuf {
    ModelStore::default_dir()
}

fn default_base_url() -> String {
    "https://lakera-clip.s3.eu-west-1.amazonaws.com".to_string()
}

fn default_image_model() -> String {
    "clip_image_model_vitb32.onnx".to_string()
}

fn default_text_model() -> String {
    "clip_text_model_vitb32.onnx".to_string()
}

fn default_merges_file() -> String {
    "clip_merges.txt".to_string()
}

fn default_merges_url() -> String {
    "https://huggingface.co/openai/clip-vit-base-patch32/resolve/main/merges.txt".to_string()
}

impl ModelsConfig {
    pub fn image_model_url(&self) -> String {
        join_url(&self.base_url, &self.image_model)
    }

    pub fn text_model_url(&self) -> String {
        join_url(&self.base_url, &self.text_model)
    }
}

fn join_url(base: &str, file: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file)
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
            base_url: default_base_url(),
            image_model: default_image_model(),
            text_model: default_text_model(),
            merges_file: default_merges_file(),
            merges_url: default_merges_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Split embedding requests into chunks of this many inputs.
    /// Unset runs every request in a single call.
    #[serde(default)]
    pub batch_size: Option<usize>,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    /// Input tensor name of the image encoder
    #[serde(default = "default_image_input")]
    pub image_input: String,

    /// Input tensor name of the text encoder
    #[serde(default = "default_text_input")]
    pub text_input: String,

    /// Log downloads at debug instead of info level
    #[serde(default)]
    pub silent_download: bool,
}

fn default_intra_threads() -> usize {
    4
}

fn default_image_input() -> String {
    "IMAGE".to_string()
}

fn default_text_input() -> String {
    "TEXT".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            intra_threads: default_intra_threads(),
            image_input: default_image_input(),
            text_input: default_text_input(),
            silent_download: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            runtime: RuntimeConfig::default(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file if none exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.batch_size == Some(0) {
            return Err(ClipError::Config("runtime.batch_size must be at least 1".into()));
        }
        if self.runtime.intra_threads == 0 {
            return Err(ClipError::Config("runtime.intra_threads must be at least 1".into()));
        }
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("onnx_clip")
    }

    pub fn config_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::config_dir().join("config.toml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [runtime]
            batch_size = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.batch_size, Some(8));
        assert_eq!(config.runtime.image_input, "IMAGE");
        assert_eq!(config.models.image_model, "clip_image_model_vitb32.onnx");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.runtime.batch_size = Some(16);
        config.models.dir = dir.path().join("models");
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runtime]\nbatch_size = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ClipError::Config(_)));
    }

    #[test]
    fn test_default_models_dir_matches_store() {
        assert_eq!(ModelsConfig::default().dir, ModelStore::default_dir());
    }

    #[test]
    fn test_model_urls() {
        let mut models = ModelsConfig::default();
        models.base_url = "https://example.com/clip/".to_string();
        assert_eq!(
            models.image_model_url(),
            "https://example.com/clip/clip_image_model_vitb32.onnx"
        );
        assert_eq!(
            models.text_model_url(),
            "https://example.com/clip/clip_text_model_vitb32.onnx"
        );
    }
}
