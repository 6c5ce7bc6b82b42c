//! On-disk cache of model files, fetched over HTTP on first use.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{ClipError, Result};

pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("onnx_clip")
            .join("models")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub fn is_cached(&self, filename: &str) -> bool {
        self.path(filename).is_file()
    }

    /// Return the local path of `filename`, downloading it from `url` if it
    /// isn't cached yet.
    pub fn ensure(&self, filename: &str, url: &str, silent: bool) -> Result<PathBuf> {
        let path = self.path(filename);
        if path.is_file() {
            tracing::debug!(file = %filename, path = ?path, "Using cached model file");
            return Ok(path);
        }

        std::fs::create_dir_all(&self.dir)?;

        if silent {
            tracing::debug!(file = %filename, url = %url, "Downloading model file...");
        } else {
            tracing::info!(file = %filename, url = %url, "Downloading model file...");
        }

        let response = ureq::get(url).call().map_err(|e| ClipError::Download {
            file: filename.to_string(),
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let partial = self.dir.join(format!("{filename}.part"));
        let written = match write_to(&mut response.into_reader(), &partial) {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e.into());
            }
        };

        if written == 0 {
            let _ = std::fs::remove_file(&partial);
            return Err(ClipError::Download {
                file: filename.to_string(),
                url: url.to_string(),
                message: "empty response body".to_string(),
            });
        }

        std::fs::rename(&partial, &path)?;

        if silent {
            tracing::debug!(file = %filename, bytes = written, path = ?path, "Model file downloaded");
        } else {
            tracing::info!(file = %filename, bytes = written, path = ?path, "Model file downloaded");
        }

        Ok(path)
    }
}

fn write_to(reader: &mut dyn Read, path: &Path) -> std::io::Result<u64> {
    let mut file = File::create(path)?;
    let written = std::io::copy(reader, &mut file)?;
    file.flush()?;
    Ok(written)
}
