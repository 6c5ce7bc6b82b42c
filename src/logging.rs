//! Logging setup for the `onnx-clip` binary.
//!
//! Logs go to stderr by default. When a log directory is configured they go
//! to a daily rolling file there instead.
//!
//! Log level can be controlled via the `ONNX_CLIP_LOG` environment variable
//! (e.g. `ONNX_CLIP_LOG=debug`). Without it the level follows the `-v` count.

use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Result;

pub const LOG_ENV: &str = "ONNX_CLIP_LOG";

// Keeps the file writer flushing until process exit.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

pub fn init(log_dir: Option<&Path>, verbose: u8) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbose)));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;

            let file_appender = tracing_appender::rolling::daily(dir, "onnx-clip.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = GUARD.set(guard);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging initialized with file backend at {:?}", dir);
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
