use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use onnx_clip::{logging, similarity, Config, ModelStore, OnnxClip};

/// onnx-clip - CLIP image and text embeddings with ONNX Runtime
#[derive(Parser)]
#[command(name = "onnx-clip")]
#[command(author, version)]
struct Args {
    /// Path to config file
    #[arg(short, long, global = true, env = "ONNX_CLIP_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Run everything in one batch, ignoring runtime.batch_size
    #[arg(long, global = true)]
    no_batching: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the models and tokenizer merges
    Download,

    /// Print image embeddings as JSON
    EmbedImage {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print text embeddings as JSON
    EmbedText {
        #[arg(required = true)]
        texts: Vec<String>,
    },

    /// Score an image against text labels
    Classify {
        image: PathBuf,

        /// Candidate label (repeat for each label)
        #[arg(short, long = "label", required = true)]
        labels: Vec<String>,
    },
}

#[derive(Serialize)]
struct Embedding<'a> {
    input: &'a str,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct LabelScore<'a> {
    label: &'a str,
    probability: f32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };

    logging::init(config.log_dir.as_deref(), args.verbose)?;

    let with_batching = !args.no_batching;

    match args.command {
        Command::Download => {
            let models = &config.models;
            let store = ModelStore::new(&models.dir);
            let silent = config.runtime.silent_download;

            store.ensure(&models.image_model, &models.image_model_url(), silent)?;
            store.ensure(&models.text_model, &models.text_model_url(), silent)?;
            store.ensure(&models.merges_file, &models.merges_url, silent)?;

            println!("{}", store.dir().display());
        }
        Command::EmbedImage { paths } => {
            let clip = OnnxClip::new(&config)?;
            let embeddings = clip.get_image_embeddings_from_files(&paths, with_batching)?;

            let labels: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            let rows: Vec<Embedding> = labels
                .iter()
                .zip(embeddings.rows())
                .map(|(input, row)| Embedding {
                    input,
                    embedding: row.to_vec(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::EmbedText { texts } => {
            let clip = OnnxClip::new(&config)?;
            let embeddings = clip.get_text_embeddings(&texts, with_batching)?;

            let rows: Vec<Embedding> = texts
                .iter()
                .zip(embeddings.rows())
                .map(|(input, row)| Embedding {
                    input,
                    embedding: row.to_vec(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Classify { image, labels } => {
            let clip = OnnxClip::new(&config)?;
            let image_embeddings = clip.get_image_embeddings_from_files(&[&image], with_batching)?;
            let text_embeddings = clip.get_text_embeddings(&labels, with_batching)?;

            let logits =
                similarity::get_similarity_scores(image_embeddings.view(), text_embeddings.view())?;
            let probabilities = similarity::softmax(logits.view());

            let scores: Vec<LabelScore> = labels
                .iter()
                .zip(probabilities.row(0).iter())
                .map(|(label, p)| LabelScore {
                    label,
                    probability: *p,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&scores)?);
        }
    }

    Ok(())
}
