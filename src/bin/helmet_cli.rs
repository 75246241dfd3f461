//! helmet_cli - offline access to the violation database and detector

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use helmet_witness::config::ServiceConfig;
use helmet_witness::detect::build_detector;
use helmet_witness::{
    FilesystemCropStore, ImageService, PageRequest, PredictionService, SqliteViolationStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the violation database (overrides config).
    #[arg(long, env = "HELMET_DB_PATH")]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store an image file for later prediction.
    Upload {
        path: PathBuf,
        /// Content type; guessed from the extension when omitted.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Run detection and violation recording for a stored image.
    Predict { image_id: String },
    /// List stored images.
    Images {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 10)]
        size: usize,
    },
    /// List recorded violations, newest first.
    Violations {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 10)]
        size: usize,
    },
    /// Delete an image together with its crops and violations.
    Delete { image_id: String },
    /// Remove all records and empty the image directories.
    Cleanup {
        /// Required to confirm the wipe.
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = ServiceConfig::load()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    let mut store = SqliteViolationStore::open(&config.db_path)?;
    let mut crops = FilesystemCropStore::new(&config.cropped_dir, &config.base_url);
    let images = ImageService::new(&config.upload_dir);

    match args.command {
        Command::Upload { path, content_type } => {
            let bytes = std::fs::read(&path)
                .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
            let content_type = match content_type {
                Some(value) => value,
                None => guess_content_type(&path)?,
            };
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("upload");
            let record = images.upload(&mut store, &bytes, filename, &content_type)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Predict { image_id } => {
            let detector = build_detector(&config.detector)?;
            let mut service = PredictionService::new(detector);
            let report = service.predict_image(&image_id, &mut store, &mut crops)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Images { page, size } => {
            let page = images.list_images(&mut store, PageRequest::new(page, size)?)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Violations { page, size } => {
            let page = images.list_violations(&mut store, PageRequest::new(page, size)?)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Delete { image_id } => {
            images.delete_image(&mut store, &mut crops, &image_id)?;
            println!("image {} deleted", image_id);
        }
        Command::Cleanup { yes } => {
            if !yes {
                return Err(anyhow!("cleanup removes every record; pass --yes to confirm"));
            }
            images.cleanup(&mut store, &config.cropped_dir)?;
            println!("database and image directories cleaned");
        }
    }
    Ok(())
}

fn guess_content_type(path: &std::path::Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let content_type = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => {
            return Err(anyhow!(
                "cannot guess content type of {}; pass --content-type",
                path.display()
            ))
        }
    };
    Ok(content_type.to_string())
}
