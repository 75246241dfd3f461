//! helmetd - HTTP service for helmet violation detection
//!
//! This daemon:
//! 1. Loads `ServiceConfig` (file from HELMET_CONFIG, then env overrides)
//! 2. Opens the violation database and builds the detector
//! 3. Serves the HTTP API until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use helmet_witness::api::{ApiConfig, ApiServer, AppState};
use helmet_witness::config::ServiceConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::load()?;
    let state = AppState::from_config(&config)?;
    log::info!(
        "detector backend: {}, crops under {} served from {}",
        state.predictions.detector_name(),
        config.cropped_dir.display(),
        config.base_url
    );

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, state).spawn()?;
    log::info!("helmet api listening on {}", api_handle.addr);
    log::info!("helmetd running. serving {}", config.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("helmetd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
