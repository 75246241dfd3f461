use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "helmet.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_UPLOAD_DIR: &str = "images";
const DEFAULT_CROPPED_DIR: &str = "cropped_images";
const DEFAULT_DETECTOR_URL: &str = "https://detect.roboflow.com/helm-motor-siter/2";
const DEFAULT_DETECTOR_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    db_path: Option<String>,
    api_addr: Option<String>,
    base_url: Option<String>,
    upload_dir: Option<PathBuf>,
    cropped_dir: Option<PathBuf>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: String,
    pub api_addr: String,
    /// Public base URL prefixed to crop URLs.
    pub base_url: String,
    pub upload_dir: PathBuf,
    pub cropped_dir: PathBuf,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Hosted endpoint, or `stub://[path]` for the stub backend.
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            api_addr: DEFAULT_API_ADDR.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            cropped_dir: PathBuf::from(DEFAULT_CROPPED_DIR),
            detector: DetectorSettings {
                url: DEFAULT_DETECTOR_URL.to_string(),
                api_key: String::new(),
                timeout: Duration::from_secs(DEFAULT_DETECTOR_TIMEOUT_SECS),
            },
        }
    }
}

impl ServiceConfig {
    /// Load from `HELMET_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HELMET_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let defaults = Self::default();
        let detector = file.detector.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            api_addr: file.api_addr.unwrap_or(defaults.api_addr),
            base_url: file.base_url.unwrap_or(defaults.base_url),
            upload_dir: file.upload_dir.unwrap_or(defaults.upload_dir),
            cropped_dir: file.cropped_dir.unwrap_or(defaults.cropped_dir),
            detector: DetectorSettings {
                url: detector.url.unwrap_or(defaults.detector.url),
                api_key: detector.api_key.unwrap_or(defaults.detector.api_key),
                timeout: detector
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.detector.timeout),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("HELMET_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_nonempty("HELMET_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = env_nonempty("HELMET_BASE_URL") {
            self.base_url = url;
        }
        if let Some(dir) = env_nonempty("HELMET_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("HELMET_CROPPED_DIR") {
            self.cropped_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_nonempty("HELMET_DETECTOR_URL") {
            self.detector.url = url;
        }
        if let Some(key) = env_nonempty("HELMET_DETECTOR_API_KEY") {
            self.detector.api_key = key;
        }
        if let Some(timeout) = env_nonempty("HELMET_DETECTOR_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("HELMET_DETECTOR_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.detector.timeout = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.detector.url.trim().is_empty() {
            return Err(anyhow!("detector url must not be empty"));
        }
        if self.detector.timeout.as_secs() == 0 {
            return Err(anyhow!("detector timeout must be greater than zero"));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| anyhow!("invalid base_url '{}': {}", self.base_url, e))?;
        self.base_url = self.base_url.trim_end_matches('/').to_string();
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
