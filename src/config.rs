use anyhow::{Context, Result};
use directories::ProjectDirs;
use faceseek_vision::{model, DetectOptions};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::reference::ReferenceMode;

static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
    Lazy::new(|| ProjectDirs::from("", "", "faceseek"));

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACESEEK_CONFIG_PATH") {
    Some(path) => PathBuf::from(path),
    None => PROJECT_DIRS
        .as_ref()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("faceseek.toml")),
});

pub static MODEL_DIR: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACESEEK_MODEL_DIR") {
    Some(path) => PathBuf::from(path),
    None => PROJECT_DIRS
        .as_ref()
        .map(|dirs| dirs.data_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from("models")),
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum cosine similarity for a match, in (0, 1]
    pub threshold: f32,
    pub max_faces: usize,
    pub workers: usize,
    /// Longest image side fed to the detector
    pub max_dimension: u32,
    pub reference_mode: ReferenceMode,
    pub store: PathBuf,
    pub detector_model: PathBuf,
    pub recognizer_model: PathBuf,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub fetch_workers: usize,
    pub fetch_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            max_faces: 15,
            workers: num_cpus::get(),
            max_dimension: crate::preprocess::MAX_DIMENSION,
            reference_mode: ReferenceMode::Mean,
            store: PathBuf::from("embeddings.json"),
            detector_model: MODEL_DIR.join(model::DETECTOR_MODEL_FILE),
            recognizer_model: MODEL_DIR.join(model::RECOGNIZER_MODEL_FILE),
            score_threshold: 0.6,
            nms_threshold: 0.3,
            fetch_workers: 8,
            fetch_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            score_threshold: self.score_threshold,
            nms_threshold: self.nms_threshold,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.threshold)?;
        if self.max_faces == 0 {
            anyhow::bail!("max_faces must be at least 1");
        }
        if self.max_dimension == 0 {
            anyhow::bail!("max_dimension must be at least 1");
        }
        Ok(())
    }
}

pub fn validate_threshold(threshold: f32) -> Result<()> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidThreshold(threshold).into())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data).with_context(|| format!("writing config {}", path.display()))?;
    Ok(())
}
