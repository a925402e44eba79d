//! Application Configuration
//!
//! Service settings stored in TOML format. The model's own parameters
//! (input size, charset) live in a separate JSON document, see [`model`].

pub mod model;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::recognition::{EngineOptions, ValidationRules};

pub use model::ModelConfig;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Model file locations
    pub model: ModelSettings,
    /// Input limits and worker settings
    pub inference: InferenceSettings,
    /// HTTP server settings
    pub server: ServerSettings,
}

/// Model file locations and runtime options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// ONNX model file
    pub model_path: PathBuf,
    /// JSON model configuration (input size, charset)
    pub model_config_path: PathBuf,
    /// Expected SHA-256 of the model file, checked at startup when set
    pub model_sha256: Option<String>,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("resources/models/best_model.onnx"),
            model_config_path: PathBuf::from("resources/config/model_config.json"),
            model_sha256: None,
            intra_threads: 4,
        }
    }
}

impl ModelSettings {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            intra_threads: self.intra_threads.max(1),
            expected_sha256: self
                .model_sha256
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Prediction limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Smallest accepted image width and height
    pub min_dimension: u32,
    /// Largest accepted image file in bytes
    pub max_image_bytes: u64,
    /// Accepted file extensions
    pub allowed_extensions: Vec<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Background workers for multi-file predictions
    pub workers: usize,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        let rules = ValidationRules::default();
        Self {
            min_dimension: rules.min_dimension,
            max_image_bytes: rules.max_bytes,
            allowed_extensions: rules.allowed_extensions,
            timeout_secs: 10,
            workers: 2,
        }
    }
}

impl InferenceSettings {
    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules {
            allowed_extensions: self
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            min_dimension: self.min_dimension,
            max_bytes: self.max_image_bytes,
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load the config file if present, otherwise fall back to defaults
pub fn load_or_default(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let config = load_config(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    } else {
        info!("No configuration at {:?}, using defaults", path);
        Ok(AppConfig::default())
    }
}

/// Default location of the TOML configuration
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}
