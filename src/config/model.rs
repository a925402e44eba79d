//! Model configuration (JSON)
//!
//! Written next to the exported model. Only the input size and charset matter
//! for inference; the remaining fields describe how the network was built.
//!
//! Two layouts are accepted: flat, or with the keys grouped under `"data"`
//! and `"model"` objects.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{info, warn};

use crate::recognition::charset::DEFAULT_CHARSET;
use crate::recognition::{Charset, PreprocessConfig};

/// Reported training accuracy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAccuracy {
    pub character: f32,
    pub sequence: f32,
}

/// Parameters of the exported recognition model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub image_height: u32,
    pub image_width: u32,
    pub charset: String,
    pub hidden_size: usize,
    pub attention_heads: usize,
    #[serde(alias = "num_layers")]
    pub transformer_layers: usize,
    pub dropout: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_accuracy: Option<ModelAccuracy>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_height: 64,
            image_width: 256,
            charset: DEFAULT_CHARSET.to_string(),
            hidden_size: 512,
            attention_heads: 8,
            transformer_layers: 4,
            dropout: 0.1,
            model_accuracy: None,
        }
    }
}

impl ModelConfig {
    /// Parse either layout
    pub fn from_json(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)?;
        let Value::Object(mut root) = value else {
            anyhow::bail!("model config must be a JSON object");
        };

        let mut flat = Map::new();
        for section in ["model", "data"] {
            if let Some(Value::Object(entries)) = root.remove(section) {
                flat.extend(entries);
            }
        }
        // Top-level keys win over grouped ones
        flat.extend(root);

        Ok(serde_json::from_value(Value::Object(flat))?)
    }

    pub fn charset(&self) -> Result<Charset> {
        Charset::new(&self.charset).context("Invalid charset in model config")
    }

    pub fn preprocess_config(&self) -> PreprocessConfig {
        PreprocessConfig::new(self.image_height, self.image_width)
    }
}

/// Load the model config, using built-in defaults when the file is missing
pub fn load_model_config(path: &Path) -> Result<ModelConfig> {
    if !path.exists() {
        warn!("Model config {:?} not found, using defaults", path);
        return Ok(ModelConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read model config {:?}", path))?;
    let config = ModelConfig::from_json(&content)
        .with_context(|| format!("Failed to parse model config {:?}", path))?;

    if config.image_height == 0 || config.image_width == 0 {
        anyhow::bail!(
            "Model config {:?} has invalid image size {}x{}",
            path,
            config.image_width,
            config.image_height
        );
    }

    info!(
        "Loaded model config: {}x{} input, {} characters",
        config.image_width,
        config.image_height,
        config.charset.chars().count()
    );
    Ok(config)
}
