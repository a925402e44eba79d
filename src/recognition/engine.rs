//! Model execution
//!
//! The network is an opaque `(N, 3, H, W) -> (N, T, C)` function behind the
//! [`ModelRunner`] trait. [`OnnxEngine`] binds it to ONNX Runtime. Output is
//! returned as the model produced it; its rank is checked when decoding.

use anyhow::{bail, Context, Result};
use ndarray::{Array4, ArrayD, ArrayView4, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::{PredictionError, PredictionResult};

/// Anything that can run the recognition graph
pub trait ModelRunner: Send + Sync {
    /// Raw forward pass over a batch
    fn forward(&self, input: ArrayView4<'_, f32>) -> PredictionResult<ArrayD<f32>>;

    /// Declared input shape, `-1` for dynamic axes
    fn input_shape(&self) -> Option<Vec<i64>> {
        None
    }

    /// Declared output shape, `-1` for dynamic axes
    fn output_shape(&self) -> Option<Vec<i64>> {
        None
    }

    /// Number of output classes when the model declares it statically
    fn num_classes(&self) -> Option<usize> {
        self.output_shape()
            .and_then(|shape| shape.last().copied())
            .filter(|&classes| classes > 0)
            .map(|classes| classes as usize)
    }

    /// Single image inference
    fn run(&self, tensor: &Array4<f32>) -> PredictionResult<ArrayD<f32>> {
        let batch = tensor.shape()[0];
        if batch != 1 {
            return Err(PredictionError::Inference(format!(
                "single-image inference needs batch size 1, got {}",
                batch
            )));
        }

        self.forward(tensor.view())
    }
}

/// Check a concrete tensor shape against a declared one
pub fn check_input_shape(declared: &[i64], actual: &[usize]) -> PredictionResult<()> {
    if declared.len() != actual.len() {
        return Err(PredictionError::Inference(format!(
            "model expects rank {} input {:?}, got rank {} {:?}",
            declared.len(),
            declared,
            actual.len(),
            actual
        )));
    }

    for (axis, (&want, &got)) in declared.iter().zip(actual).enumerate() {
        if want >= 0 && want as usize != got {
            return Err(PredictionError::Inference(format!(
                "input axis {} must be {}, got {} (expected {:?}, got {:?})",
                axis, want, got, declared, actual
            )));
        }
    }

    Ok(())
}

/// Options for loading an ONNX model
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Intra-op thread count for ONNX Runtime
    pub intra_threads: usize,
    /// Expected lowercase hex SHA-256 of the model file
    pub expected_sha256: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            intra_threads: 4,
            expected_sha256: None,
        }
    }
}

/// Tensor shape information
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<i64>,
}

/// ONNX Runtime session wrapper
pub struct OnnxEngine {
    /// `Session::run` needs `&mut`, so concurrent callers are serialized
    session: Mutex<Session>,
    input: TensorInfo,
    output: TensorInfo,
    model_path: PathBuf,
    sha256: String,
}

impl OnnxEngine {
    /// Load the model once at startup
    pub fn load(model_path: &Path, options: &EngineOptions) -> Result<Self> {
        if !model_path.exists() {
            bail!("Model not found: {}", model_path.display());
        }

        info!("Loading ONNX model from {:?}", model_path);

        let sha256 = file_sha256(model_path)?;
        if let Some(expected) = options.expected_sha256.as_deref() {
            if !expected.eq_ignore_ascii_case(&sha256) {
                bail!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    model_path.display(),
                    expected,
                    sha256
                );
            }
            info!("Checksum verified for {:?}", model_path);
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(options.intra_threads)?
            .commit_from_file(model_path)
            .context("Failed to load ONNX model")?;

        let input = session
            .inputs
            .first()
            .map(|input| TensorInfo {
                name: input.name.clone(),
                shape: extract_shape(&input.input_type),
            })
            .context("Model declares no inputs")?;

        let output = session
            .outputs
            .first()
            .map(|output| TensorInfo {
                name: output.name.clone(),
                shape: extract_shape(&output.output_type),
            })
            .context("Model declares no outputs")?;

        info!(
            "Model loaded. Input: {} {:?}, Output: {} {:?}",
            input.name, input.shape, output.name, output.shape
        );

        Ok(Self {
            session: Mutex::new(session),
            input,
            output,
            model_path: model_path.to_path_buf(),
            sha256,
        })
    }

    pub fn input_info(&self) -> &TensorInfo {
        &self.input
    }

    pub fn output_info(&self) -> &TensorInfo {
        &self.output
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// SHA-256 of the loaded model file
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

impl ModelRunner for OnnxEngine {
    fn forward(&self, input: ArrayView4<'_, f32>) -> PredictionResult<ArrayD<f32>> {
        if !self.input.shape.is_empty() {
            check_input_shape(&self.input.shape, input.shape())?;
        }

        let tensor = Tensor::from_array(input.as_standard_layout().into_owned())?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![self.input.name.as_str() => tensor])?;
        let (shape, data) = outputs[self.output.name.as_str()].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        debug!("Forward pass produced logits {:?}", dims);

        ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())
            .map_err(|e| PredictionError::Inference(e.to_string()))
    }

    fn input_shape(&self) -> Option<Vec<i64>> {
        Some(self.input.shape.clone())
    }

    fn output_shape(&self) -> Option<Vec<i64>> {
        Some(self.output.shape.clone())
    }
}

/// Extract shape from ONNX value type
fn extract_shape(value_type: &ort::value::ValueType) -> Vec<i64> {
    if let Some(shape) = value_type.tensor_shape() {
        shape.iter().copied().collect()
    } else {
        vec![]
    }
}

/// Hex SHA-256 of a file
pub fn file_sha256(path: &Path) -> Result<String> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read model file {:?}", path))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}
