//! Recognition pipeline
//!
//! Turns CAPTCHA images into text:
//! - input validation (extension, size, dimensions)
//! - ImageNet preprocessing into a `(1, 3, H, W)` tensor
//! - forward pass through the ONNX model
//! - greedy CTC decoding

pub mod charset;
pub mod ctc;
pub mod engine;
pub mod error;
pub mod preprocess;
pub mod service;
pub mod validation;
pub mod workers;

pub use charset::Charset;
pub use ctc::CtcDecoder;
pub use engine::{EngineOptions, ModelRunner, OnnxEngine};
pub use error::{PredictionError, PredictionResult};
pub use preprocess::PreprocessConfig;
pub use service::{Prediction, PredictionService};
pub use validation::{ImageInput, ValidationRules};
pub use workers::PredictionWorkers;
