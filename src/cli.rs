//! Command-line front end: predict files and inspect the loaded model

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ModelConfig;
use crate::recognition::{
    ImageInput, OnnxEngine, Prediction, PredictionResult, PredictionService, PredictionWorkers,
    ValidationRules,
};

/// Output format for `predict`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

/// One line of JSON output
#[derive(Debug, Serialize)]
struct PredictionLine<'a> {
    file: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prediction: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Replace directory arguments with the image files directly inside them.
///
/// Files found in a directory are filtered by extension and sorted by name;
/// explicit file arguments are kept as given.
pub fn collect_image_files(paths: &[PathBuf], rules: &ValidationRules) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if !path.is_dir() {
            files.push(path.clone());
            continue;
        }

        let mut found: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("Failed to read directory {:?}", path))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && rules.check_extension(&p.to_string_lossy()).is_ok())
            .collect();
        found.sort();

        if found.is_empty() {
            warn!("No image files in {:?}", path);
        }
        files.extend(found);
    }

    if files.is_empty() {
        bail!("No image files to predict");
    }
    Ok(files)
}

/// Predict every file and print the results in input order.
///
/// Fails when at least one file could not be predicted.
pub fn predict_files(
    service: Arc<PredictionService>,
    files: &[PathBuf],
    format: OutputFormat,
    batch: bool,
    workers: usize,
) -> Result<()> {
    let inputs: Vec<ImageInput> = files.iter().map(ImageInput::from_path).collect();

    let results: Vec<PredictionResult<Prediction>> = if batch {
        info!("Predicting {} file(s) in one batch", inputs.len());
        service.predict_batch(&inputs)
    } else if inputs.len() == 1 {
        vec![service.predict(&inputs[0])]
    } else {
        let pool = PredictionWorkers::spawn(service, workers.min(inputs.len()));
        let receivers: Vec<_> = inputs.into_iter().map(|input| pool.submit(input)).collect();
        receivers
            .into_iter()
            .map(|rx| {
                rx.recv().unwrap_or_else(|_| {
                    Err(crate::recognition::PredictionError::Inference(
                        "worker exited without a result".to_string(),
                    ))
                })
            })
            .collect()
    };

    let mut failures = 0;
    for (file, result) in files.iter().zip(&results) {
        if result.is_err() {
            failures += 1;
        }
        println!("{}", format_result(file, result, format));
    }

    if failures > 0 {
        bail!("{} of {} prediction(s) failed", failures, files.len());
    }
    Ok(())
}

/// Render one result in the requested format
pub fn format_result(file: &Path, result: &PredictionResult<Prediction>, format: OutputFormat) -> String {
    let name = file.display().to_string();
    match format {
        OutputFormat::Pretty => match result {
            Ok(p) => format!(
                "{}: {} ({:.2} ms, confidence {:.3})",
                name,
                if p.text.is_empty() { "<empty>" } else { p.text.as_str() },
                p.latency_ms,
                p.confidence
            ),
            Err(e) => {
                error!(file = %name, stage = e.stage(), "{}", e);
                format!("{}: error: {}", name, e)
            }
        },
        OutputFormat::Json => {
            let line = match result {
                Ok(p) => PredictionLine {
                    file: &name,
                    prediction: Some(p.text.as_str()),
                    inference_time: Some((p.latency_ms * 100.0).round() / 100.0),
                    confidence: Some(p.confidence),
                    error: None,
                },
                Err(e) => PredictionLine {
                    file: &name,
                    prediction: None,
                    inference_time: None,
                    confidence: None,
                    error: Some(e.to_string()),
                },
            };
            serde_json::to_string(&line).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
        }
    }
}

/// Print model and configuration details
pub fn print_info(engine: &OnnxEngine, model_config: &ModelConfig) {
    let input = engine.input_info();
    let output = engine.output_info();

    println!("Model:         {}", engine.model_path().display());
    println!("SHA-256:       {}", engine.sha256());
    println!("Input:         {} {:?}", input.name, input.shape);
    println!("Output:        {} {:?}", output.name, output.shape);
    println!(
        "Image size:    {}x{} (width x height)",
        model_config.image_width, model_config.image_height
    );
    println!(
        "Charset:       {} characters + blank",
        model_config.charset.chars().count()
    );
    println!(
        "Architecture:  hidden {} / heads {} / layers {} / dropout {}",
        model_config.hidden_size,
        model_config.attention_heads,
        model_config.transformer_layers,
        model_config.dropout
    );
    if let Some(accuracy) = &model_config.model_accuracy {
        println!(
            "Accuracy:      {:.2}% character, {:.2}% sequence",
            accuracy.character, accuracy.sequence
        );
    }
}
