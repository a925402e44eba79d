//! Prediction orchestration
//!
//! validate -> preprocess -> forward pass (timed) -> CTC decode

use anyhow::{bail, Result};
use ndarray::{Array4, ArrayViewD};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::charset::Charset;
use super::ctc::{CtcDecoder, Decoded};
use super::engine::ModelRunner;
use super::error::{PredictionError, PredictionResult};
use super::preprocess::{self, PreprocessConfig};
use super::validation::{ImageInput, ValidationRules};

/// Outcome of one successful prediction
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Decoded CAPTCHA text, possibly empty
    pub text: String,
    /// Wall-clock time of the forward pass only
    pub latency_ms: f64,
    /// Mean max-probability of the emitted characters
    pub confidence: f32,
}

/// Loaded model plus everything needed to turn images into text
pub struct PredictionService {
    runner: Arc<dyn ModelRunner>,
    decoder: CtcDecoder,
    preprocess: PreprocessConfig,
    rules: ValidationRules,
}

impl PredictionService {
    /// Build the service, refusing a charset the model cannot produce
    pub fn new(
        runner: Arc<dyn ModelRunner>,
        charset: Charset,
        preprocess: PreprocessConfig,
        rules: ValidationRules,
    ) -> Result<Self> {
        if let Some(classes) = runner.num_classes() {
            if classes != charset.num_classes() {
                bail!(
                    "Charset has {} characters but the model outputs {} classes (expected {})",
                    charset.len(),
                    classes,
                    charset.num_classes()
                );
            }
        } else {
            warn!("Model output classes are dynamic; charset size will be checked per prediction");
        }

        Ok(Self {
            runner,
            decoder: CtcDecoder::new(charset),
            preprocess,
            rules,
        })
    }

    pub fn charset(&self) -> &Charset {
        self.decoder.charset()
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    pub fn preprocess_config(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    /// Predict the text of a single image
    pub fn predict(&self, input: &ImageInput) -> PredictionResult<Prediction> {
        let tensor = self.prepare(input)?;

        let start = Instant::now();
        let logits = self.runner.run(&tensor)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let Decoded { text, confidence } = self
            .decode(logits.view(), 1)?
            .pop()
            .ok_or_else(|| PredictionError::Decoding("model returned no sequence".into()))?;
        debug!(
            input = %input.name(),
            text = %text,
            latency_ms,
            confidence,
            "Prediction complete"
        );

        Ok(Prediction {
            text,
            latency_ms,
            confidence,
        })
    }

    /// Predict several images with one forward pass.
    ///
    /// Results keep input order; inputs failing validation or preprocessing
    /// carry their own error and are left out of the batch.
    pub fn predict_batch(&self, inputs: &[ImageInput]) -> Vec<PredictionResult<Prediction>> {
        let prepared: Vec<PredictionResult<Array4<f32>>> =
            inputs.iter().map(|input| self.prepare(input)).collect();

        let tensors: Vec<Array4<f32>> = prepared
            .iter()
            .filter_map(|r| r.as_ref().ok().cloned())
            .collect();

        let mut outcomes = if tensors.is_empty() {
            Ok(Vec::new().into_iter())
        } else {
            self.run_batch(&tensors).map(Vec::into_iter)
        };

        prepared
            .into_iter()
            .map(|r| {
                r.and_then(|_| match &mut outcomes {
                    Ok(items) => items.next().ok_or_else(|| {
                        PredictionError::Inference("model returned fewer results than inputs".into())
                    }),
                    Err(err) => Err(err.clone()),
                })
            })
            .collect()
    }

    fn run_batch(&self, tensors: &[Array4<f32>]) -> PredictionResult<Vec<Prediction>> {
        let batch = preprocess::stack_batch(tensors)?;

        let start = Instant::now();
        let logits = self.runner.forward(batch.view())?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        Ok(self
            .decode(logits.view(), tensors.len())?
            .into_iter()
            .map(|Decoded { text, confidence }| Prediction {
                text,
                latency_ms,
                confidence,
            })
            .collect())
    }

    /// Decode raw model output holding `expected` sequences
    fn decode(&self, logits: ArrayViewD<'_, f32>, expected: usize) -> PredictionResult<Vec<Decoded>> {
        let decoded = self.decoder.decode_dyn(logits.view())?;
        self.check_classes(logits.shape().last().copied().unwrap_or(0))?;

        if decoded.len() != expected {
            return Err(PredictionError::Inference(format!(
                "model returned {} sequence(s) for {} image(s)",
                decoded.len(),
                expected
            )));
        }
        Ok(decoded)
    }

    fn prepare(&self, input: &ImageInput) -> PredictionResult<Array4<f32>> {
        let data = self.rules.validate(input)?;
        preprocess::preprocess(&data, self.preprocess.target_height, self.preprocess.target_width)
    }

    fn check_classes(&self, classes: usize) -> PredictionResult<()> {
        let expected = self.decoder.charset().num_classes();
        if classes != expected {
            return Err(PredictionError::Validation(format!(
                "Charset/model size mismatch: model outputs {} classes, charset needs {}",
                classes, expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use ndarray::{Array3, ArrayD, ArrayView4};
    use parking_lot::Mutex;
    use std::io::Cursor;

    /// Mock model emitting a fixed argmax path for every image in the batch
    pub(crate) struct PathRunner {
        pub path: Vec<usize>,
        pub classes: usize,
        pub declared_classes: Option<usize>,
        pub seen_shapes: Mutex<Vec<Vec<usize>>>,
    }

    impl PathRunner {
        pub(crate) fn new(path: Vec<usize>, classes: usize) -> Self {
            Self {
                path,
                classes,
                declared_classes: Some(classes),
                seen_shapes: Mutex::new(Vec::new()),
            }
        }
    }

    impl ModelRunner for PathRunner {
        fn forward(&self, input: ArrayView4<'_, f32>) -> PredictionResult<ArrayD<f32>> {
            self.seen_shapes.lock().push(input.shape().to_vec());
            let batch = input.shape()[0];
            let mut logits = Array3::<f32>::zeros((batch, self.path.len(), self.classes));
            for n in 0..batch {
                for (t, &idx) in self.path.iter().enumerate() {
                    logits[[n, t, idx]] = 10.0;
                }
            }
            Ok(logits.into_dyn())
        }

        fn output_shape(&self) -> Option<Vec<i64>> {
            self.declared_classes.map(|c| vec![-1, self.path.len() as i64, c as i64])
        }
    }

    /// Mock model returning the same output for any input
    pub(crate) struct RawRunner {
        pub output: ArrayD<f32>,
    }

    impl ModelRunner for RawRunner {
        fn forward(&self, _input: ArrayView4<'_, f32>) -> PredictionResult<ArrayD<f32>> {
            Ok(self.output.clone())
        }
    }

    pub(crate) fn gray_png(width: u32, height: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(width, height, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn service_with(runner: PathRunner, charset: &str) -> PredictionService {
        PredictionService::new(
            Arc::new(runner),
            Charset::new(charset).unwrap(),
            PreprocessConfig::new(64, 256),
            ValidationRules::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_end_to_end_with_mock_model() {
        let charset = "ABCDE";
        let blank = charset.len();
        let runner = PathRunner::new(vec![blank, 0, 0, blank, 1, blank, 2, 2, blank], blank + 1);
        let service = service_with(runner, charset);

        let input = ImageInput::from_bytes("captcha.png", gray_png(256, 64));
        let prediction = service.predict(&input).unwrap();

        assert_eq!(prediction.text, "ABC");
        assert!(prediction.latency_ms >= 0.0);
        assert!(prediction.confidence > 0.99);
    }

    #[test]
    fn test_model_receives_normalized_shape() {
        let runner = Arc::new(PathRunner::new(vec![0], 3));
        let service = PredictionService::new(
            runner.clone(),
            Charset::new("AB").unwrap(),
            PreprocessConfig::new(64, 256),
            ValidationRules::default(),
        )
        .unwrap();

        service
            .predict(&ImageInput::from_bytes("odd.jpg.png", gray_png(37, 90)))
            .unwrap();

        assert_eq!(runner.seen_shapes.lock().as_slice(), &[vec![1, 3, 64, 256]]);
    }

    #[test]
    fn test_validation_failure_skips_model() {
        let runner = Arc::new(PathRunner::new(vec![0], 3));
        let service = PredictionService::new(
            runner.clone(),
            Charset::new("AB").unwrap(),
            PreprocessConfig::new(64, 256),
            ValidationRules::default(),
        )
        .unwrap();

        let err = service
            .predict(&ImageInput::from_bytes("small.png", gray_png(5, 5)))
            .unwrap_err();

        assert!(matches!(err, PredictionError::Validation(_)));
        assert!(runner.seen_shapes.lock().is_empty());
    }

    #[test]
    fn test_charset_mismatch_at_startup() {
        let runner = PathRunner::new(vec![0], 10);
        let result = PredictionService::new(
            Arc::new(runner),
            Charset::new("AB").unwrap(),
            PreprocessConfig::default(),
            ValidationRules::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_charset_mismatch_with_dynamic_classes() {
        let mut runner = PathRunner::new(vec![0, 1], 10);
        runner.declared_classes = None;
        let service = service_with(runner, "AB");

        let err = service
            .predict(&ImageInput::from_bytes("a.png", gray_png(40, 20)))
            .unwrap_err();
        assert!(matches!(err, PredictionError::Validation(ref msg) if msg.contains("mismatch")));
    }

    #[test]
    fn test_predict_batch_keeps_order_and_errors() {
        let runner = Arc::new(PathRunner::new(vec![1, 2, 0], 3));
        let service = PredictionService::new(
            runner.clone(),
            Charset::new("AB").unwrap(),
            PreprocessConfig::new(32, 128),
            ValidationRules::default(),
        )
        .unwrap();

        let inputs = vec![
            ImageInput::from_bytes("one.png", gray_png(100, 30)),
            ImageInput::from_bytes("two.gif", gray_png(100, 30)),
            ImageInput::from_bytes("three.png", gray_png(50, 50)),
        ];

        let results = service.predict_batch(&inputs);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().text, "BA");
        assert!(matches!(results[1], Err(PredictionError::Validation(_))));
        assert_eq!(results[2].as_ref().unwrap().text, "BA");
        // One forward pass with the two valid images
        assert_eq!(runner.seen_shapes.lock().as_slice(), &[vec![2, 3, 32, 128]]);
    }

    #[test]
    fn test_predict_batch_all_invalid() {
        let service = service_with(PathRunner::new(vec![0], 3), "AB");
        let results = service.predict_batch(&[ImageInput::from_bytes("x.gif", vec![1])]);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_wrong_rank_output_is_decoding_error() {
        let runner = RawRunner {
            output: ArrayD::zeros(vec![1, 1, 4, 3]),
        };
        let service = PredictionService::new(
            Arc::new(runner),
            Charset::new("AB").unwrap(),
            PreprocessConfig::new(32, 128),
            ValidationRules::default(),
        )
        .unwrap();

        let err = service
            .predict(&ImageInput::from_bytes("a.png", gray_png(40, 20)))
            .unwrap_err();
        assert!(matches!(err, PredictionError::Decoding(_)));

        let results = service.predict_batch(&[ImageInput::from_bytes("a.png", gray_png(40, 20))]);
        assert!(matches!(results[0], Err(PredictionError::Decoding(_))));
    }

    #[test]
    fn test_rank_two_output_is_one_sequence() {
        let mut output = ArrayD::<f32>::zeros(vec![3, 3]);
        output[[0, 1]] = 4.0;
        output[[1, 2]] = 4.0;
        output[[2, 0]] = 4.0;
        let service = PredictionService::new(
            Arc::new(RawRunner { output }),
            Charset::new("AB").unwrap(),
            PreprocessConfig::new(32, 128),
            ValidationRules::default(),
        )
        .unwrap();

        let prediction = service
            .predict(&ImageInput::from_bytes("a.png", gray_png(40, 20)))
            .unwrap();
        assert_eq!(prediction.text, "BA");
    }

    #[test]
    fn test_sequence_count_must_match_inputs() {
        let runner = RawRunner {
            output: ArrayD::zeros(vec![2, 4, 3]),
        };
        let service = PredictionService::new(
            Arc::new(runner),
            Charset::new("AB").unwrap(),
            PreprocessConfig::new(32, 128),
            ValidationRules::default(),
        )
        .unwrap();

        let err = service
            .predict(&ImageInput::from_bytes("a.png", gray_png(40, 20)))
            .unwrap_err();
        assert!(matches!(err, PredictionError::Inference(_)));
    }
}
