//! Greedy CTC decoding
//!
//! Per time step the highest scoring class is taken, adjacent repeats are
//! collapsed, blanks are removed and the surviving class indices are mapped
//! through the charset. Indices the charset cannot map are dropped instead of
//! failing, so a model with a slightly wider class axis still decodes.

use ndarray::{ArrayView1, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix2, Ix3};

use super::charset::Charset;
use super::error::{PredictionError, PredictionResult};

/// Text of one decoded sequence with its confidence
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub text: String,
    /// Mean max-probability of the emitted steps
    pub confidence: f32,
}

/// Greedy CTC decoder bound to a charset
#[derive(Debug, Clone)]
pub struct CtcDecoder {
    charset: Charset,
}

impl CtcDecoder {
    pub fn new(charset: Charset) -> Self {
        Self { charset }
    }

    pub fn charset(&self) -> &Charset {
        &self.charset
    }

    /// Index of the blank class (`len(charset)`)
    pub fn blank_index(&self) -> usize {
        self.charset.blank_index()
    }

    /// Decode a single `(T, C)` logit matrix
    pub fn decode(&self, logits: ArrayView2<'_, f32>) -> PredictionResult<String> {
        let indices = best_path(logits)?;
        Ok(self.indices_to_text(&indices))
    }

    /// Mean max-probability over the emitted steps.
    ///
    /// When nothing is emitted the mean runs over every step; an empty
    /// sequence has confidence 0.
    pub fn confidence(&self, logits: ArrayView2<'_, f32>) -> PredictionResult<f32> {
        let indices = best_path(logits)?;
        if indices.is_empty() {
            return Ok(0.0);
        }

        let step_probs: Vec<f32> = logits
            .axis_iter(Axis(0))
            .zip(&indices)
            .map(|(row, &idx)| log_softmax(row)[idx].exp())
            .collect();

        let emitted: Vec<f32> = self
            .emitted_steps(&indices)
            .into_iter()
            .map(|t| step_probs[t])
            .collect();

        Ok(if emitted.is_empty() {
            mean(&step_probs)
        } else {
            mean(&emitted)
        })
    }

    pub fn decode_with_confidence(&self, logits: ArrayView2<'_, f32>) -> PredictionResult<Decoded> {
        Ok(Decoded {
            text: self.decode(logits)?,
            confidence: self.confidence(logits)?,
        })
    }

    /// Decode a `(N, T, C)` batch, each sequence independently
    pub fn decode_batch(&self, logits: ArrayView3<'_, f32>) -> PredictionResult<Vec<Decoded>> {
        logits
            .axis_iter(Axis(0))
            .map(|sequence| self.decode_with_confidence(sequence))
            .collect()
    }

    /// Decode raw model output of rank 2 `(T, C)` or rank 3 `(N, T, C)`
    pub fn decode_dyn(&self, logits: ArrayViewD<'_, f32>) -> PredictionResult<Vec<Decoded>> {
        match logits.ndim() {
            2 => {
                let view = logits
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| PredictionError::Decoding(e.to_string()))?;
                Ok(vec![self.decode_with_confidence(view)?])
            }
            3 => {
                let view = logits
                    .into_dimensionality::<Ix3>()
                    .map_err(|e| PredictionError::Decoding(e.to_string()))?;
                self.decode_batch(view)
            }
            n => Err(PredictionError::Decoding(format!(
                "expected logits of rank 2 or 3, got rank {} with shape {:?}",
                n,
                logits.shape()
            ))),
        }
    }

    /// Collapse repeats, drop blanks, map through the charset
    pub fn indices_to_text(&self, indices: &[usize]) -> String {
        self.emitted_steps(indices)
            .into_iter()
            .filter_map(|t| self.charset.get(indices[t]))
            .collect()
    }

    /// Time steps whose index survives the repeat collapse and blank removal
    fn emitted_steps(&self, indices: &[usize]) -> Vec<usize> {
        let blank = self.blank_index();
        indices
            .iter()
            .enumerate()
            .filter(|&(t, &idx)| (t == 0 || idx != indices[t - 1]) && idx != blank)
            .map(|(t, _)| t)
            .collect()
    }
}

/// Argmax class per time step of a `(T, C)` matrix
pub fn best_path(logits: ArrayView2<'_, f32>) -> PredictionResult<Vec<usize>> {
    let (steps, classes) = logits.dim();
    if steps > 0 && classes == 0 {
        return Err(PredictionError::Decoding(format!(
            "logits have {} time steps but no classes",
            steps
        )));
    }

    Ok(logits.axis_iter(Axis(0)).map(argmax).collect())
}

/// Index of the first maximum; NaN never beats a finite score
fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &value) in row.iter().enumerate() {
        if value > best_value {
            best = i;
            best_value = value;
        }
    }
    best
}

/// Numerically stable log-softmax of one row
pub fn log_softmax(row: ArrayView1<'_, f32>) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let shifted: Vec<f32> = row.iter().map(|&v| v - max).collect();
    let log_sum_exp = shifted.iter().map(|v| v.exp()).sum::<f32>().ln();
    shifted.into_iter().map(|v| v - log_sum_exp).collect()
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}
