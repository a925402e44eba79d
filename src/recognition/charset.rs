//! Recognition vocabulary
//!
//! The model emits `len + 1` classes per time step: one per character plus a
//! trailing CTC blank.

use std::collections::HashSet;
use std::fmt;

use super::error::{PredictionError, PredictionResult};

/// Default charset of the shipped CAPTCHA model (digits, upper, lower)
pub const DEFAULT_CHARSET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Ordered set of unique characters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charset {
    chars: Vec<char>,
}

impl Charset {
    /// Build a charset, rejecting empty input and repeated characters
    pub fn new(chars: &str) -> PredictionResult<Self> {
        let charset = Self {
            chars: chars.chars().collect(),
        };
        if charset.is_empty() {
            return Err(PredictionError::Validation("charset is empty".to_string()));
        }

        let mut seen = HashSet::new();
        if let Some(c) = charset.chars.iter().find(|&&c| !seen.insert(c)) {
            return Err(PredictionError::Validation(format!(
                "charset contains duplicate character {:?}",
                c
            )));
        }

        Ok(charset)
    }

    /// Number of real characters (excludes blank)
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Index of the CTC blank class
    pub fn blank_index(&self) -> usize {
        self.chars.len()
    }

    /// Number of classes the model must output
    pub fn num_classes(&self) -> usize {
        self.chars.len() + 1
    }

    /// Character for a class index, `None` for blank and anything out of range
    pub fn get(&self, index: usize) -> Option<char> {
        self.chars.get(index).copied()
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self {
            chars: DEFAULT_CHARSET.chars().collect(),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.chars {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}
