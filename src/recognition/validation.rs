//! Input checks run before any pixel decoding

use image::ImageReader;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use super::error::{PredictionError, PredictionResult};

/// Image accepted by the prediction pipeline
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Local image file
    Path(PathBuf),
    /// Uploaded bytes together with the client's file name
    Bytes { file_name: String, data: Vec<u8> },
}

impl ImageInput {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn from_bytes(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Bytes {
            file_name: file_name.into(),
            data,
        }
    }

    /// Name used for extension checks and logging
    pub fn name(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes { file_name, .. } => file_name.clone(),
        }
    }
}

/// Validation limits
#[derive(Debug, Clone)]
pub struct ValidationRules {
    /// Lowercase extensions without the dot
    pub allowed_extensions: Vec<String>,
    /// Smallest accepted width and height
    pub min_dimension: u32,
    /// Largest accepted encoded size
    pub max_bytes: u64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
            min_dimension: 10,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ValidationRules {
    /// Reject names whose extension is not allowed
    pub fn check_extension(&self, name: &str) -> PredictionResult<()> {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if self.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            Ok(())
        } else {
            Err(PredictionError::Validation(format!(
                "Invalid file type. Allowed types: {}",
                self.allowed_extensions.join(", ")
            )))
        }
    }

    /// Reject images smaller than `min_dimension` in either axis
    pub fn check_dimensions(&self, width: u32, height: u32) -> PredictionResult<()> {
        if width < self.min_dimension || height < self.min_dimension {
            return Err(PredictionError::Validation(format!(
                "Image too small: {}x{} (minimum {}x{})",
                width, height, self.min_dimension, self.min_dimension
            )));
        }
        Ok(())
    }

    /// Validate an input and return its encoded bytes
    pub fn validate(&self, input: &ImageInput) -> PredictionResult<Vec<u8>> {
        let data = match input {
            ImageInput::Path(path) => {
                if !path.exists() {
                    return Err(PredictionError::Validation(format!(
                        "File does not exist: {}",
                        path.display()
                    )));
                }
                self.check_extension(&path.to_string_lossy())?;
                let size = std::fs::metadata(path)
                    .map_err(|e| PredictionError::Validation(e.to_string()))?
                    .len();
                self.check_size(size)?;
                std::fs::read(path).map_err(|e| {
                    PredictionError::Validation(format!("Failed to read {}: {}", path.display(), e))
                })?
            }
            ImageInput::Bytes { file_name, data } => {
                self.check_extension(file_name)?;
                self.check_size(data.len() as u64)?;
                data.clone()
            }
        };

        let (width, height) = read_dimensions(&data)?;
        self.check_dimensions(width, height)?;

        Ok(data)
    }

    fn check_size(&self, size: u64) -> PredictionResult<()> {
        if size == 0 {
            return Err(PredictionError::Validation("Empty file".to_string()));
        }
        if size > self.max_bytes {
            return Err(PredictionError::Validation(format!(
                "File too large: {} bytes (maximum {})",
                size, self.max_bytes
            )));
        }
        Ok(())
    }
}

/// Width and height from the image header only
pub fn read_dimensions(data: &[u8]) -> PredictionResult<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| PredictionError::Preprocessing(e.to_string()))?;

    Ok(reader.into_dimensions()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use tempfile::TempDir;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_extension_check() {
        let rules = ValidationRules::default();
        assert!(rules.check_extension("a.png").is_ok());
        assert!(rules.check_extension("a.JPG").is_ok());
        assert!(rules.check_extension("dir/a.jpeg").is_ok());
        assert!(rules.check_extension("image.gif").is_err());
        assert!(rules.check_extension("noextension").is_err());
    }

    #[test]
    fn test_gif_rejected_before_decoding() {
        let rules = ValidationRules::default();
        // Not an image at all: only the extension check can have rejected it
        let input = ImageInput::from_bytes("image.gif", b"garbage".to_vec());

        let err = rules.validate(&input).unwrap_err();
        assert!(matches!(err, PredictionError::Validation(ref msg) if msg.contains("Invalid file type")));
    }

    #[test]
    fn test_too_small_rejected() {
        let rules = ValidationRules::default();
        let input = ImageInput::from_bytes("tiny.png", png_bytes(5, 5));

        let err = rules.validate(&input).unwrap_err();
        assert!(matches!(err, PredictionError::Validation(ref msg) if msg.contains("too small")));
    }

    #[test]
    fn test_minimum_size_accepted() {
        let rules = ValidationRules::default();
        let input = ImageInput::from_bytes("ok.png", png_bytes(10, 10));
        assert!(rules.validate(&input).is_ok());

        let input = ImageInput::from_bytes("narrow.png", png_bytes(9, 40));
        assert!(rules.validate(&input).is_err());
    }

    #[test]
    fn test_empty_rejected() {
        let rules = ValidationRules::default();
        let err = rules.validate(&ImageInput::from_bytes("a.png", vec![])).unwrap_err();
        assert_eq!(err, PredictionError::Validation("Empty file".to_string()));
    }

    #[test]
    fn test_oversized_rejected() {
        let rules = ValidationRules {
            max_bytes: 16,
            ..Default::default()
        };
        let err = rules.validate(&ImageInput::from_bytes("a.png", png_bytes(20, 20))).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_undecodable_header_is_preprocessing_error() {
        let rules = ValidationRules::default();
        let err = rules
            .validate(&ImageInput::from_bytes("a.png", b"not really a png".to_vec()))
            .unwrap_err();
        assert!(matches!(err, PredictionError::Preprocessing(_)));
    }

    #[test]
    fn test_path_inputs() {
        let dir = TempDir::new().unwrap();
        let rules = ValidationRules::default();

        let missing = ImageInput::from_path(dir.path().join("missing.png"));
        assert!(rules.validate(&missing).unwrap_err().to_string().contains("does not exist"));

        let path = dir.path().join("captcha.png");
        std::fs::write(&path, png_bytes(256, 64)).unwrap();
        let data = rules.validate(&ImageInput::from_path(&path)).unwrap();
        assert_eq!(read_dimensions(&data).unwrap(), (256, 64));
    }
}
