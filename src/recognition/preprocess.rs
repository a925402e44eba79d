//! Image preprocessing for the recognition model
//!
//! Turns an arbitrary image into the `(1, 3, H, W)` ImageNet-normalized tensor
//! the CAPTCHA model was trained on.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::{concatenate, Array3, Array4, ArrayView1, ArrayView4, Axis};
use tracing::debug;

use super::error::{PredictionError, PredictionResult};

/// ImageNet channel means [R, G, B]
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations [R, G, B]
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessing configuration
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Model input height
    pub target_height: u32,
    /// Model input width
    pub target_width: u32,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl PreprocessConfig {
    pub fn new(target_height: u32, target_width: u32) -> Self {
        Self {
            target_height,
            target_width,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self::new(64, 256)
    }
}

/// Decode encoded image bytes and run the full preprocessing pipeline
pub fn preprocess(
    image_bytes: &[u8],
    target_height: u32,
    target_width: u32,
) -> PredictionResult<Array4<f32>> {
    let image = image::load_from_memory(image_bytes)?;
    preprocess_image(&image, &PreprocessConfig::new(target_height, target_width))
}

/// Full preprocessing pipeline for an already decoded image
pub fn preprocess_image(
    image: &DynamicImage,
    config: &PreprocessConfig,
) -> PredictionResult<Array4<f32>> {
    if config.target_height == 0 || config.target_width == 0 {
        return Err(PredictionError::Preprocessing(format!(
            "target size must be positive, got {}x{}",
            config.target_width, config.target_height
        )));
    }

    debug!(
        "Preprocessing {}x{} {:?} image to {}x{}",
        image.width(),
        image.height(),
        image.color(),
        config.target_width,
        config.target_height
    );

    // Drop alpha / expand grayscale
    let rgb = image.to_rgb8();

    // Stretch to the model size, aspect ratio is not kept
    let resized = image::imageops::resize(
        &rgb,
        config.target_width,
        config.target_height,
        FilterType::Lanczos3,
    );

    let scaled = rgb_to_f32(&resized);
    let normalized = normalize(&scaled, &config.mean, &config.std);
    Ok(hwc_to_nchw(normalized))
}

/// HWC pixels scaled to [0, 1]
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Per-channel `(x - mean) / std`, broadcast over the trailing channel axis
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mean = ArrayView1::from(&mean[..]);
    let std = ArrayView1::from(&std[..]);
    (image - &mean) / &std
}

/// `(H, W, C)` to `(1, C, H, W)` in standard layout
pub fn hwc_to_nchw(image: Array3<f32>) -> Array4<f32> {
    image
        .permuted_axes([2, 0, 1])
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned()
}

/// Stack single-image tensors into one `(N, 3, H, W)` batch
pub fn stack_batch(tensors: &[Array4<f32>]) -> PredictionResult<Array4<f32>> {
    let Some(first) = tensors.first() else {
        return Err(PredictionError::Preprocessing("cannot stack an empty batch".to_string()));
    };

    let expected = &first.shape()[1..];
    if let Some(bad) = tensors.iter().find(|t| &t.shape()[1..] != expected) {
        return Err(PredictionError::Preprocessing(format!(
            "batch members differ in shape: {:?} vs {:?}",
            bad.shape(),
            first.shape()
        )));
    }

    let views: Vec<ArrayView4<f32>> = tensors.iter().map(|t| t.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| PredictionError::Preprocessing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode_png(image: DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_hwc_to_nchw() {
        let hwc = Array3::<f32>::from_shape_fn((10, 20, 3), |(h, w, c)| {
            (h * 100 + w * 10 + c) as f32
        });

        let nchw = hwc_to_nchw(hwc.clone());

        assert_eq!(nchw.dim(), (1, 3, 10, 20));
        assert_eq!(nchw[[0, 1, 5, 10]], hwc[[5, 10, 1]]);
        assert!(nchw.is_standard_layout());
    }

    #[test]
    fn test_normalize_imagenet() {
        let image = Array3::<f32>::from_elem((2, 2, 3), 0.5);

        let normalized = normalize(&image, &IMAGENET_MEAN, &IMAGENET_STD);

        assert!((normalized[[0, 0, 0]] - (0.5 - 0.485) / 0.229).abs() < 1e-6);
        assert!((normalized[[1, 1, 1]] - (0.5 - 0.456) / 0.224).abs() < 1e-6);
        assert!((normalized[[0, 1, 2]] - (0.5 - 0.406) / 0.225).abs() < 1e-6);
    }

    #[test]
    fn test_rgb_to_f32_scales_to_unit_range() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 51]));
        img.put_pixel(1, 0, image::Rgb([0, 255, 0]));

        let rgb = rgb_to_f32(&img);

        assert_eq!(rgb.dim(), (1, 2, 3));
        assert!((rgb[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((rgb[[0, 0, 2]] - 0.2).abs() < 1e-6);
        assert!((rgb[[0, 1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_output_shape_independent_of_input() {
        let config = PreprocessConfig::new(64, 256);

        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(37, 11, Luma([128])));
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(500, 300, Rgba([10, 20, 30, 0])));
        let rgb = DynamicImage::ImageRgb8(RgbImage::new(256, 64));

        for image in [gray, rgba, rgb] {
            let tensor = preprocess_image(&image, &config).unwrap();
            assert_eq!(tensor.dim(), (1, 3, 64, 256));
        }
    }

    #[test]
    fn test_grayscale_replicated_across_channels() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, Luma([255])));
        let tensor = preprocess_image(&gray, &PreprocessConfig::new(8, 8)).unwrap();

        for c in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert!((tensor[[0, c, 4, 4]] - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let mut img = RgbImage::new(120, 40);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = image::Rgb([(x * 2) as u8, (y * 5) as u8, ((x + y) % 256) as u8]);
        }
        let bytes = encode_png(DynamicImage::ImageRgb8(img));

        let a = preprocess(&bytes, 64, 256).unwrap();
        let b = preprocess(&bytes, 64, 256).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_bytes_are_preprocessing_error() {
        let err = preprocess(b"definitely not an image", 64, 256).unwrap_err();
        assert!(matches!(err, PredictionError::Preprocessing(_)));
    }

    #[test]
    fn test_zero_target_rejected() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(20, 20));
        let err = preprocess_image(&img, &PreprocessConfig::new(0, 256)).unwrap_err();
        assert!(matches!(err, PredictionError::Preprocessing(_)));
    }

    #[test]
    fn test_stack_batch() {
        let a = Array4::<f32>::zeros((1, 3, 4, 8));
        let b = Array4::<f32>::ones((1, 3, 4, 8));

        let batch = stack_batch(&[a, b]).unwrap();

        assert_eq!(batch.dim(), (2, 3, 4, 8));
        assert_eq!(batch[[0, 0, 0, 0]], 0.0);
        assert_eq!(batch[[1, 2, 3, 7]], 1.0);
    }

    #[test]
    fn test_stack_batch_rejects_mixed_shapes() {
        let a = Array4::<f32>::zeros((1, 3, 4, 8));
        let b = Array4::<f32>::zeros((1, 3, 4, 9));
        assert!(stack_batch(&[a, b]).is_err());
        assert!(stack_batch(&[]).is_err());
    }
}
