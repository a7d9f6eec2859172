use image::DynamicImage;
use image::imageops::FilterType;
use ndarray::Array3;

use crate::config::ModelSpec;
use crate::error::AnalysisError;
use crate::video::frames::FrameHandle;

/// A model-ready frame: normalized CHW pixels plus the frame's identity,
/// carried through inference so scores stay attributable.
#[derive(Debug)]
pub struct FrameTensor {
    pub frame_index: usize,
    pub timestamp: f64,
    pub data: Array3<f32>,
}

/// Decode a sampled frame from disk and preprocess it for `spec`.
///
/// A frame that cannot be decoded is a per-frame `Preprocess` error; the
/// caller decides whether to skip it.
pub fn load_frame(handle: &FrameHandle, spec: &ModelSpec) -> Result<FrameTensor, AnalysisError> {
    let img = image::open(&handle.path).map_err(|e| {
        AnalysisError::Preprocess(format!("frame {} unreadable: {e}", handle.index))
    })?;
    Ok(FrameTensor {
        frame_index: handle.index,
        timestamp: handle.timestamp,
        data: to_tensor(&img, spec),
    })
}

/// Resize + normalize into a (3, H, W) float buffer. Pure and deterministic:
/// the same image and spec always produce byte-identical output.
pub fn to_tensor(img: &DynamicImage, spec: &ModelSpec) -> Array3<f32> {
    let [width, height] = spec.input_size;
    let rgb = img
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8();
    let mean = spec.normalization.mean;
    let std = spec.normalization.std;

    let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            tensor[[channel, y as usize, x as usize]] = (value - mean[channel]) / std[channel];
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelRegistry;
    use image::{Rgb, RgbImage};

    fn test_image() -> DynamicImage {
        let mut img = RgbImage::new(32, 24);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 8) as u8, (y * 10) as u8, 128]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn output_shape_matches_spec() {
        let registry = ModelRegistry::builtin();
        let spec = registry.get("xception").unwrap();
        let tensor = to_tensor(&test_image(), spec);
        assert_eq!(tensor.dim(), (3, 224, 224));
    }

    #[test]
    fn transform_is_bit_reproducible() {
        let registry = ModelRegistry::builtin();
        let spec = registry.get("mesonet").unwrap();
        let img = test_image();
        let a = to_tensor(&img, spec);
        let b = to_tensor(&img, spec);
        assert_eq!(a.as_slice().unwrap(), b.as_slice().unwrap());
    }

    #[test]
    fn centered_normalization_bounds() {
        let registry = ModelRegistry::builtin();
        let spec = registry.get("mesonet").unwrap();
        let tensor = to_tensor(&test_image(), spec);
        for &v in tensor.iter() {
            assert!((-1.0..=1.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn unreadable_frame_is_a_preprocess_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let handle = FrameHandle {
            index: 3,
            timestamp: 3.0,
            path,
        };
        let registry = ModelRegistry::builtin();
        let err = load_frame(&handle, registry.get("xception").unwrap()).unwrap_err();
        assert!(matches!(err, AnalysisError::Preprocess(_)));
    }
}
