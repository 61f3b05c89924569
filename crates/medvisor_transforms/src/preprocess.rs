//! Decode, resize and normalize.

use image::imageops::FilterType;
use image::RgbImage;
use medvisor_core::{DiagnosticError, ImageShape, InputSpec, InputTensor, Result};
use serde::{Deserialize, Serialize};

/// Default upper bound on encoded input size (20 MiB).
pub const DEFAULT_MAX_BYTES: usize = 20 * 1024 * 1024;

/// Configuration for [`Preprocessor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    /// Target resolution and normalization.
    pub input: InputSpec,
    /// Largest accepted encoded payload in bytes.
    pub max_bytes: usize,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            input: InputSpec::default(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Converts encoded images to [`InputTensor`]s.
///
/// Decoding accepts anything the `image` crate recognizes. Every decoded
/// image is converted to 8-bit RGB (alpha dropped, grayscale replicated),
/// resized with a bilinear filter and rescaled per the [`InputSpec`].
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessorConfig,
}

impl Preprocessor {
    /// Create a preprocessor for `input` with the default size limit.
    #[must_use]
    pub fn new(input: InputSpec) -> Self {
        Self::from_config(PreprocessorConfig {
            input,
            ..Default::default()
        })
    }

    /// Create from config.
    #[must_use]
    pub fn from_config(config: PreprocessorConfig) -> Self {
        Self { config }
    }

    /// Set the size limit.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.config.max_bytes = max_bytes;
        self
    }

    /// Target input spec.
    pub fn input_spec(&self) -> &InputSpec {
        &self.config.input
    }

    /// Decode `bytes` and produce a normalized `(1, 3, H, W)` tensor.
    ///
    /// # Errors
    ///
    /// [`DiagnosticError::InvalidImage`] when the payload is empty, too
    /// large, or not a decodable image.
    pub fn decode_and_normalize(&self, bytes: &[u8]) -> Result<InputTensor> {
        let rgb = self.decode(bytes)?;
        self.normalize(rgb)
    }

    /// Decode to RGB and resize to the target resolution.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage> {
        if bytes.is_empty() {
            return Err(DiagnosticError::InvalidImage("empty payload".into()));
        }
        if bytes.len() > self.config.max_bytes {
            return Err(DiagnosticError::InvalidImage(format!(
                "payload of {} bytes exceeds limit of {}",
                bytes.len(),
                self.config.max_bytes
            )));
        }

        let decoded = image::load_from_memory(bytes)
            .map_err(|e| DiagnosticError::InvalidImage(e.to_string()))?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(DiagnosticError::InvalidImage("image has no pixels".into()));
        }
        tracing::debug!(
            "Decoded {}x{} {:?} image",
            decoded.width(),
            decoded.height(),
            decoded.color()
        );

        let rgb = decoded.to_rgb8();
        let (width, height) = (self.config.input.width as u32, self.config.input.height as u32);
        if rgb.dimensions() == (width, height) {
            Ok(rgb)
        } else {
            Ok(image::imageops::resize(&rgb, width, height, FilterType::Triangle))
        }
    }

    /// Rescale an RGB image that already has the target resolution.
    pub fn normalize(&self, rgb: RgbImage) -> Result<InputTensor> {
        let spec = &self.config.input;
        let (height, width) = (spec.height, spec.width);
        let plane = height * width;

        let mut data = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for channel in 0..3 {
                data[channel * plane + offset] = spec.normalization.apply(channel, pixel[channel]);
            }
        }

        InputTensor::new(
            data,
            ImageShape::new(1, 3, height, width),
            spec.normalization.range(),
            rgb,
        )
    }
}
