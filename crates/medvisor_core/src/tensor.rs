//! Normalized model input.

use std::sync::Arc;

use burn::prelude::*;
use image::RgbImage;

use crate::error::{DiagnosticError, Result};
use crate::shape::ImageShape;

/// Tolerance for float rounding when checking the input range.
const RANGE_TOLERANCE: f32 = 1e-5;

/// A normalized `(1, 3, H, W)` image tensor plus the resized RGB image it
/// was derived from.
///
/// Values are stored backend-agnostically so the same input can be fed to
/// the inference backend and to the autodiff backend. There are no mutating
/// methods; clones share the underlying buffers.
#[derive(Debug, Clone)]
pub struct InputTensor {
    data: Arc<[f32]>,
    shape: ImageShape,
    range: (f32, f32),
    image: Arc<RgbImage>,
}

impl InputTensor {
    /// Create a new input tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the data length does not match `shape`, if the
    /// shape is not a single 3-channel image matching `image`, or if any
    /// value lies outside `range`.
    pub fn new(
        data: Vec<f32>,
        shape: ImageShape,
        range: (f32, f32),
        image: RgbImage,
    ) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(DiagnosticError::InvalidShape {
                expected: format!("{} values for {}", shape.numel(), shape),
                got: format!("{} values", data.len()),
            });
        }
        if shape.batch() != 1 || shape.channels() != 3 {
            return Err(DiagnosticError::InvalidShape {
                expected: "(N=1, C=3, H, W)".to_string(),
                got: shape.to_string(),
            });
        }
        if image.width() as usize != shape.width() || image.height() as usize != shape.height() {
            return Err(DiagnosticError::InvalidShape {
                expected: format!("{}x{} image", shape.width(), shape.height()),
                got: format!("{}x{} image", image.width(), image.height()),
            });
        }

        let (min, max) = range;
        if let Some(&value) = data
            .iter()
            .find(|v| !v.is_finite() || **v < min - RANGE_TOLERANCE || **v > max + RANGE_TOLERANCE)
        {
            return Err(DiagnosticError::OutOfRange { value, min, max });
        }

        Ok(Self {
            data: data.into(),
            shape,
            range,
            image: Arc::new(image),
        })
    }

    /// Shape metadata.
    #[must_use]
    pub const fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Declared value range.
    #[must_use]
    pub const fn range(&self) -> (f32, f32) {
        self.range
    }

    /// Flat values in `(N, C, H, W)` order.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.data
    }

    /// The resized RGB image the tensor was computed from.
    #[must_use]
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Materialize as a burn tensor on `device`.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 1>::from_floats(&self.data[..], device).reshape(self.shape.as_array())
    }
}
