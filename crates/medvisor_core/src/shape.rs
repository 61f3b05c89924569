//! Image tensor shape metadata.

use serde::{Deserialize, Serialize};

use crate::error::{DiagnosticError, Result};

/// Shape metadata for image tensors.
///
/// Follows the convention `(N, C, H, W)`.
///
/// # Example
///
/// ```rust
/// use medvisor_core::ImageShape;
///
/// let shape = ImageShape::new(1, 3, 224, 224);
/// assert_eq!(shape.channels(), 3);
/// assert_eq!(shape.numel(), 3 * 224 * 224);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl ImageShape {
    /// Create a new shape.
    #[must_use]
    pub const fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Create an ImageShape from a slice of dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice doesn't contain exactly 4 elements.
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        match dims {
            [n, c, h, w] => Ok(Self::new(*n, *c, *h, *w)),
            _ => Err(DiagnosticError::InvalidShape {
                expected: "4 dimensions (N, C, H, W)".to_string(),
                got: format!("{} dimensions", dims.len()),
            }),
        }
    }

    /// Batch size.
    #[must_use]
    pub const fn batch(&self) -> usize {
        self.batch
    }

    /// Channel count.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Total number of elements.
    #[must_use]
    pub const fn numel(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }

    /// Dimensions as an array, suitable for `Tensor::reshape`.
    #[must_use]
    pub const fn as_array(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }
}

impl std::fmt::Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(N={}, C={}, H={}, W={})",
            self.batch, self.channels, self.height, self.width
        )
    }
}
