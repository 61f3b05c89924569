//! Model input specification.

use serde::{Deserialize, Serialize};

/// How raw 8-bit channel values are rescaled before entering the model.
///
/// This must match the training pipeline of the loaded model exactly;
/// a mismatch does not fail, it silently degrades predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Normalization {
    /// `x / 127.5 - 1`, range `[-1, 1]` (MobileNet family).
    Symmetric,
    /// `x / 255`, range `[0, 1]`.
    Unit,
    /// `(x / 255 - mean) / std` per RGB channel.
    MeanStd {
        /// Per-channel mean in unit scale.
        mean: [f32; 3],
        /// Per-channel standard deviation in unit scale.
        std: [f32; 3],
    },
}

impl Normalization {
    /// ImageNet mean/std normalization.
    #[must_use]
    pub const fn imagenet() -> Self {
        Self::MeanStd {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    /// Rescale one 8-bit value of RGB channel `channel` (0..3).
    #[must_use]
    pub fn apply(&self, channel: usize, value: u8) -> f32 {
        let v = f32::from(value);
        match self {
            Self::Symmetric => v / 127.5 - 1.0,
            Self::Unit => v / 255.0,
            Self::MeanStd { mean, std } => (v / 255.0 - mean[channel]) / std[channel],
        }
    }

    /// Closed range every normalized value lies in.
    #[must_use]
    pub fn range(&self) -> (f32, f32) {
        match self {
            Self::Symmetric => (-1.0, 1.0),
            Self::Unit => (0.0, 1.0),
            Self::MeanStd { mean, std } => {
                let lo = (0..3)
                    .map(|c| -mean[c] / std[c])
                    .fold(f32::INFINITY, f32::min);
                let hi = (0..3)
                    .map(|c| (1.0 - mean[c]) / std[c])
                    .fold(f32::NEG_INFINITY, f32::max);
                (lo, hi)
            }
        }
    }

    /// Whether the parameters are usable (finite, positive std).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Symmetric | Self::Unit => true,
            Self::MeanStd { mean, std } => {
                mean.iter().all(|m| m.is_finite()) && std.iter().all(|s| s.is_finite() && *s > 0.0)
            }
        }
    }
}

/// Spatial resolution and normalization a classifier was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Input height in pixels.
    pub height: usize,
    /// Input width in pixels.
    pub width: usize,
    /// Channel rescaling.
    pub normalization: Normalization,
}

impl InputSpec {
    /// Create a new input spec.
    #[must_use]
    pub const fn new(height: usize, width: usize, normalization: Normalization) -> Self {
        Self {
            height,
            width,
            normalization,
        }
    }

    /// 224×224, `[-1, 1]`: the Keras ImageNet MobileNetV2 input.
    #[must_use]
    pub const fn mobilenet() -> Self {
        Self::new(224, 224, Normalization::Symmetric)
    }

    /// 224×224, ImageNet mean/std: the torchvision and timm input.
    #[must_use]
    pub const fn imagenet() -> Self {
        Self::new(224, 224, Normalization::imagenet())
    }

    /// Whether both sides are non-zero and the normalization is usable.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.height > 0 && self.width > 0 && self.normalization.is_valid()
    }
}

impl Default for InputSpec {
    fn default() -> Self {
        Self::mobilenet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_endpoints() {
        let norm = Normalization::Symmetric;
        assert_eq!(norm.apply(0, 0), -1.0);
        assert_eq!(norm.apply(1, 255), 1.0);
        assert!((norm.apply(2, 128) - 0.003_921_628).abs() < 1e-6);
    }

    #[test]
    fn test_unit_endpoints() {
        let norm = Normalization::Unit;
        assert_eq!(norm.apply(0, 0), 0.0);
        assert_eq!(norm.apply(0, 255), 1.0);
    }

    #[test]
    fn test_mean_std_range_contains_extremes() {
        let norm = Normalization::imagenet();
        let (lo, hi) = norm.range();
        for c in 0..3 {
            for v in [0u8, 255] {
                let x = norm.apply(c, v);
                assert!(x >= lo - 1e-6 && x <= hi + 1e-6);
            }
        }
        assert!(norm.is_valid());
    }

    #[test]
    fn test_invalid_std() {
        let norm = Normalization::MeanStd {
            mean: [0.5; 3],
            std: [0.5, 0.0, 0.5],
        };
        assert!(!norm.is_valid());
    }

    #[test]
    fn test_input_spec_validity() {
        assert!(InputSpec::mobilenet().is_valid());
        assert!(InputSpec::imagenet().is_valid());
        assert!(!InputSpec::new(0, 224, Normalization::Unit).is_valid());
        assert!(!InputSpec::new(224, 0, Normalization::Unit).is_valid());

        let zero_std = Normalization::MeanStd {
            mean: [0.5; 3],
            std: [0.0; 3],
        };
        assert!(!InputSpec::new(32, 32, zero_std).is_valid());
    }

    #[test]
    fn test_serde_tagged() {
        let json = serde_json::to_string(&Normalization::Symmetric).unwrap();
        assert_eq!(json, r#"{"mode":"symmetric"}"#);
        let spec: InputSpec = serde_json::from_str(
            r#"{"height":32,"width":32,"normalization":{"mode":"unit"}}"#,
        )
        .unwrap();
        assert_eq!(spec.normalization, Normalization::Unit);
    }
}
