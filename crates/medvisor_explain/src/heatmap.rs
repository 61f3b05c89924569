//! Heatmap colorization and blending.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use medvisor_core::{HeatmapConfig, HeatmapOverlay};

use crate::gradcam::SaliencyMap;

/// Classic jet colormap on an 8-bit level: dark blue at 0, dark red at 255.
pub fn jet(level: u8) -> Rgb<u8> {
    let x = f32::from(level) / 255.0;
    let channel = |center: f32| {
        let v = (1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Bilinear resize of a saliency map to `width × height`, sampling at pixel
/// centers.
pub fn upsample_bilinear(map: &SaliencyMap, width: u32, height: u32) -> Vec<f32> {
    let blank = || vec![0.0; width as usize * height as usize];
    if map.values().is_empty() || width == 0 || height == 0 {
        return blank();
    }
    let Some(field) = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(
        map.width() as u32,
        map.height() as u32,
        map.values().to_vec(),
    ) else {
        return blank();
    };
    imageops::resize(&field, width, height, FilterType::Triangle).into_raw()
}

/// Upsample `map` to `width × height` and color it with [`jet`].
pub fn colorize(map: &SaliencyMap, width: u32, height: u32) -> RgbImage {
    let values = upsample_bilinear(map, width, height);
    let mut img = RgbImage::new(width, height);
    for (pixel, v) in img.pixels_mut().zip(values) {
        // Truncating 8-bit quantization.
        let level = (v.clamp(0.0, 1.0) * 255.0) as u8;
        *pixel = jet(level);
    }
    img
}

/// Blend the colorized map onto `image`:
/// `intensity * heatmap + (1 - intensity) * image`.
///
/// `intensity` is clamped to `[0, 1]`. At 0 the result is `image`, at 1 it is
/// [`colorize`]`(map)`.
pub fn overlay(map: &SaliencyMap, image: &RgbImage, intensity: f32) -> HeatmapOverlay {
    let alpha = if intensity.is_nan() {
        0.0
    } else {
        intensity.clamp(0.0, 1.0)
    };
    let (width, height) = image.dimensions();
    let heat = colorize(map, width, height);

    let mut out = RgbImage::new(width, height);
    for ((dst, h), src) in out.pixels_mut().zip(heat.pixels()).zip(image.pixels()) {
        for c in 0..3 {
            let v = alpha * f32::from(h[c]) + (1.0 - alpha) * f32::from(src[c]);
            dst[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    HeatmapOverlay::new(out)
}

/// Heatmap Compositor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatmapCompositor {
    intensity: f32,
}

impl Default for HeatmapCompositor {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl HeatmapCompositor {
    /// Create a compositor with blend weight `intensity` (clamped to `[0, 1]`).
    pub fn new(intensity: f32) -> Self {
        let intensity = if intensity.is_nan() {
            0.0
        } else {
            intensity.clamp(0.0, 1.0)
        };
        Self { intensity }
    }

    /// Create from config.
    pub fn from_config(config: &HeatmapConfig) -> Self {
        Self::new(config.intensity)
    }

    /// Blend weight of the heatmap.
    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    /// Overlay for `map`, or `None` when there is no map.
    pub fn compose(&self, map: Option<&SaliencyMap>, image: &RgbImage) -> Option<HeatmapOverlay> {
        map.map(|m| overlay(m, image, self.intensity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp_map() -> SaliencyMap {
        SaliencyMap::new(3, 2, vec![0.0, 0.2, 0.4, 0.6, 0.8, 1.0]).unwrap()
    }

    fn photo() -> RgbImage {
        RgbImage::from_fn(12, 8, |x, y| Rgb([(x * 20) as u8, (y * 30) as u8, 77]))
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0), Rgb([0, 0, 128]));
        assert_eq!(jet(255), Rgb([128, 0, 0]));
        let mid = jet(128);
        assert!(mid[1] > 200);
    }

    #[test]
    fn test_jet_blue_to_red() {
        let low = jet(20);
        let high = jet(235);
        assert!(low[2] > low[0]);
        assert!(high[0] > high[2]);
    }

    #[test]
    fn test_upsample_constant() {
        let map = SaliencyMap::new(2, 2, vec![0.25; 4]).unwrap();
        let up = upsample_bilinear(&map, 7, 5);
        assert_eq!(up.len(), 35);
        assert!(up.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_upsample_identity_size() {
        let map = ramp_map();
        let up = upsample_bilinear(&map, 3, 2);
        for (a, b) in up.iter().zip(map.values()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_upsample_keeps_corners_and_range() {
        let map = ramp_map();
        let up = upsample_bilinear(&map, 12, 8);
        assert_eq!(up.len(), 96);
        assert!((up[0] - 0.0).abs() < 1e-6);
        assert!((up[95] - 1.0).abs() < 1e-6);
        assert!(up.iter().all(|v| (0.0..=1.0).contains(v)));
        // left to right along the top row never decreases
        assert!(up[..12].windows(2).all(|w| w[1] >= w[0] - 1e-6));
    }

    #[test]
    fn test_intensity_zero_is_image() {
        let image = photo();
        let out = overlay(&ramp_map(), &image, 0.0);
        assert_eq!(out.image(), &image);
    }

    #[test]
    fn test_intensity_one_is_heatmap() {
        let image = photo();
        let out = overlay(&ramp_map(), &image, 1.0);
        assert_eq!(out.image(), &colorize(&ramp_map(), 12, 8));
    }

    #[test]
    fn test_intensity_clamped() {
        let image = photo();
        assert_eq!(overlay(&ramp_map(), &image, 3.0).image(), overlay(&ramp_map(), &image, 1.0).image());
        assert_eq!(HeatmapCompositor::new(-1.0).intensity(), 0.0);
    }

    #[test]
    fn test_compose_absent_map() {
        let compositor = HeatmapCompositor::default();
        assert!(compositor.compose(None, &photo()).is_none());

        let out = compositor.compose(Some(&ramp_map()), &photo()).unwrap();
        assert_eq!((out.width(), out.height()), (12, 8));
    }

    proptest! {
        #[test]
        fn prop_blend_between_sources(intensity in 0.0f32..=1.0) {
            let image = photo();
            let heat = colorize(&ramp_map(), 12, 8);
            let out = overlay(&ramp_map(), &image, intensity);
            for ((o, h), i) in out.image().pixels().zip(heat.pixels()).zip(image.pixels()) {
                for c in 0..3 {
                    let lo = h[c].min(i[c]);
                    let hi = h[c].max(i[c]);
                    prop_assert!(o[c] >= lo && o[c] <= hi);
                }
            }
        }
    }
}
