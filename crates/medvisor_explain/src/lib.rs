//! # medvisor_explain
//!
//! Explainability for image classifiers: activation/gradient capture,
//! Grad-CAM saliency maps and heatmap overlays.
//!
//! This crate provides:
//! - [`LayerCapture`], which splits a forward pass at a named layer and
//!   differentiates a class score with respect to that layer's output
//! - [`grad_cam`] and [`SaliencyGenerator`], which turn the capture into a
//!   [`SaliencyMap`] and never let a failure escape
//! - [`HeatmapCompositor`], which colorizes a map with the jet ramp and
//!   blends it onto the input image

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod activation;
mod error;
mod gradcam;
mod heatmap;

pub use activation::LayerCapture;
pub use error::{Result, SaliencyError};
pub use gradcam::{grad_cam, SaliencyGenerator, SaliencyMap, DEFAULT_EPSILON};
pub use heatmap::{colorize, jet, overlay, upsample_bilinear, HeatmapCompositor};
