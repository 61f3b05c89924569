//! The diagnostic record handed to the serving layer.

use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DiagnosticError, Result};

/// Ordinal severity tier derived from confidence and label heuristics.
///
/// This is a placeholder policy, not a learned or clinically validated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Lowest tier.
    Normal,
    /// Low confidence finding.
    Mild,
    /// Medium confidence finding.
    Moderate,
    /// High confidence finding.
    Severe,
}

impl Severity {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Mild => "mild",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = DiagnosticError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "mild" => Ok(Self::Mild),
            "moderate" => Ok(Self::Moderate),
            "severe" => Ok(Self::Severe),
            other => Err(DiagnosticError::Config(format!("unknown severity '{other}'"))),
        }
    }
}

/// One row of the ranked differential list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialEntry {
    /// Display label.
    pub condition: String,
    /// Confidence in percent.
    pub confidence: f32,
}

/// Whether and why an overlay is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaliencyStatus {
    /// Saliency was computed and composited.
    Produced,
    /// Saliency was not attempted (disabled or shed under load).
    Skipped,
    /// Saliency was attempted and failed; classification is unaffected.
    Unavailable,
}

/// A heatmap blended onto the model-resolution image.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapOverlay {
    image: RgbImage,
}

impl HeatmapOverlay {
    /// Wrap a composited image.
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    /// The composited pixels.
    #[must_use]
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Consume and return the pixels.
    #[must_use]
    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode as PNG bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        self.image
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| DiagnosticError::SerializationError(e.to_string()))?;
        Ok(buf.into_inner())
    }

    /// Write as an image file; the format follows the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.image
            .save(path.as_ref())
            .map_err(|e| DiagnosticError::SerializationError(e.to_string()))
    }
}

/// The top prediction of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct TopPrediction {
    /// Index into the label set.
    pub class_id: usize,
    /// Label as stored with the model.
    pub raw_label: String,
    /// Title-cased display label.
    pub display_label: String,
    /// Confidence in percent.
    pub confidence: f32,
}

/// Immutable output of one diagnostic request.
///
/// Built once by the result assembler; ownership passes to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticResult {
    id: Uuid,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    principal: Option<String>,
    predicted_class: String,
    raw_label: String,
    class_id: usize,
    confidence: f32,
    severity: Severity,
    saliency_status: SaliencyStatus,
    #[serde(skip)]
    overlay: Option<HeatmapOverlay>,
    differential: Vec<DifferentialEntry>,
}

impl DiagnosticResult {
    /// Assemble a result. An overlay is only kept when `saliency_status` is
    /// [`SaliencyStatus::Produced`].
    #[must_use]
    pub fn new(
        top: TopPrediction,
        severity: Severity,
        differential: Vec<DifferentialEntry>,
        overlay: Option<HeatmapOverlay>,
        saliency_status: SaliencyStatus,
        principal: Option<String>,
    ) -> Self {
        let overlay = overlay.filter(|_| saliency_status == SaliencyStatus::Produced);
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            principal,
            predicted_class: top.display_label,
            raw_label: top.raw_label,
            class_id: top.class_id,
            confidence: top.confidence,
            severity,
            saliency_status,
            overlay,
            differential,
        }
    }

    /// Unique request id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Requesting principal, passed through untouched.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Display label of the top class.
    #[must_use]
    pub fn predicted_class(&self) -> &str {
        &self.predicted_class
    }

    /// Label of the top class as stored with the model.
    #[must_use]
    pub fn raw_label(&self) -> &str {
        &self.raw_label
    }

    /// Class id of the top class.
    #[must_use]
    pub fn class_id(&self) -> usize {
        self.class_id
    }

    /// Top-class confidence in percent.
    #[must_use]
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Severity tier.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Whether and why an overlay is present.
    #[must_use]
    pub fn saliency_status(&self) -> SaliencyStatus {
        self.saliency_status
    }

    /// Heatmap overlay, if saliency succeeded.
    #[must_use]
    pub fn overlay(&self) -> Option<&HeatmapOverlay> {
        self.overlay.as_ref()
    }

    /// Ranked differential list.
    #[must_use]
    pub fn differential(&self) -> &[DifferentialEntry] {
        &self.differential
    }

    /// Serialize to JSON (the overlay is omitted).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
