//! Severity and differential derivation.

use medvisor_core::{
    DifferentialEntry, ScoreVector, Severity, SeverityConfig, SeverityOverride, TopPrediction,
};
use serde::{Deserialize, Serialize};

/// Title-case like Python's `str.title`: the first letter of every run of
/// letters is uppercased and the rest lowercased.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for ch in s.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

/// Label as shown to users: underscores become spaces, then [`title_case`].
pub fn display_label(raw: &str) -> String {
    title_case(&raw.replace('_', " "))
}

/// Confidence thresholds plus a token → severity rule table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityPolicy {
    severe_above: f32,
    moderate_above: f32,
    mild_above: f32,
    overrides: Vec<SeverityOverride>,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self::from_config(&SeverityConfig::default())
    }
}

impl SeverityPolicy {
    /// Policy from config.
    pub fn from_config(config: &SeverityConfig) -> Self {
        Self {
            severe_above: config.severe_above,
            moderate_above: config.moderate_above,
            mild_above: config.mild_above,
            overrides: config
                .overrides
                .iter()
                .map(|rule| SeverityOverride::new(rule.token.to_lowercase(), rule.severity))
                .collect(),
        }
    }

    /// Replace the override table.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Vec<SeverityOverride>) -> Self {
        self.overrides = overrides
            .into_iter()
            .map(|rule| SeverityOverride::new(rule.token.to_lowercase(), rule.severity))
            .collect();
        self
    }

    /// Severity by confidence alone.
    pub fn tier(&self, confidence: f32) -> Severity {
        if confidence > self.severe_above {
            Severity::Severe
        } else if confidence > self.moderate_above {
            Severity::Moderate
        } else if confidence > self.mild_above {
            Severity::Mild
        } else {
            Severity::Normal
        }
    }

    /// Severity forced by the first override whose token occurs in the
    /// lowercase label.
    pub fn override_for(&self, label: &str) -> Option<Severity> {
        let label = label.to_lowercase();
        self.overrides
            .iter()
            .find(|rule| label.contains(rule.token.as_str()))
            .map(|rule| rule.severity)
    }

    /// Severity for a predicted label at `confidence` percent.
    pub fn severity_for(&self, label: &str, confidence: f32) -> Severity {
        self.override_for(label)
            .unwrap_or_else(|| self.tier(confidence))
    }
}

/// Derived diagnosis for one score vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    /// The top class.
    pub top: TopPrediction,
    /// Severity tier.
    pub severity: Severity,
    /// Top-K classes by descending confidence.
    pub differential: Vec<DifferentialEntry>,
}

/// Diagnosis Derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisDeriver {
    policy: SeverityPolicy,
    top_k: usize,
}

impl Default for DiagnosisDeriver {
    fn default() -> Self {
        Self::new(SeverityPolicy::default(), 3)
    }
}

impl DiagnosisDeriver {
    /// Create a deriver keeping `top_k` (at least 1) differential entries.
    pub fn new(policy: SeverityPolicy, top_k: usize) -> Self {
        Self {
            policy,
            top_k: top_k.max(1),
        }
    }

    /// The severity policy.
    pub fn policy(&self) -> &SeverityPolicy {
        &self.policy
    }

    /// Number of differential entries.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Derive severity and differential from `scores`.
    ///
    /// `label_of` maps a class id to its raw label. Returns `None` only for an
    /// empty score vector.
    pub fn derive<F>(&self, scores: &ScoreVector, label_of: F) -> Option<Diagnosis>
    where
        F: Fn(usize) -> String,
    {
        let ranked = scores.top_k(self.top_k);
        let best = *ranked.first()?;

        let raw_label = label_of(best.class_id);
        let confidence = best.confidence();
        let severity = self.policy.severity_for(&raw_label, confidence);

        // Already in descending order with ties in rank order.
        let differential = ranked
            .iter()
            .map(|c| DifferentialEntry {
                condition: display_label(&label_of(c.class_id)),
                confidence: c.confidence(),
            })
            .collect();

        Some(Diagnosis {
            top: TopPrediction {
                class_id: best.class_id,
                display_label: display_label(&raw_label),
                raw_label,
                confidence,
            },
            severity,
            differential,
        })
    }
}
