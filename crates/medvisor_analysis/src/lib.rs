//! # medvisor_analysis
//!
//! Diagnosis derivation: maps a score vector to a severity tier and a
//! ranked differential list.
//!
//! The severity thresholds and label overrides are a placeholder heuristic
//! and carry no clinical meaning.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod diagnosis;

pub use diagnosis::{display_label, title_case, Diagnosis, DiagnosisDeriver, SeverityPolicy};
