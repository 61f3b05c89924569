//! # medvisor_transforms
//!
//! Turns raw image bytes into the normalized tensor a classifier expects.
//!
//! ```rust,ignore
//! use medvisor_transforms::Preprocessor;
//! use medvisor_core::InputSpec;
//!
//! let pre = Preprocessor::new(InputSpec::mobilenet());
//! let input = pre.decode_and_normalize(&bytes)?;
//! assert_eq!(input.shape().height(), 224);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod preprocess;

pub use preprocess::*;
