//! Offline representation evaluation
//!
//! Standalone from the training core: cluster assignments produced from
//! frozen features are matched against ground-truth segmentation classes
//! and scored with mean IoU.

pub mod hungarian;
mod miou;

pub use miou::{MiouResult, PredsMiou};
