//! Self-distillation loss aggregators
//!
//! Each aggregator computes its scalar forward value and registers a
//! backward op that accumulates the analytic gradient into the student
//! logits (or embeddings). Teacher-side inputs are plain probability
//! arrays; gradients never flow into the teacher.

mod dino;
mod ibot;
mod koleo;
pub(crate) mod utils;

pub use dino::{CropPairing, DinoLoss};
pub use ibot::IbotPatchLoss;
pub use koleo::KoleoLoss;
