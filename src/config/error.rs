//! Configuration error types

use thiserror::Error;

/// Construction-time configuration errors. Raised before any training step
/// runs; a config that passes validation never fails for these reasons later.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid loss weight for {component}: {value} (must be >= 0.0 and finite)")]
    InvalidLossWeight { component: &'static str, value: f32 },

    #[error("Invalid prototype count: {0} (must be > 0)")]
    InvalidPrototypeCount(usize),

    #[error("Invalid student temperature: {0} (must be > 0.0)")]
    InvalidTemperature(f32),

    #[error("Invalid center momentum: {0} (must be in [0.0, 1.0))")]
    InvalidCenterMomentum(f32),

    #[error(
        "Invalid mask ratio range: ({min}, {max}) (need 0.0 <= min <= max <= 1.0 and max > 0.0 when the patch loss is enabled)"
    )]
    InvalidMaskRatio { min: f32, max: f32 },

    #[error("Invalid mask sample probability: {0} (must be in (0.0, 1.0] when the patch loss is enabled)")]
    InvalidMaskProbability(f32),

    #[error("Invalid global crop count: {0} (exactly 2 global crops are supported)")]
    InvalidGlobalCrops(usize),

    #[error("Invalid gradient scaler scale: {0} (must be > 0.0 and finite)")]
    InvalidScalerScale(f32),
}

/// Errors loading a config document
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
