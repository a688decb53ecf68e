//! Training configuration surface
//!
//! Mirrors the config tree consumed by the step orchestrator: `dino.*`
//! controls the multi-crop class-token loss and its Koleo regularizer,
//! `ibot.*` the masked-patch loss, `train.centering` the teacher centering
//! strategy, and `crops.local_crops_number` the local view count. Everything
//! is validated once, at construction.

mod error;

pub use error::{ConfigError, ValidationError};

use serde::{Deserialize, Serialize};

/// Teacher centering strategy selector.
///
/// Deserialized from the YAML strings `centering` and `sinkhorn_knopp`; any
/// other string is a parse error, so a typo can never silently fall back to
/// a default strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CenteringKind {
    /// EMA-center softmax centering
    #[default]
    Centering,
    /// Sinkhorn-Knopp balanced assignment
    SinkhornKnopp,
}

/// DINO (class token) objective settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DinoSection {
    /// Weight of the multi-crop class-token loss; 0 disables the branch
    #[serde(default = "default_one")]
    pub loss_weight: f32,
    /// Weight of the Koleo spread regularizer; 0 disables it
    #[serde(default = "default_koleo_weight")]
    pub koleo_loss_weight: f32,
    /// Output dimension of the projection heads
    #[serde(default = "default_prototypes")]
    pub head_n_prototypes: usize,
    /// Matryoshka mode: heads emit one logit block per nested resolution
    #[serde(rename = "MRL", default)]
    pub mrl: bool,
}

impl Default for DinoSection {
    fn default() -> Self {
        Self {
            loss_weight: 1.0,
            koleo_loss_weight: 0.1,
            head_n_prototypes: 65536,
            mrl: false,
        }
    }
}

/// iBOT (masked patch) objective settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbotSection {
    /// Weight of the masked-patch loss; 0 disables the branch
    #[serde(default)]
    pub loss_weight: f32,
    /// Use a dedicated patch head instead of sharing the DINO head
    #[serde(default)]
    pub separate_head: bool,
    /// Per-image masking ratio range
    #[serde(default = "default_mask_ratio")]
    pub mask_ratio_min_max: (f32, f32),
    /// Probability that a given image is masked at all
    #[serde(default = "default_mask_probability")]
    pub mask_sample_probability: f32,
}

impl Default for IbotSection {
    fn default() -> Self {
        Self {
            loss_weight: 0.0,
            separate_head: false,
            mask_ratio_min_max: (0.1, 0.5),
            mask_sample_probability: 0.5,
        }
    }
}

/// Step-level training settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSection {
    /// Teacher centering strategy
    #[serde(default)]
    pub centering: CenteringKind,
    /// Student softmax temperature
    #[serde(default = "default_student_temp")]
    pub student_temp: f32,
    /// EMA momentum of the softmax-centering running center
    #[serde(default = "default_center_momentum")]
    pub center_momentum: f32,
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            centering: CenteringKind::default(),
            student_temp: 0.1,
            center_momentum: 0.9,
        }
    }
}

/// Crop layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropsSection {
    /// Number of local (small) crops per image; 0 disables the local branch
    #[serde(default = "default_local_crops")]
    pub local_crops_number: usize,
    /// Number of global crops per image; the step math assumes exactly 2
    #[serde(default = "default_global_crops")]
    pub global_crops_number: usize,
}

impl Default for CropsSection {
    fn default() -> Self {
        Self {
            local_crops_number: 8,
            global_crops_number: 2,
        }
    }
}

/// Mixed-precision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionSection {
    /// Scale the loss through a dynamic gradient scaler
    #[serde(default)]
    pub grad_scaler: bool,
    /// Initial scale when the scaler is enabled
    #[serde(default = "default_initial_scale")]
    pub initial_scale: f32,
}

impl Default for PrecisionSection {
    fn default() -> Self {
        Self {
            grad_scaler: false,
            initial_scale: 65536.0,
        }
    }
}

/// Full self-distillation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub dino: DinoSection,
    #[serde(default)]
    pub ibot: IbotSection,
    #[serde(default)]
    pub train: TrainSection,
    #[serde(default)]
    pub crops: CropsSection,
    #[serde(default)]
    pub compute_precision: PrecisionSection,
}

impl SslConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant the step orchestrator relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_weight("dino", self.dino.loss_weight)?;
        check_weight("koleo", self.dino.koleo_loss_weight)?;
        check_weight("ibot", self.ibot.loss_weight)?;

        if self.dino.head_n_prototypes == 0 {
            return Err(ValidationError::InvalidPrototypeCount(0));
        }
        if !(self.train.student_temp > 0.0 && self.train.student_temp.is_finite()) {
            return Err(ValidationError::InvalidTemperature(self.train.student_temp));
        }
        if !(0.0..1.0).contains(&self.train.center_momentum) {
            return Err(ValidationError::InvalidCenterMomentum(self.train.center_momentum));
        }
        if self.crops.global_crops_number != 2 {
            return Err(ValidationError::InvalidGlobalCrops(self.crops.global_crops_number));
        }

        if self.ibot.loss_weight > 0.0 {
            let (min, max) = self.ibot.mask_ratio_min_max;
            if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max || max <= 0.0 {
                return Err(ValidationError::InvalidMaskRatio { min, max });
            }
            let p = self.ibot.mask_sample_probability;
            if !(p > 0.0 && p <= 1.0) {
                return Err(ValidationError::InvalidMaskProbability(p));
            }
        }

        if self.compute_precision.grad_scaler {
            let s = self.compute_precision.initial_scale;
            if !(s > 0.0 && s.is_finite()) {
                return Err(ValidationError::InvalidScalerScale(s));
            }
        }

        Ok(())
    }
}

fn check_weight(component: &'static str, value: f32) -> Result<(), ValidationError> {
    if value < 0.0 || !value.is_finite() {
        return Err(ValidationError::InvalidLossWeight { component, value });
    }
    Ok(())
}

fn default_one() -> f32 {
    1.0
}
fn default_koleo_weight() -> f32 {
    0.1
}
fn default_prototypes() -> usize {
    65536
}
fn default_mask_ratio() -> (f32, f32) {
    (0.1, 0.5)
}
fn default_mask_probability() -> f32 {
    0.5
}
fn default_student_temp() -> f32 {
    0.1
}
fn default_center_momentum() -> f32 {
    0.9
}
fn default_local_crops() -> usize {
    8
}
fn default_global_crops() -> usize {
    2
}
fn default_initial_scale() -> f32 {
    65536.0
}
