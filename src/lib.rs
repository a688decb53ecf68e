//! destilar: student-teacher self-distillation training core
//!
//! Implements the joint-embedding self-distillation step used by multi-crop
//! vision pretraining: a frozen-by-EMA teacher produces centered prototype
//! distributions over global crops, a student is trained to match them from
//! global and local crops (DINO objective) and from masked patch positions
//! (iBOT objective), with a Koleo regularizer spreading the student's class
//! embeddings. An offline clustering mIoU metric evaluates the learned
//! representations.
//!
//! # Architecture
//!
//! - [`autograd`]: flat tensors with gradient tape and loss scaling
//! - [`loss`]: Koleo, multi-crop DINO, and masked-patch iBOT aggregators
//! - [`centering`]: teacher output centering strategies (EMA softmax
//!   centering, Sinkhorn-Knopp)
//! - [`arch`]: the training-step orchestrator ([`SslMetaArch`])
//! - [`model`]: collaborator traits for backbones, projection heads, and
//!   sharded parameter access
//! - [`batching`]: segmented packing of variable-length crop groups
//! - [`comm`]: cross-worker reduction primitives
//! - [`sched`]: cosine value schedules for teacher momentum and temperature
//! - [`data`]: multi-crop batch contract and patch mask generation
//! - [`eval`]: offline clustering mIoU
//!
//! # Example
//!
//! ```no_run
//! use destilar::config::SslConfig;
//!
//! let yaml = r#"
//! dino:
//!   loss_weight: 1.0
//!   koleo_loss_weight: 0.1
//!   head_n_prototypes: 4096
//! ibot:
//!   loss_weight: 1.0
//!   separate_head: false
//!   mask_ratio_min_max: [0.1, 0.5]
//!   mask_sample_probability: 0.5
//! train:
//!   centering: sinkhorn_knopp
//! crops:
//!   local_crops_number: 8
//! "#;
//! let config = SslConfig::from_yaml(yaml).unwrap();
//! assert_eq!(config.crops.local_crops_number, 8);
//! ```

pub mod arch;
pub mod autograd;
pub mod batching;
pub mod centering;
pub mod comm;
pub mod config;
pub mod data;
pub mod eval;
pub mod loss;
pub mod model;
pub mod sched;

pub use arch::{LossDict, ModuleSet, SslMetaArch};
pub use autograd::{backward, BackwardOp, GradScaler, Tensor};
pub use config::{CenteringKind, SslConfig, ValidationError};
