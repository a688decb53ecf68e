//! Collaborator interfaces for backbones, projection heads, and sharded
//! parameter access
//!
//! Backbone and head construction live outside this crate; the step
//! orchestrator only needs these seams. [`LinearBackbone`] and
//! [`LinearHead`]/[`MrlLinearHead`] are minimal reference implementations
//! used by tests and small experiments.

mod linear;

pub use linear::{LinearBackbone, LinearHead, MrlLinearHead};

use ndarray::Array2;

use crate::autograd::Tensor;

/// Opaque compute-stream identifiers shared between modules.
///
/// Sharded runtimes keep per-module unshard/post-backward streams; after the
/// first step every module must observe the same pair so cross-module work
/// is ordered on one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamHandles {
    pub unshard_stream: u64,
    pub post_backward_stream: u64,
}

/// One shard of a module's parameters
pub struct ParamShard {
    pub params: Vec<Tensor>,
}

/// Sharded-parameter access used by the EMA teacher update and the
/// post-forward reshard hook.
pub trait ShardedModule {
    /// Parameter shards in a stable order. Tensors alias the module's
    /// storage, so in-place writes update the module.
    fn shards(&self) -> Vec<ParamShard>;

    /// Release unsharded parameter memory after a forward pass
    fn reshard(&self) {}

    /// This module's compute streams
    fn stream_handles(&self) -> StreamHandles {
        StreamHandles::default()
    }

    /// Adopt another module's compute streams
    fn bind_streams(&self, _streams: &StreamHandles) {}
}

/// Backbone forward output: normalized class and patch tokens.
///
/// `cls_tokens` is flat (crop rows × embed_dim); `patch_tokens` is flat
/// (crop rows · patches-per-crop × embed_dim), patch-minor. Teacher
/// backbones return detached tensors.
pub struct BackboneOutput {
    pub cls_tokens: Tensor,
    pub patch_tokens: Tensor,
    pub n_cls_rows: usize,
    pub n_patch_rows: usize,
    pub embed_dim: usize,
}

/// Feature extractor over crop batches
pub trait Backbone: ShardedModule {
    fn embed_dim(&self) -> usize;

    /// Run the backbone over crop rows. `masks` (global crops only) marks
    /// patches the student must reconstruct; `track_grad` is false for the
    /// teacher pass.
    fn forward(
        &self,
        crops: &Array2<f32>,
        masks: Option<&Array2<bool>>,
        track_grad: bool,
    ) -> BackboneOutput;
}

/// Projection from embeddings to prototype logits.
///
/// Returns one flat (rows × out_dim) logit tensor per resolution; plain
/// heads return a single block, Matryoshka heads one per nested dim.
pub trait ProjectionHead: ShardedModule {
    fn out_dim(&self) -> usize;

    fn n_resolutions(&self) -> usize {
        1
    }

    fn forward(&self, tokens: &Tensor, n_rows: usize) -> Vec<Tensor>;
}
