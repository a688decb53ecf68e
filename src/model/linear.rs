//! Linear reference implementations of the collaborator traits

use ndarray::Array2;
use rand::Rng;
use std::cell::Cell;

use super::{Backbone, BackboneOutput, ParamShard, ProjectionHead, ShardedModule, StreamHandles};
use crate::autograd::{ops, Tensor};

fn uniform_init<R: Rng>(len: usize, fan_in: usize, rng: &mut R) -> Vec<f32> {
    let bound = 1.0 / (fan_in as f32).sqrt();
    (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
}

/// Single linear projection head
pub struct LinearHead {
    weight: Tensor,
    in_dim: usize,
    out_dim: usize,
    streams: Cell<StreamHandles>,
    reshard_count: Cell<usize>,
}

impl LinearHead {
    pub fn new<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        assert!(in_dim > 0 && out_dim > 0, "head dims must be positive");
        let weight = Tensor::from_vec(uniform_init(in_dim * out_dim, in_dim, rng), true);
        Self {
            weight,
            in_dim,
            out_dim,
            streams: Cell::new(StreamHandles::default()),
            reshard_count: Cell::new(0),
        }
    }

    /// Frozen copy with identical weights (EMA teacher initialization)
    pub fn teacher_copy(&self) -> Self {
        Self {
            weight: self.weight.detach(),
            in_dim: self.in_dim,
            out_dim: self.out_dim,
            streams: Cell::new(self.streams.get()),
            reshard_count: Cell::new(0),
        }
    }

    pub fn with_stream_handles(self, streams: StreamHandles) -> Self {
        self.streams.set(streams);
        self
    }

    pub fn reshard_count(&self) -> usize {
        self.reshard_count.get()
    }
}

impl ShardedModule for LinearHead {
    fn shards(&self) -> Vec<ParamShard> {
        vec![ParamShard {
            params: vec![self.weight.clone()],
        }]
    }

    fn reshard(&self) {
        self.reshard_count.set(self.reshard_count.get() + 1);
    }

    fn stream_handles(&self) -> StreamHandles {
        self.streams.get()
    }

    fn bind_streams(&self, streams: &StreamHandles) {
        self.streams.set(*streams);
    }
}

impl ProjectionHead for LinearHead {
    fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn forward(&self, tokens: &Tensor, n_rows: usize) -> Vec<Tensor> {
        vec![ops::matmul(tokens, &self.weight, n_rows, self.in_dim, self.out_dim)]
    }
}

/// Matryoshka head: one projection per nested resolution, all emitting the
/// same prototype count.
pub struct MrlLinearHead {
    weights: Vec<Tensor>,
    in_dim: usize,
    out_dim: usize,
    streams: Cell<StreamHandles>,
    reshard_count: Cell<usize>,
}

impl MrlLinearHead {
    pub fn new<R: Rng>(in_dim: usize, out_dim: usize, n_resolutions: usize, rng: &mut R) -> Self {
        assert!(n_resolutions >= 1, "need at least one resolution");
        let weights = (0..n_resolutions)
            .map(|_| Tensor::from_vec(uniform_init(in_dim * out_dim, in_dim, rng), true))
            .collect();
        Self {
            weights,
            in_dim,
            out_dim,
            streams: Cell::new(StreamHandles::default()),
            reshard_count: Cell::new(0),
        }
    }

    pub fn teacher_copy(&self) -> Self {
        Self {
            weights: self.weights.iter().map(Tensor::detach).collect(),
            in_dim: self.in_dim,
            out_dim: self.out_dim,
            streams: Cell::new(self.streams.get()),
            reshard_count: Cell::new(0),
        }
    }
}

impl ShardedModule for MrlLinearHead {
    fn shards(&self) -> Vec<ParamShard> {
        self.weights
            .iter()
            .map(|w| ParamShard {
                params: vec![w.clone()],
            })
            .collect()
    }

    fn reshard(&self) {
        self.reshard_count.set(self.reshard_count.get() + 1);
    }

    fn stream_handles(&self) -> StreamHandles {
        self.streams.get()
    }

    fn bind_streams(&self, streams: &StreamHandles) {
        self.streams.set(*streams);
    }
}

impl ProjectionHead for MrlLinearHead {
    fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn n_resolutions(&self) -> usize {
        self.weights.len()
    }

    fn forward(&self, tokens: &Tensor, n_rows: usize) -> Vec<Tensor> {
        let copies = ops::fanout(tokens, self.weights.len());
        copies
            .iter()
            .zip(&self.weights)
            .map(|(t, w)| ops::matmul(t, w, n_rows, self.in_dim, self.out_dim))
            .collect()
    }
}

/// Patch-wise linear embedding backbone.
///
/// Crop rows are split into patches of `patch_dim` features, each projected
/// by a shared weight; the class token is the mean patch embedding. Both
/// outputs are L2-normalized, matching the normalized-token contract.
pub struct LinearBackbone {
    weight: Tensor,
    patch_dim: usize,
    embed_dim: usize,
    streams: Cell<StreamHandles>,
    reshard_count: Cell<usize>,
}

impl LinearBackbone {
    pub fn new<R: Rng>(patch_dim: usize, embed_dim: usize, rng: &mut R) -> Self {
        assert!(patch_dim > 0 && embed_dim > 0, "backbone dims must be positive");
        let weight = Tensor::from_vec(uniform_init(patch_dim * embed_dim, patch_dim, rng), true);
        Self {
            weight,
            patch_dim,
            embed_dim,
            streams: Cell::new(StreamHandles::default()),
            reshard_count: Cell::new(0),
        }
    }

    pub fn teacher_copy(&self) -> Self {
        Self {
            weight: self.weight.detach(),
            patch_dim: self.patch_dim,
            embed_dim: self.embed_dim,
            streams: Cell::new(self.streams.get()),
            reshard_count: Cell::new(0),
        }
    }

    pub fn with_stream_handles(self, streams: StreamHandles) -> Self {
        self.streams.set(streams);
        self
    }

    pub fn reshard_count(&self) -> usize {
        self.reshard_count.get()
    }
}

impl ShardedModule for LinearBackbone {
    fn shards(&self) -> Vec<ParamShard> {
        vec![ParamShard {
            params: vec![self.weight.clone()],
        }]
    }

    fn reshard(&self) {
        self.reshard_count.set(self.reshard_count.get() + 1);
    }

    fn stream_handles(&self) -> StreamHandles {
        self.streams.get()
    }

    fn bind_streams(&self, streams: &StreamHandles) {
        self.streams.set(*streams);
    }
}

impl Backbone for LinearBackbone {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn forward(
        &self,
        crops: &Array2<f32>,
        masks: Option<&Array2<bool>>,
        track_grad: bool,
    ) -> BackboneOutput {
        let rows = crops.nrows();
        assert!(rows > 0, "empty crop batch");
        assert_eq!(
            crops.ncols() % self.patch_dim,
            0,
            "crop width {} is not a multiple of patch_dim {}",
            crops.ncols(),
            self.patch_dim
        );
        let n_patches = crops.ncols() / self.patch_dim;
        if let Some(masks) = masks {
            assert_eq!(masks.dim(), (rows, n_patches), "mask grid disagrees with crops");
        }

        // flatten to (rows·n_patches × patch_dim), zeroing masked patches
        let mut flat = Vec::with_capacity(rows * n_patches * self.patch_dim);
        for r in 0..rows {
            for p in 0..n_patches {
                let hidden = masks.is_some_and(|m| m[[r, p]]);
                for c in 0..self.patch_dim {
                    flat.push(if hidden { 0.0 } else { crops[[r, p * self.patch_dim + c]] });
                }
            }
        }
        let patches_in = Tensor::from_vec(flat, false);
        let weight = if track_grad { self.weight.clone() } else { self.weight.detach() };

        let n_patch_rows = rows * n_patches;
        let embedded = ops::matmul(&patches_in, &weight, n_patch_rows, self.patch_dim, self.embed_dim);
        let branches = ops::fanout(&embedded, 2);
        let cls = ops::mean_pool_rows(&branches[0], n_patches, self.embed_dim);

        BackboneOutput {
            cls_tokens: ops::l2_normalize_rows(&cls, rows, self.embed_dim),
            patch_tokens: ops::l2_normalize_rows(&branches[1], n_patch_rows, self.embed_dim),
            n_cls_rows: rows,
            n_patch_rows,
            embed_dim: self.embed_dim,
        }
    }
}
