//! Row-level packing ops: concat, split, gather, pooling, fan-out
//!
//! These ops treat a flat tensor as a row-major (rows × width) matrix. They
//! exist so several crop groups can share a single head forward pass and
//! still route gradients back to the right rows.
//!
//! `split_rows` and `fanout` produce multiple consumers of one input. Their
//! shared backward op counts arrivals and only propagates to the input once
//! every output has delivered its gradient, so each upstream op runs exactly
//! once. Every output of these ops must therefore be consumed by exactly one
//! downstream backward chain.

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Stack tensors row-wise into one buffer. `rows[i]` gives the row count of
/// `parts[i]`; all parts share `width` columns.
pub fn concat_rows(parts: &[&Tensor], rows: &[usize], width: usize) -> Tensor {
    assert_eq!(parts.len(), rows.len(), "concat_rows: {} parts but {} row counts", parts.len(), rows.len());
    let total_rows: usize = rows.iter().sum();
    let mut data = Vec::with_capacity(total_rows * width);
    for (part, &n) in parts.iter().zip(rows) {
        assert_eq!(
            part.len(),
            n * width,
            "concat_rows: part has {} elements, expected {}x{}",
            part.len(),
            n,
            width
        );
        data.extend(part.data().iter());
    }

    let requires_grad = parts.iter().any(|p| p.requires_grad());
    let mut result = Tensor::new(Array1::from(data), requires_grad);
    if requires_grad {
        let op = Rc::new(ConcatRowsBackward {
            parts: parts.iter().map(|p| (*p).clone()).collect(),
            rows: rows.to_vec(),
            width,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

struct ConcatRowsBackward {
    parts: Vec<Tensor>,
    rows: Vec<usize>,
    width: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for ConcatRowsBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let mut offset = 0;
            for (part, &n) in self.parts.iter().zip(&self.rows) {
                let len = n * self.width;
                if part.requires_grad() {
                    let slice = grad.slice(ndarray::s![offset..offset + len]).to_owned();
                    part.accumulate_grad(slice);
                }
                offset += len;
            }
        }
        for part in &self.parts {
            if let Some(op) = part.backward_op() {
                op.backward();
            }
        }
    }
}

/// Cut row segments `(offset, len)` out of a packed tensor.
///
/// Segments may leave rows of the input uncovered (padding rows receive zero
/// gradient) but must not overlap. Each returned tensor must be consumed by
/// exactly one loss branch.
pub fn split_rows(packed: &Tensor, segments: &[(usize, usize)], width: usize) -> Vec<Tensor> {
    assert!(!segments.is_empty(), "split_rows: no segments");
    let total_rows = packed.len() / width;
    assert_eq!(packed.len(), total_rows * width, "split_rows: tensor length not a multiple of width");

    let data = packed.data();
    let mut outputs: Vec<Tensor> = segments
        .iter()
        .map(|&(offset, len)| {
            assert!(
                offset + len <= total_rows,
                "split_rows: segment ({offset}, {len}) exceeds {total_rows} rows"
            );
            let slice = data
                .slice(ndarray::s![offset * width..(offset + len) * width])
                .to_owned();
            Tensor::new(slice, packed.requires_grad())
        })
        .collect();

    if packed.requires_grad() {
        let op = Rc::new(SplitRowsBackward {
            packed: packed.clone(),
            segments: segments.to_vec(),
            width,
            output_grads: outputs.iter().map(Tensor::grad_cell).collect(),
            arrived: Cell::new(0),
        });
        for out in &mut outputs {
            out.set_backward_op(Rc::clone(&op) as Rc<dyn BackwardOp>);
        }
    }
    outputs
}

struct SplitRowsBackward {
    packed: Tensor,
    segments: Vec<(usize, usize)>,
    width: usize,
    output_grads: Vec<Rc<RefCell<Option<Array1<f32>>>>>,
    arrived: Cell<usize>,
}

impl BackwardOp for SplitRowsBackward {
    fn backward(&self) {
        self.arrived.set(self.arrived.get() + 1);
        if self.arrived.get() < self.segments.len() {
            return;
        }

        let mut grad = Array1::zeros(self.packed.len());
        for (cell, &(offset, len)) in self.output_grads.iter().zip(&self.segments) {
            if let Some(g) = cell.borrow().as_ref() {
                let start = offset * self.width;
                grad.slice_mut(ndarray::s![start..start + len * self.width])
                    .zip_mut_with(g, |dst, &src| *dst += src);
            }
        }
        self.packed.accumulate_grad(grad);
        if let Some(op) = self.packed.backward_op() {
            op.backward();
        }
    }
}

/// Hand one tensor to `n` independent consumers.
///
/// Gradients from all copies are summed into the input once the last copy
/// has run its backward pass.
pub fn fanout(input: &Tensor, n: usize) -> Vec<Tensor> {
    assert!(n >= 1, "fanout: need at least one consumer");
    let mut outputs: Vec<Tensor> = (0..n)
        .map(|_| Tensor::new(input.data(), input.requires_grad()))
        .collect();

    if input.requires_grad() {
        let op = Rc::new(FanoutBackward {
            input: input.clone(),
            output_grads: outputs.iter().map(Tensor::grad_cell).collect(),
            arrived: Cell::new(0),
        });
        for out in &mut outputs {
            out.set_backward_op(Rc::clone(&op) as Rc<dyn BackwardOp>);
        }
    }
    outputs
}

struct FanoutBackward {
    input: Tensor,
    output_grads: Vec<Rc<RefCell<Option<Array1<f32>>>>>,
    arrived: Cell<usize>,
}

impl BackwardOp for FanoutBackward {
    fn backward(&self) {
        self.arrived.set(self.arrived.get() + 1);
        if self.arrived.get() < self.output_grads.len() {
            return;
        }

        let mut grad = Array1::zeros(self.input.len());
        for cell in &self.output_grads {
            if let Some(g) = cell.borrow().as_ref() {
                grad += g;
            }
        }
        self.input.accumulate_grad(grad);
        if let Some(op) = self.input.backward_op() {
            op.backward();
        }
    }
}

/// Gather rows of a packed tensor by index (duplicates allowed).
///
/// Backward scatter-adds each output row's gradient into its source row.
pub fn index_select_rows(input: &Tensor, indices: &[usize], width: usize) -> Tensor {
    let total_rows = input.len() / width;
    assert_eq!(input.len(), total_rows * width, "index_select_rows: length not a multiple of width");

    let data = input.data();
    let mut out = Vec::with_capacity(indices.len() * width);
    for &idx in indices {
        assert!(idx < total_rows, "index_select_rows: index {idx} out of {total_rows} rows");
        out.extend(data.slice(ndarray::s![idx * width..(idx + 1) * width]).iter());
    }

    let mut result = Tensor::new(Array1::from(out), input.requires_grad());
    if input.requires_grad() {
        let op = Rc::new(IndexSelectBackward {
            input: input.clone(),
            indices: indices.to_vec(),
            width,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

struct IndexSelectBackward {
    input: Tensor,
    indices: Vec<usize>,
    width: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for IndexSelectBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let mut grad_input = Array1::zeros(self.input.len());
            for (i, &idx) in self.indices.iter().enumerate() {
                let src = grad.slice(ndarray::s![i * self.width..(i + 1) * self.width]);
                grad_input
                    .slice_mut(ndarray::s![idx * self.width..(idx + 1) * self.width])
                    .zip_mut_with(&src, |dst, &s| *dst += s);
            }
            self.input.accumulate_grad(grad_input);
        }
        if let Some(op) = self.input.backward_op() {
            op.backward();
        }
    }
}

/// Average consecutive groups of `group` rows (token pooling).
pub fn mean_pool_rows(input: &Tensor, group: usize, width: usize) -> Tensor {
    assert!(group >= 1, "mean_pool_rows: empty group");
    let total_rows = input.len() / width;
    assert_eq!(input.len(), total_rows * width, "mean_pool_rows: length not a multiple of width");
    assert_eq!(total_rows % group, 0, "mean_pool_rows: {total_rows} rows not divisible by group {group}");

    let out_rows = total_rows / group;
    let data = input.data();
    let mut out = vec![0.0f32; out_rows * width];
    for r in 0..total_rows {
        let dst = (r / group) * width;
        for c in 0..width {
            out[dst + c] += data[r * width + c];
        }
    }
    let inv = 1.0 / group as f32;
    for v in &mut out {
        *v *= inv;
    }

    let mut result = Tensor::new(Array1::from(out), input.requires_grad());
    if input.requires_grad() {
        let op = Rc::new(MeanPoolBackward {
            input: input.clone(),
            group,
            width,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

struct MeanPoolBackward {
    input: Tensor,
    group: usize,
    width: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for MeanPoolBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let inv = 1.0 / self.group as f32;
            let total_rows = self.input.len() / self.width;
            let mut grad_input = Array1::zeros(self.input.len());
            for r in 0..total_rows {
                let src = (r / self.group) * self.width;
                for c in 0..self.width {
                    grad_input[r * self.width + c] = grad[src + c] * inv;
                }
            }
            self.input.accumulate_grad(grad_input);
        }
        if let Some(op) = self.input.backward_op() {
            op.backward();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use approx::assert_relative_eq;

    #[test]
    fn test_concat_then_split_roundtrip() {
        let a = Tensor::from_vec(vec![1.0, 2.0], false);
        let b = Tensor::from_vec(vec![3.0, 4.0, 5.0, 6.0], false);
        let packed = concat_rows(&[&a, &b], &[1, 2], 2);
        assert_eq!(packed.data().to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let parts = split_rows(&packed, &[(0, 1), (1, 2)], 2);
        assert_eq!(parts[0].data().to_vec(), vec![1.0, 2.0]);
        assert_eq!(parts[1].data().to_vec(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_concat_routes_gradients_per_part() {
        let a = Tensor::from_vec(vec![0.0, 0.0], true);
        let b = Tensor::from_vec(vec![0.0, 0.0], true);
        let mut packed = concat_rows(&[&a, &b], &[1, 1], 2);
        backward(&mut packed, Some(Array1::from(vec![1.0, 2.0, 3.0, 4.0])));
        assert_eq!(a.grad().unwrap().to_vec(), vec![1.0, 2.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_split_waits_for_all_consumers() {
        let packed = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], true);
        let parts = split_rows(&packed, &[(0, 1), (1, 1)], 2);

        parts[0].set_grad(Array1::from(vec![1.0, 1.0]));
        parts[0].backward_op().unwrap().backward();
        assert!(packed.grad().is_none(), "must wait for the second consumer");

        parts[1].set_grad(Array1::from(vec![2.0, 2.0]));
        parts[1].backward_op().unwrap().backward();
        assert_eq!(packed.grad().unwrap().to_vec(), vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_split_partial_coverage_pads_zero_grad() {
        let packed = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], true);
        let parts = split_rows(&packed, &[(0, 1)], 2);
        parts[0].set_grad(Array1::from(vec![5.0, 6.0]));
        parts[0].backward_op().unwrap().backward();
        assert_eq!(packed.grad().unwrap().to_vec(), vec![5.0, 6.0, 0.0, 0.0]);
    }

    #[test]
    fn test_fanout_sums_consumer_gradients() {
        let x = Tensor::from_vec(vec![1.0, 2.0], true);
        let copies = fanout(&x, 2);
        copies[0].set_grad(Array1::from(vec![1.0, 0.0]));
        copies[0].backward_op().unwrap().backward();
        copies[1].set_grad(Array1::from(vec![0.5, 2.0]));
        copies[1].backward_op().unwrap().backward();
        assert_eq!(x.grad().unwrap().to_vec(), vec![1.5, 2.0]);
    }

    #[test]
    fn test_index_select_scatter_adds_duplicates() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], true);
        let picked = index_select_rows(&x, &[1, 1, 0], 2);
        assert_eq!(picked.data().to_vec(), vec![3.0, 4.0, 3.0, 4.0, 1.0, 2.0]);

        picked.set_grad(Array1::from(vec![1.0, 1.0, 2.0, 2.0, 7.0, 7.0]));
        picked.backward_op().unwrap().backward();
        assert_eq!(x.grad().unwrap().to_vec(), vec![7.0, 7.0, 3.0, 3.0]);
    }

    #[test]
    fn test_mean_pool_forward_backward() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], true);
        let mut pooled = mean_pool_rows(&x, 2, 2);
        assert_relative_eq!(pooled.data()[0], 2.0);
        assert_relative_eq!(pooled.data()[1], 3.0);

        backward(&mut pooled, Some(Array1::from(vec![2.0, 4.0])));
        assert_eq!(x.grad().unwrap().to_vec(), vec![1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_split_rejects_out_of_range_segment() {
        let packed = Tensor::zeros(4, false);
        split_rows(&packed, &[(1, 2)], 2);
    }
}
