//! Koleo regularizer: differential-entropy estimate from nearest-neighbor
//! distances
//!
//! Penalizes class embeddings that collapse onto each other by maximizing
//! the log distance between each embedding and its nearest neighbor in the
//! batch. Rows are L2-normalized inside the loss, so the value is invariant
//! to the input scale; all accumulation runs in f64 regardless of the
//! surrounding step precision.

use ndarray::{Array1, Array2};
use std::cell::RefCell;
use std::rc::Rc;

use crate::autograd::{ops, BackwardOp, Tensor};

const KOLEO_EPS: f64 = 1e-8;
const NORM_EPS: f32 = 1e-12;

/// Kozachenko-Leonenko style spread loss, compared on the unit sphere
#[derive(Debug, Clone, Default)]
pub struct KoleoLoss;

impl KoleoLoss {
    pub fn new() -> Self {
        Self
    }

    /// Nearest neighbor of each unit row under cosine similarity.
    ///
    /// The diagonal of the similarity matrix is forced to −1 so a row never
    /// selects itself. Ties resolve to the first maximum; callers must not
    /// rely on which duplicate wins.
    pub fn pairwise_nearest(batch: &Array2<f32>) -> Vec<usize> {
        let n = batch.nrows();
        assert!(n >= 2, "need at least 2 rows to find nearest neighbors, got {n}");

        let mut nearest = Vec::with_capacity(n);
        for i in 0..n {
            let row_i = batch.row(i);
            let mut best = f64::NEG_INFINITY;
            let mut best_j = 0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let dot: f64 = row_i
                    .iter()
                    .zip(batch.row(j).iter())
                    .map(|(&a, &b)| a as f64 * b as f64)
                    .sum();
                if dot > best {
                    best = dot;
                    best_j = j;
                }
            }
            nearest.push(best_j);
        }
        nearest
    }

    /// Loss value: −mean(ln(‖xᵢ − x_nn(i)‖ + ε)) over the normalized rows
    pub fn forward(&self, batch: &Array2<f32>) -> f32 {
        let (loss, _, _) = Self::forward_parts(&Self::normalize_rows(batch));
        loss as f32
    }

    fn normalize_rows(batch: &Array2<f32>) -> Array2<f32> {
        let mut unit = batch.clone();
        for mut row in unit.rows_mut() {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPS);
            row.mapv_inplace(|v| v / norm);
        }
        unit
    }

    /// Grad-tracking variant over a flat (n × d) embedding tensor.
    ///
    /// Rows are normalized through the tape, so gradients project back onto
    /// the raw embeddings. The backward op treats the selected neighbor
    /// indices as constants, differentiating only through the distances.
    pub fn forward_tensor(&self, batch: &Tensor, n: usize, d: usize) -> Tensor {
        assert_eq!(
            batch.len(),
            n * d,
            "koleo: tensor has {} elements, expected {}x{}",
            batch.len(),
            n,
            d
        );
        let unit = ops::l2_normalize_rows(batch, n, d);
        let data = unit.data();
        let matrix =
            Array2::from_shape_vec((n, d), data.to_vec()).expect("length checked against n*d");
        let (loss, nearest, distances) = Self::forward_parts(&matrix);

        let mut result = Tensor::from_vec(vec![loss as f32], unit.requires_grad());
        if unit.requires_grad() {
            // d/dx_i [−(1/n)·ln(d_i + ε)] = −(1/n)·(x_i − x_j)/(d_i·(d_i + ε)),
            // plus the mirrored term for rows selected as neighbors.
            let mut grad = Array1::<f32>::zeros(n * d);
            for i in 0..n {
                let j = nearest[i];
                let dist = distances[i];
                if dist < KOLEO_EPS {
                    // coincident rows: direction undefined, contribution dropped
                    continue;
                }
                let coef = -1.0 / (n as f64) / (dist + KOLEO_EPS) / dist;
                for c in 0..d {
                    let diff = (matrix[[i, c]] as f64 - matrix[[j, c]] as f64) * coef;
                    grad[i * d + c] += diff as f32;
                    grad[j * d + c] -= diff as f32;
                }
            }
            let op = Rc::new(KoleoBackward {
                batch: unit.clone(),
                grad,
                result_grad: result.grad_cell(),
            });
            result.set_backward_op(op);
        }
        result
    }

    fn forward_parts(batch: &Array2<f32>) -> (f64, Vec<usize>, Vec<f64>) {
        let nearest = Self::pairwise_nearest(batch);
        let n = batch.nrows();

        let mut distances = Vec::with_capacity(n);
        let mut acc = 0.0f64;
        for (i, &j) in nearest.iter().enumerate() {
            let dist: f64 = batch
                .row(i)
                .iter()
                .zip(batch.row(j).iter())
                .map(|(&a, &b)| {
                    let diff = a as f64 - b as f64;
                    diff * diff
                })
                .sum::<f64>()
                .sqrt();
            distances.push(dist);
            acc += (dist + KOLEO_EPS).ln();
        }
        (-acc / n as f64, nearest, distances)
    }
}

struct KoleoBackward {
    batch: Tensor,
    grad: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for KoleoBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            self.batch.accumulate_grad(&self.grad * grad_output[0]);
        }
        if let Some(op) = self.batch.backward_op() {
            op.backward();
        }
    }
}
