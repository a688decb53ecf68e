//! Row-wise L2 normalization

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

const NORM_EPS: f32 = 1e-12;

/// Normalize each row of a (rows × width) tensor to unit L2 norm.
///
/// Rows with near-zero norm are divided by `1e-12` instead, matching the
/// usual clamped-denominator convention.
pub fn l2_normalize_rows(input: &Tensor, rows: usize, width: usize) -> Tensor {
    assert_eq!(
        input.len(),
        rows * width,
        "l2_normalize_rows: tensor has {} elements, expected {}x{}",
        input.len(),
        rows,
        width
    );

    let data = input.data();
    let mut out = vec![0.0f32; rows * width];
    let mut norms = vec![0.0f32; rows];
    for r in 0..rows {
        let row = data.slice(ndarray::s![r * width..(r + 1) * width]);
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPS);
        norms[r] = norm;
        for c in 0..width {
            out[r * width + c] = row[c] / norm;
        }
    }

    let normalized = Array1::from(out);
    let mut result = Tensor::new(normalized.clone(), input.requires_grad());
    if input.requires_grad() {
        let op = Rc::new(L2NormalizeBackward {
            input: input.clone(),
            normalized,
            norms,
            rows,
            width,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

struct L2NormalizeBackward {
    input: Tensor,
    normalized: Array1<f32>,
    norms: Vec<f32>,
    rows: usize,
    width: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for L2NormalizeBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let w = self.width;
            let mut grad_input = Array1::zeros(self.input.len());
            for r in 0..self.rows {
                let g = grad.slice(ndarray::s![r * w..(r + 1) * w]);
                let y = self.normalized.slice(ndarray::s![r * w..(r + 1) * w]);
                // d(x/||x||)/dx projects the gradient onto the tangent of
                // the unit sphere: (g - (g·y) y) / ||x||
                let dot: f32 = g.iter().zip(y.iter()).map(|(a, b)| a * b).sum();
                let inv = 1.0 / self.norms[r];
                for c in 0..w {
                    grad_input[r * w + c] = (g[c] - dot * y[c]) * inv;
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
    fn test_rows_have_unit_norm() {
        let x = Tensor::from_vec(vec![3.0, 4.0, 0.0, 5.0], false);
        let y = l2_normalize_rows(&x, 2, 2);
        let d = y.data();
        assert_relative_eq!(d[0], 0.6);
        assert_relative_eq!(d[1], 0.8);
        assert_relative_eq!(d[2], 0.0);
        assert_relative_eq!(d[3], 1.0);
    }

    #[test]
    fn test_zero_row_stays_finite() {
        let x = Tensor::from_vec(vec![0.0, 0.0], false);
        let y = l2_normalize_rows(&x, 1, 2);
        assert!(y.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_gradient_is_tangent_to_unit_sphere() {
        let x = Tensor::from_vec(vec![3.0, 4.0], true);
        let mut y = l2_normalize_rows(&x, 1, 2);
        backward(&mut y, Some(Array1::from(vec![1.0, 0.0])));

        // the gradient must be orthogonal to the normalized output
        let g = x.grad().unwrap();
        let y_data = y.data();
        let dot = g[0] * y_data[0] + g[1] * y_data[1];
        assert_relative_eq!(dot, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let x_vals = [0.8f32, -0.3, 1.2];
        let seed = [0.25f32, -1.0, 0.5];
        let x = Tensor::from_vec(x_vals.to_vec(), true);
        let mut y = l2_normalize_rows(&x, 1, 3);
        backward(&mut y, Some(Array1::from(seed.to_vec())));
        let analytic = x.grad().unwrap();

        let f = |v: &[f32]| -> f32 {
            let norm = v.iter().map(|a| a * a).sum::<f32>().sqrt();
            v.iter().zip(&seed).map(|(a, s)| a / norm * s).sum()
        };
        let h = 1e-3f32;
        for i in 0..3 {
            let mut plus = x_vals;
            plus[i] += h;
            let mut minus = x_vals;
            minus[i] -= h;
            let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
            assert_relative_eq!(analytic[i], numeric, epsilon = 1e-2);
        }
    }
}
