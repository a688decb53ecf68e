//! Matrix multiplication over flat row-major tensors

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Multiply `a` (m×k, row-major) by `b` (k×n), producing m×n.
///
/// Dimensions are explicit because tensors are flat buffers.
pub fn matmul(a: &Tensor, b: &Tensor, m: usize, k: usize, n: usize) -> Tensor {
    assert_eq!(a.len(), m * k, "matmul: lhs has {} elements, expected {}x{}", a.len(), m, k);
    assert_eq!(b.len(), k * n, "matmul: rhs has {} elements, expected {}x{}", b.len(), k, n);

    let a_data = a.data().to_vec();
    let b_data = b.data().to_vec();
    let data = matmul_compute(&a_data, &b_data, m, k, n);

    let requires_grad = a.requires_grad() || b.requires_grad();
    let mut result = Tensor::new(Array1::from(data), requires_grad);
    if requires_grad {
        let op = Rc::new(MatmulBackward {
            a: a.clone(),
            b: b.clone(),
            m,
            k,
            n,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

fn matmul_compute(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            let out_row = &mut out[i * n..(i + 1) * n];
            for (o, &bv) in out_row.iter_mut().zip(b_row) {
                *o += a_ip * bv;
            }
        }
    }
    out
}

struct MatmulBackward {
    a: Tensor,
    b: Tensor,
    m: usize,
    k: usize,
    n: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for MatmulBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let (m, k, n) = (self.m, self.k, self.n);
            let grad_vec = grad.to_vec();

            // dL/dA = dL/dC · Bᵀ  (m×n by n×k)
            if self.a.requires_grad() {
                let b_data = self.b.data().to_vec();
                let mut grad_a = vec![0.0f32; m * k];
                for i in 0..m {
                    for p in 0..k {
                        let mut acc = 0.0f32;
                        for j in 0..n {
                            acc += grad_vec[i * n + j] * b_data[p * n + j];
                        }
                        grad_a[i * k + p] = acc;
                    }
                }
                self.a.accumulate_grad(Array1::from(grad_a));
            }

            // dL/dB = Aᵀ · dL/dC  (k×m by m×n)
            if self.b.requires_grad() {
                let a_data = self.a.data().to_vec();
                let mut grad_b = vec![0.0f32; k * n];
                for p in 0..k {
                    for i in 0..m {
                        let a_ip = a_data[i * k + p];
                        if a_ip == 0.0 {
                            continue;
                        }
                        for j in 0..n {
                            grad_b[p * n + j] += a_ip * grad_vec[i * n + j];
                        }
                    }
                }
                self.b.accumulate_grad(Array1::from(grad_b));
            }
        }
        if let Some(op) = self.a.backward_op() {
            op.backward();
        }
        if let Some(op) = self.b.backward_op() {
            op.backward();
        }
    }
}
