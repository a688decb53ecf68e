//! Elementwise operations: add, scale, fused add-scaled

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Add two tensors elementwise
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add: length mismatch {} vs {}", a.len(), b.len());
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);
    if requires_grad {
        let op = Rc::new(AddScaledBackward {
            a: a.clone(),
            b: b.clone(),
            factor: 1.0,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

/// Compute `a + b * factor` in one op
pub fn add_scaled(a: &Tensor, b: &Tensor, factor: f32) -> Tensor {
    assert_eq!(a.len(), b.len(), "add_scaled: length mismatch {} vs {}", a.len(), b.len());
    let data = a.data() + b.data() * factor;
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);
    if requires_grad {
        let op = Rc::new(AddScaledBackward {
            a: a.clone(),
            b: b.clone(),
            factor,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

struct AddScaledBackward {
    a: Tensor,
    b: Tensor,
    factor: f32,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for AddScaledBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad * self.factor);
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

/// Scale a tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);
    if requires_grad {
        let op = Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(op);
    }
    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad * self.factor);
            }
        }
        if let Some(op) = self.a.backward_op() {
            op.backward();
        }
    }
}
