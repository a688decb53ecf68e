//! Tape-based automatic differentiation over flat f32 tensors
//!
//! Tensors are 1-D buffers with explicit row/column dimensions passed to each
//! operation. Gradients live in shared `Rc<RefCell<Option<Array1<f32>>>>`
//! cells so that loss aggregators can accumulate into the same storage the
//! optimizer later reads.

mod backward;
pub mod ops;
mod scaler;
mod tensor;

pub use backward::BackwardOp;
pub use scaler::GradScaler;
pub use tensor::Tensor;

use ndarray::Array1;

/// Run the backward pass from a terminal tensor.
///
/// Seeds the tensor's gradient with `grad_output` (ones when `None`, the
/// usual case for a scalar loss) and walks the recorded operation tape.
pub fn backward(tensor: &mut Tensor, grad_output: Option<Array1<f32>>) {
    let grad = grad_output.unwrap_or_else(|| Array1::ones(tensor.len()));
    assert_eq!(
        grad.len(),
        tensor.len(),
        "gradient length {} does not match tensor length {}",
        grad.len(),
        tensor.len()
    );
    tensor.set_grad(grad);
    if let Some(op) = tensor.backward_op() {
        op.backward();
    }
}

/// Deliver a zero gradient to an unused graph output.
///
/// Multi-consumer ops (`fanout`, `split_rows`) propagate to their input only
/// once every output has reported in; an output no loss consumes must still
/// be closed or the shared backward op stalls.
pub fn discard(tensor: &Tensor) {
    if !tensor.requires_grad() {
        return;
    }
    if let Some(op) = tensor.backward_op() {
        tensor.accumulate_grad(Array1::zeros(tensor.len()));
        op.backward();
    }
}
