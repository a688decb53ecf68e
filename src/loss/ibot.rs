//! Masked-patch distillation loss

use ndarray::{Array1, Array2};
use std::cell::RefCell;
use std::rc::Rc;

use crate::autograd::{BackwardOp, Tensor};
use crate::loss::utils::{log_softmax, softmax};

/// Weighted soft cross-entropy over masked patch positions.
///
/// Each masked position carries a weight (1 / masked-count of its image, so
/// heavily masked images do not dominate). The result is
/// `Σ wᵢ·CEᵢ / Σ wᵢ`: scaling every weight by the same factor leaves the
/// loss unchanged. The caller scales by `1 / n_global_crops`.
#[derive(Debug, Clone)]
pub struct IbotPatchLoss {
    pub student_temp: f32,
}

impl IbotPatchLoss {
    pub fn new(student_temp: f32) -> Self {
        assert!(
            student_temp > 0.0 && student_temp.is_finite(),
            "student temperature must be positive, got {student_temp}"
        );
        Self { student_temp }
    }

    /// Aggregate the loss over the first `n_masked` rows of the student's
    /// patch-logit buffer.
    ///
    /// `student_logits` is flat (buffer_rows × K) with `buffer_rows >=
    /// n_masked` (the tail is preallocated padding); `teacher_probs` is
    /// (n_masked × K); `masks_weight` has one positive entry per masked
    /// position.
    pub fn forward(
        &self,
        student_logits: &Tensor,
        n_masked: usize,
        teacher_probs: &Array2<f32>,
        masks_weight: &[f32],
    ) -> Tensor {
        assert!(n_masked > 0, "no masked positions");
        let k = teacher_probs.ncols();
        assert_eq!(
            teacher_probs.nrows(),
            n_masked,
            "teacher has {} rows, expected {n_masked}",
            teacher_probs.nrows()
        );
        assert_eq!(
            masks_weight.len(),
            n_masked,
            "got {} mask weights for {n_masked} masked positions",
            masks_weight.len()
        );
        let buffer_rows = student_logits.len() / k;
        assert_eq!(
            student_logits.len(),
            buffer_rows * k,
            "student logits length {} is not a multiple of {k}",
            student_logits.len()
        );
        assert!(
            buffer_rows >= n_masked,
            "student buffer holds {buffer_rows} rows, need at least {n_masked}"
        );

        let weight_sum: f64 = masks_weight.iter().map(|&w| w as f64).sum();
        assert!(weight_sum > 0.0, "mask weights sum to zero");

        let temp = self.student_temp;
        let logits = student_logits.data();
        let track = student_logits.requires_grad();
        let mut grad = track.then(|| Array1::<f32>::zeros(student_logits.len()));

        let mut acc = 0.0f64;
        for i in 0..n_masked {
            let row_start = i * k;
            let row = logits.slice(ndarray::s![row_start..row_start + k]);
            let scaled = row.mapv(|v| v / temp);
            let lsm = log_softmax(scaled.view());
            let target = teacher_probs.row(i);

            let ce: f64 = target
                .iter()
                .zip(lsm.iter())
                .map(|(&t, &l)| -(t as f64) * (l as f64))
                .sum();
            acc += masks_weight[i] as f64 * ce;

            if let Some(grad) = grad.as_mut() {
                let probs = softmax(scaled.view());
                let scale = (masks_weight[i] as f64 / weight_sum) as f32 / temp;
                for c in 0..k {
                    grad[row_start + c] = (probs[c] - target[c]) * scale;
                }
            }
        }

        let mut result = Tensor::from_vec(vec![(acc / weight_sum) as f32], track);
        if let Some(grad) = grad {
            let op = Rc::new(IbotBackward {
                student_logits: student_logits.clone(),
                grad,
                result_grad: result.grad_cell(),
            });
            result.set_backward_op(op);
        }
        result
    }
}

struct IbotBackward {
    student_logits: Tensor,
    grad: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for IbotBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            self.student_logits.accumulate_grad(&self.grad * grad_output[0]);
        }
        if let Some(op) = self.student_logits.backward_op() {
            op.backward();
        }
    }
}
