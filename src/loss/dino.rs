//! Multi-crop class-token distillation loss

use ndarray::{Array1, Array2};
use std::cell::RefCell;
use std::rc::Rc;

use crate::autograd::{BackwardOp, Tensor};
use crate::loss::utils::{log_softmax, softmax};

/// Which crop groups a [`DinoLoss::forward`] call is pairing.
///
/// Global student crops are never scored against the teacher view of the
/// same augmentation index (the student would be predicting its own input);
/// local crops pair with every teacher crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropPairing {
    /// Student global crops vs. teacher global crops: skip equal indices
    GlobalToGlobal,
    /// Student local crops vs. teacher global crops: all pairs count
    LocalToGlobal,
}

/// Soft cross-entropy between student crop logits and centered teacher
/// distributions.
///
/// `forward` returns the SUM over counted (student crop, teacher crop)
/// pairs, each pair contributing its per-image mean; the caller divides by
/// the joint pair-term count so local and global contributions share one
/// normalization.
#[derive(Debug, Clone)]
pub struct DinoLoss {
    pub student_temp: f32,
}

impl DinoLoss {
    pub fn new(student_temp: f32) -> Self {
        assert!(
            student_temp > 0.0 && student_temp.is_finite(),
            "student temperature must be positive, got {student_temp}"
        );
        Self { student_temp }
    }

    /// Aggregate the loss over crop pairs.
    ///
    /// `student_logits` is flat (n_student_crops·batch_size × K) row-major,
    /// crop-major; `teacher_probs[j]` is the centered (batch_size × K)
    /// distribution for teacher crop `j`.
    pub fn forward(
        &self,
        student_logits: &Tensor,
        n_student_crops: usize,
        batch_size: usize,
        teacher_probs: &[Array2<f32>],
        pairing: CropPairing,
    ) -> Tensor {
        assert!(n_student_crops > 0, "no student crops");
        assert!(batch_size > 0, "empty batch");
        assert!(!teacher_probs.is_empty(), "no teacher crops");
        let k = teacher_probs[0].ncols();
        assert_eq!(
            student_logits.len(),
            n_student_crops * batch_size * k,
            "student logits have {} elements, expected {}x{}x{}",
            student_logits.len(),
            n_student_crops,
            batch_size,
            k
        );
        for (j, probs) in teacher_probs.iter().enumerate() {
            assert_eq!(
                probs.dim(),
                (batch_size, k),
                "teacher crop {j} has shape {:?}, expected ({batch_size}, {k})",
                probs.dim()
            );
        }
        if pairing == CropPairing::GlobalToGlobal {
            assert_eq!(
                n_student_crops,
                teacher_probs.len(),
                "global pairing needs matching crop counts"
            );
        }

        let temp = self.student_temp;
        let logits = student_logits.data();
        let track = student_logits.requires_grad();
        let mut grad = track.then(|| Array1::<f32>::zeros(student_logits.len()));

        let mut acc = 0.0f64;
        let mut n_pairs = 0usize;
        for i in 0..n_student_crops {
            for b in 0..batch_size {
                let row_start = (i * batch_size + b) * k;
                let row = logits.slice(ndarray::s![row_start..row_start + k]);
                let scaled = row.mapv(|v| v / temp);
                let lsm = log_softmax(scaled.view());
                let probs = grad.is_some().then(|| softmax(scaled.view()));

                for (j, teacher) in teacher_probs.iter().enumerate() {
                    if pairing == CropPairing::GlobalToGlobal && i == j {
                        continue;
                    }
                    let target = teacher.row(b);
                    let ce: f64 = target
                        .iter()
                        .zip(lsm.iter())
                        .map(|(&t, &l)| -(t as f64) * (l as f64))
                        .sum();
                    acc += ce / batch_size as f64;

                    if let (Some(grad), Some(probs)) = (grad.as_mut(), probs.as_ref()) {
                        let scale = 1.0 / (temp * batch_size as f32);
                        for c in 0..k {
                            grad[row_start + c] += (probs[c] - target[c]) * scale;
                        }
                    }
                }
            }
            if pairing == CropPairing::GlobalToGlobal {
                n_pairs += teacher_probs.len().saturating_sub(1);
            } else {
                n_pairs += teacher_probs.len();
            }
        }
        assert!(n_pairs > 0, "pairing produced no loss terms");

        let mut result = Tensor::from_vec(vec![acc as f32], track);
        if let Some(grad) = grad {
            let op = Rc::new(DinoBackward {
                student_logits: student_logits.clone(),
                grad,
                result_grad: result.grad_cell(),
            });
            result.set_backward_op(op);
        }
        result
    }
}

struct DinoBackward {
    student_logits: Tensor,
    grad: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for DinoBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            self.student_logits.accumulate_grad(&self.grad * grad_output[0]);
        }
        if let Some(op) = self.student_logits.backward_op() {
            op.backward();
        }
    }
}
