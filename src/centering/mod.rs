//! Teacher output centering strategies
//!
//! The teacher's prototype logits must be turned into balanced target
//! distributions, otherwise the student collapses onto a handful of
//! prototypes. Two interchangeable strategies are provided: EMA softmax
//! centering and Sinkhorn-Knopp balanced assignment. Mutable state (the
//! running center) is threaded explicitly through [`CenterState`] so the
//! strategies themselves stay stateless and trivially shareable.

mod sinkhorn;
mod softmax;

pub use sinkhorn::SinkhornKnopp;
pub use softmax::SoftmaxCentering;

use ndarray::{Array1, Array2};

use crate::comm::Collective;
use crate::config::CenteringKind;

/// Running state owned by the caller, one per centered logit stream
/// (per head, and per resolution in Matryoshka mode).
#[derive(Debug, Clone, Default)]
pub struct CenterState {
    center: Option<Array1<f32>>,
}

impl CenterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The running center, once initialized by a strategy
    pub fn center(&self) -> Option<&Array1<f32>> {
        self.center.as_ref()
    }

    pub(crate) fn center_or_zeros(&self, k: usize) -> Array1<f32> {
        match &self.center {
            Some(c) => {
                assert_eq!(c.len(), k, "center has {} prototypes, logits have {k}", c.len());
                c.clone()
            }
            None => Array1::zeros(k),
        }
    }

    pub(crate) fn set(&mut self, center: Array1<f32>) {
        self.center = Some(center);
    }
}

/// Turn raw teacher logits into target distributions.
pub trait TeacherCentering {
    /// Center `logits` (rows = samples, cols = prototypes) at `teacher_temp`.
    /// Every returned row is a probability distribution. Cross-worker
    /// statistics go through `comm`.
    fn center(
        &self,
        logits: &Array2<f32>,
        teacher_temp: f32,
        state: &mut CenterState,
        comm: &dyn Collective,
    ) -> Array2<f32>;
}

/// Instantiate the strategy selected in the config
pub fn strategy_for(kind: CenteringKind, center_momentum: f32) -> Box<dyn TeacherCentering> {
    match kind {
        CenteringKind::Centering => Box::new(SoftmaxCentering::new(center_momentum)),
        CenteringKind::SinkhornKnopp => Box::new(SinkhornKnopp::default()),
    }
}
